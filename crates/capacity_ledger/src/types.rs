use std::time::Duration;

use booking_store::{SlotKey, StoreError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded retry policy for optimistic writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Conditional-write attempts before giving up (default: 5)
    pub max_attempts: u32,

    /// Delay after the first version mismatch (default: 5 ms)
    pub base_delay: Duration,

    /// Upper bound for a single delay (default: 200 ms)
    pub max_delay: Duration,

    /// Randomize each delay between half and the full value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    /// Doubles each attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter {
            return delay;
        }

        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        let jittered = rand::rng().random_range(micros / 2..=micros);
        Duration::from_micros(jittered)
    }

    /// Attempts actually made; a zero budget still allows one try
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Proof of a successful reservation, consumed by `release`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    /// Token identifier; a token is released at most once
    pub id: Uuid,
    /// Reserved resource
    pub resource_id: String,
    /// Reserved slot
    pub slot_key: SlotKey,
    /// Units reserved
    pub count: u32,
}

/// Authoritative result of a reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Capacity was claimed
    Reserved(ReservationToken),
    /// Not enough capacity left
    SoldOut {
        /// Spots left when the attempt was rejected
        spots_left: u32,
    },
    /// Lost the optimistic race too many times
    Contention {
        /// Conditional writes attempted
        attempts: u32,
    },
}

/// Result of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Capacity was returned
    Released {
        /// Booked count after the release
        booked_count: u32,
    },
    /// The token is not outstanding (already consumed or never issued);
    /// nothing changed
    AlreadyReleased,
    /// Lost the optimistic race too many times; the token is still releasable
    Contention {
        /// Conditional writes attempted
        attempts: u32,
    },
}

/// Custom error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Slot has never been provisioned
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// Resource was cancelled, nothing can be reserved on it
    #[error("Slot cancelled: {0}")]
    SlotCancelled(String),

    /// Resize would drop capacity below what is already booked
    #[error("Capacity {requested} is below the {booked} units already booked")]
    CapacityBelowBooked {
        /// Requested capacity
        requested: u32,
        /// Units already booked
        booked: u32,
    },

    /// An administrative write lost the optimistic race too many times
    #[error("Contention on slot after {attempts} attempts")]
    Contention {
        /// Conditional writes attempted
        attempts: u32,
    },

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
