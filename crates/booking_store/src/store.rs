use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::*;

/// Buffer size of each per-slot change channel
pub const SLOT_CHANNEL_CAPACITY: usize = 64;

/// Errors raised by store implementations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Slot does not exist
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// Record already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write would break `0 <= booked_count <= capacity_total`
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Store is unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded
    #[error("Data format error: {0}")]
    DataFormat(String),
}

impl From<ParseError> for StoreError {
    fn from(err: ParseError) -> Self {
        StoreError::DataFormat(err.to_string())
    }
}

/// Versioned capacity counters with conditional writes.
///
/// Implementations must give read-your-writes consistency on a single key and
/// apply `conditional_write` atomically. No cross-key transactions are needed.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Reads the current counters of a slot
    async fn read_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<Option<SlotRecord>, StoreError>;

    /// Creates a slot with zero bookings
    async fn create_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        capacity_total: u32,
    ) -> Result<SlotRecord, StoreError>;

    /// Writes `update` only if the stored version still equals `expected_version`
    async fn conditional_write(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        expected_version: u64,
        update: SlotUpdate,
    ) -> Result<WriteOutcome, StoreError>;

    /// Change stream for one slot. Every successful write is sent to it.
    async fn subscribe(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> broadcast::Receiver<SlotRecord>;
}

/// Per-user notification inboxes
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Appends a notification to its user's inbox
    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError>;

    /// All notifications of a user, oldest first
    async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>, StoreError>;

    /// Flips the read flag. Returns `None` for unknown ids.
    async fn mark_read(&self, notification_id: Uuid) -> Result<Option<Notification>, StoreError>;

    /// Flips every unread notification of a user, returning how many changed
    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError>;
}

/// Persistence for booking intents
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Stores a new intent
    async fn insert_intent(&self, intent: &BookingIntent) -> Result<(), StoreError>;

    /// Loads an intent by id
    async fn get_intent(&self, id: Uuid) -> Result<Option<BookingIntent>, StoreError>;

    /// Moves an intent from `expected` to `next` status.
    ///
    /// Returns the updated intent, or `None` when the stored status was not
    /// `expected` (someone else already transitioned it).
    async fn transition_intent(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
        reason: Option<ReleaseReason>,
    ) -> Result<Option<BookingIntent>, StoreError>;

    /// Pending intents whose hold expired at or before `now`
    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<BookingIntent>, StoreError>;
}

/// Validates a slot write against the capacity invariant
pub fn check_slot_update(slot: &SlotRef, update: &SlotUpdate) -> Result<(), StoreError> {
    if update.booked_count > update.capacity_total {
        return Err(StoreError::InvariantViolation(format!(
            "{}: booked {} exceeds capacity {}",
            slot, update.booked_count, update.capacity_total
        )));
    }
    Ok(())
}
