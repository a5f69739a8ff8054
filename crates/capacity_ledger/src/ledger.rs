use std::sync::Arc;

use booking_store::{
    SlotKey, SlotRecord, SlotRef, SlotStore, SlotUpdate, StoreError, TokenChange, WriteOutcome,
};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::*;

/// Single writer-of-record for booked counts.
///
/// Every mutation is a versioned conditional write against the store, retried
/// under [`RetryPolicy`]. Nothing here takes a lock spanning more than one
/// slot, so bookings on different slots never wait on each other.
///
/// Reservation tokens live in the store next to the counters they account
/// for: issuing or consuming one is part of the same conditional write. The
/// ledger itself keeps no per-token state, so a restarted process still
/// refuses a second release.
pub struct CapacityLedger {
    store: Arc<dyn SlotStore>,
    policy: RetryPolicy,
}

enum Step<T> {
    Write(SlotUpdate, T),
    Done(T),
}

enum CasResult<T> {
    Applied(SlotRecord, T),
    Skipped(T),
    TokenNotOutstanding,
    Exhausted(u32),
}

impl CapacityLedger {
    /// Creates a ledger over `store`
    pub fn new(store: Arc<dyn SlotStore>, policy: Option<RetryPolicy>) -> Self {
        Self {
            store,
            policy: policy.unwrap_or_default(),
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claims `count` units of a slot.
    ///
    /// The returned outcome is the only authoritative answer to "did I get
    /// the capacity"; snapshots may be stale.
    pub async fn reserve(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        count: u32,
    ) -> Result<ReserveOutcome, LedgerError> {
        if count == 0 {
            return Err(LedgerError::Validation(
                "reservation count must be at least 1".to_string(),
            ));
        }

        let slot = SlotRef::new(resource_id, *slot_key);
        let token_id = Uuid::new_v4();
        let result = self
            .compare_and_swap(&slot, |current| {
                if current.cancelled {
                    return Err(LedgerError::SlotCancelled(slot.to_string()));
                }

                let spots_left = current.spots_left();
                if count > spots_left {
                    return Ok(Step::Done(spots_left));
                }

                Ok(Step::Write(
                    SlotUpdate {
                        booked_count: current.booked_count + count,
                        token: Some(TokenChange::Issue { token_id, count }),
                        ..SlotUpdate::from_record(current)
                    },
                    spots_left,
                ))
            })
            .await?;

        match result {
            CasResult::Applied(record, _) => {
                let token = ReservationToken {
                    id: token_id,
                    resource_id: resource_id.to_string(),
                    slot_key: *slot_key,
                    count,
                };

                info!(
                    "Reserved {} on {} ({}/{} booked)",
                    count, slot, record.booked_count, record.capacity_total
                );
                Ok(ReserveOutcome::Reserved(token))
            }
            CasResult::Skipped(spots_left) => {
                info!(
                    "Sold out: {} requested on {}, {} left",
                    count, slot, spots_left
                );
                Ok(ReserveOutcome::SoldOut { spots_left })
            }
            CasResult::TokenNotOutstanding => Err(LedgerError::Validation(format!(
                "store refused to issue token {}",
                token_id
            ))),
            CasResult::Exhausted(attempts) => {
                warn!("Reservation on {} gave up after {} attempts", slot, attempts);
                Ok(ReserveOutcome::Contention { attempts })
            }
        }
    }

    /// Returns the capacity claimed by `token`. Idempotent: the store
    /// consumes a token at most once, and a token that is not outstanding
    /// (already released, or never issued) changes nothing.
    pub async fn release(&self, token: &ReservationToken) -> Result<ReleaseOutcome, LedgerError> {
        let slot = SlotRef::new(token.resource_id.clone(), token.slot_key);
        let consume = TokenChange::Consume {
            token_id: token.id,
            count: token.count,
        };
        let result = self
            .compare_and_swap(&slot, |current| {
                Ok(Step::Write(
                    SlotUpdate {
                        booked_count: current.booked_count.saturating_sub(token.count),
                        token: Some(consume),
                        ..SlotUpdate::from_record(current)
                    },
                    (),
                ))
            })
            .await?;

        match result {
            CasResult::Applied(record, ()) => {
                info!(
                    "Released {} on {} ({}/{} booked)",
                    token.count, slot, record.booked_count, record.capacity_total
                );
                Ok(ReleaseOutcome::Released {
                    booked_count: record.booked_count,
                })
            }
            CasResult::Skipped(()) | CasResult::TokenNotOutstanding => {
                debug!("Token {} is not outstanding on {}", token.id, slot);
                Ok(ReleaseOutcome::AlreadyReleased)
            }
            CasResult::Exhausted(attempts) => {
                warn!(
                    "Release of token {} on {} gave up after {} attempts",
                    token.id, slot, attempts
                );
                Ok(ReleaseOutcome::Contention { attempts })
            }
        }
    }

    /// Read-only view of a slot. May be stale relative to concurrent writers.
    pub async fn snapshot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<SlotRecord, LedgerError> {
        self.store
            .read_slot(resource_id, slot_key)
            .await?
            .ok_or_else(|| {
                LedgerError::SlotNotFound(SlotRef::new(resource_id, *slot_key).to_string())
            })
    }

    /// Change stream of a slot, for derived views
    pub async fn watch(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> broadcast::Receiver<SlotRecord> {
        self.store.subscribe(resource_id, slot_key).await
    }

    /// Creates a slot or changes its total capacity
    pub async fn provision(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        capacity_total: u32,
    ) -> Result<SlotRecord, LedgerError> {
        match self
            .store
            .create_slot(resource_id, slot_key, capacity_total)
            .await
        {
            Ok(record) => {
                info!(
                    "Provisioned {} with capacity {}",
                    record.slot_ref(),
                    capacity_total
                );
                return Ok(record);
            }
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let result = self
            .compare_and_swap(&SlotRef::new(resource_id, *slot_key), |current| {
                if capacity_total < current.booked_count {
                    return Err(LedgerError::CapacityBelowBooked {
                        requested: capacity_total,
                        booked: current.booked_count,
                    });
                }
                if capacity_total == current.capacity_total {
                    return Ok(Step::Done(Some(current.clone())));
                }
                Ok(Step::Write(
                    SlotUpdate {
                        capacity_total,
                        ..SlotUpdate::from_record(current)
                    },
                    None,
                ))
            })
            .await?;

        self.finish_admin_write(result)
    }

    /// Sets or clears the resource-cancelled flag of a slot
    pub async fn set_cancelled(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        cancelled: bool,
    ) -> Result<SlotRecord, LedgerError> {
        let result = self
            .compare_and_swap(&SlotRef::new(resource_id, *slot_key), |current| {
                if current.cancelled == cancelled {
                    return Ok(Step::Done(Some(current.clone())));
                }
                Ok(Step::Write(
                    SlotUpdate {
                        cancelled,
                        ..SlotUpdate::from_record(current)
                    },
                    None,
                ))
            })
            .await?;

        let record = self.finish_admin_write(result)?;
        info!(
            "Slot {} cancelled flag set to {}",
            record.slot_ref(),
            cancelled
        );
        Ok(record)
    }

    fn finish_admin_write(
        &self,
        result: CasResult<Option<SlotRecord>>,
    ) -> Result<SlotRecord, LedgerError> {
        match result {
            CasResult::Applied(record, _) => Ok(record),
            CasResult::Skipped(Some(record)) => Ok(record),
            CasResult::Skipped(None) | CasResult::TokenNotOutstanding => Err(
                LedgerError::Validation("administrative write produced no record".to_string()),
            ),
            CasResult::Exhausted(attempts) => Err(LedgerError::Contention { attempts }),
        }
    }

    /// Read, decide, conditionally write; retried on version mismatch under
    /// the ledger's policy.
    async fn compare_and_swap<T, F>(
        &self,
        slot: &SlotRef,
        mut step: F,
    ) -> Result<CasResult<T>, LedgerError>
    where
        F: FnMut(&SlotRecord) -> Result<Step<T>, LedgerError>,
    {
        let max_attempts = self.policy.attempts();

        for attempt in 1..=max_attempts {
            let current = self
                .store
                .read_slot(&slot.resource_id, &slot.slot_key)
                .await?
                .ok_or_else(|| LedgerError::SlotNotFound(slot.to_string()))?;

            let (update, value) = match step(&current)? {
                Step::Done(value) => return Ok(CasResult::Skipped(value)),
                Step::Write(update, value) => (update, value),
            };

            match self
                .store
                .conditional_write(&slot.resource_id, &slot.slot_key, current.version, update)
                .await?
            {
                WriteOutcome::Written(record) => return Ok(CasResult::Applied(record, value)),
                WriteOutcome::TokenNotOutstanding => return Ok(CasResult::TokenNotOutstanding),
                WriteOutcome::VersionMismatch { current_version } => {
                    if attempt == max_attempts {
                        break;
                    }

                    // Another writer updated the slot between read and write.
                    // Retry from fresh state.
                    let delay = self.policy.backoff(attempt);
                    debug!(
                        "Lost CAS race on {} (read v{}, now v{}), attempt {}/{}, retrying in {:?}",
                        slot, current.version, current_version, attempt, max_attempts, delay
                    );
                    sleep(delay).await;
                }
            }
        }

        Ok(CasResult::Exhausted(max_attempts))
    }
}
