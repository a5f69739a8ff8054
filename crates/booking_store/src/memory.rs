use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use crate::models::*;
use crate::store::*;

/// In-memory store honouring the same conditional-write contract as the
/// database. Used by tests and by the server when no `DATABASE_URL` is set.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct MemoryState {
    slots: Mutex<HashMap<SlotRef, SlotRecord>>,
    tokens: Mutex<HashMap<Uuid, (SlotRef, u32)>>,
    channels: Mutex<HashMap<SlotRef, broadcast::Sender<SlotRecord>>>,
    notifications: Mutex<Vec<Notification>>,
    intents: Mutex<HashMap<Uuid, BookingIntent>>,
    fail_writes: AtomicBool,
    version_mismatches: AtomicU64,
}

impl MemoryStore {
    /// Creates a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that sleeps before every slot read and write,
    /// which widens the window between read and conditional write
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Makes every slot write fail with `StoreError::Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of conditional writes rejected for a stale version
    pub fn version_mismatches(&self) -> u64 {
        self.state.version_mismatches.load(Ordering::SeqCst)
    }

    /// Reservation tokens issued and not yet consumed
    pub async fn outstanding_tokens(&self) -> usize {
        self.state.tokens.lock().await.len()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn broadcast(&self, record: &SlotRecord) {
        let channels = self.state.channels.lock().await;
        if let Some(sender) = channels.get(&record.slot_ref()) {
            // No receivers is fine; nobody is watching this slot right now.
            let _ = sender.send(record.clone());
        }
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn read_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<Option<SlotRecord>, StoreError> {
        self.simulate_latency().await;
        let slots = self.state.slots.lock().await;
        Ok(slots.get(&SlotRef::new(resource_id, *slot_key)).cloned())
    }

    async fn create_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        capacity_total: u32,
    ) -> Result<SlotRecord, StoreError> {
        self.check_failure()?;
        let slot = SlotRef::new(resource_id, *slot_key);

        let record = {
            let mut slots = self.state.slots.lock().await;
            if slots.contains_key(&slot) {
                return Err(StoreError::AlreadyExists(slot.to_string()));
            }

            let record = SlotRecord {
                resource_id: resource_id.to_string(),
                slot_key: *slot_key,
                capacity_total,
                booked_count: 0,
                cancelled: false,
                version: 0,
                updated_at: Utc::now(),
            };
            slots.insert(slot, record.clone());
            record
        };

        self.broadcast(&record).await;
        Ok(record)
    }

    async fn conditional_write(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        expected_version: u64,
        update: SlotUpdate,
    ) -> Result<WriteOutcome, StoreError> {
        self.simulate_latency().await;
        self.check_failure()?;
        let slot = SlotRef::new(resource_id, *slot_key);
        check_slot_update(&slot, &update)?;

        let record = {
            let mut slots = self.state.slots.lock().await;
            let current = slots
                .get_mut(&slot)
                .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?;

            if current.version != expected_version {
                self.state.version_mismatches.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Version mismatch on {}: expected {}, found {}",
                    slot, expected_version, current.version
                );
                return Ok(WriteOutcome::VersionMismatch {
                    current_version: current.version,
                });
            }

            // Slots lock first, then tokens
            let mut tokens = self.state.tokens.lock().await;
            match update.token {
                Some(TokenChange::Issue { token_id, count }) => {
                    tokens.insert(token_id, (slot.clone(), count));
                }
                Some(TokenChange::Consume { token_id, count }) => {
                    if tokens.get(&token_id) != Some(&(slot.clone(), count)) {
                        debug!("Token {} is not outstanding on {}", token_id, slot);
                        return Ok(WriteOutcome::TokenNotOutstanding);
                    }
                    tokens.remove(&token_id);
                }
                None => {}
            }

            current.booked_count = update.booked_count;
            current.capacity_total = update.capacity_total;
            current.cancelled = update.cancelled;
            current.version += 1;
            current.updated_at = Utc::now();
            current.clone()
        };

        self.broadcast(&record).await;
        Ok(WriteOutcome::Written(record))
    }

    async fn subscribe(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> broadcast::Receiver<SlotRecord> {
        let mut channels = self.state.channels.lock().await;
        channels
            .entry(SlotRef::new(resource_id, *slot_key))
            .or_insert_with(|| broadcast::channel(SLOT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut notifications = self.state.notifications.lock().await;
        if notifications.iter().any(|n| n.id == notification.id) {
            return Err(StoreError::AlreadyExists(notification.id.to_string()));
        }
        notifications.push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        let notifications = self.state.notifications.lock().await;
        Ok(notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, notification_id: Uuid) -> Result<Option<Notification>, StoreError> {
        let mut notifications = self.state.notifications.lock().await;
        Ok(notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .map(|n| {
                n.read = true;
                n.clone()
            }))
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut notifications = self.state.notifications.lock().await;
        let mut flipped = 0;
        for notification in notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read)
        {
            notification.read = true;
            flipped += 1;
        }
        Ok(flipped)
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn insert_intent(&self, intent: &BookingIntent) -> Result<(), StoreError> {
        let mut intents = self.state.intents.lock().await;
        if intents.contains_key(&intent.id) {
            return Err(StoreError::AlreadyExists(intent.id.to_string()));
        }
        intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<BookingIntent>, StoreError> {
        let intents = self.state.intents.lock().await;
        Ok(intents.get(&id).cloned())
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
        reason: Option<ReleaseReason>,
    ) -> Result<Option<BookingIntent>, StoreError> {
        let mut intents = self.state.intents.lock().await;
        let Some(intent) = intents.get_mut(&id) else {
            return Ok(None);
        };

        if intent.status != expected {
            return Ok(None);
        }

        intent.status = next;
        intent.release_reason = reason;
        intent.updated_at = Utc::now();
        if next.is_terminal() {
            intent.hold_expires_at = None;
        }
        Ok(Some(intent.clone()))
    }

    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<BookingIntent>, StoreError> {
        let intents = self.state.intents.lock().await;
        Ok(intents
            .values()
            .filter(|intent| intent.is_expired_at(now))
            .cloned()
            .collect())
    }
}
