use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use booking_store::{Notification, NotificationData, NotificationKind, SlotKey, SlotRef};
use capacity_ledger::LedgerError;
use futures_util::StreamExt;
use notification_services::NotificationDispatcher;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info};

use crate::publisher::{AvailabilityPublisher, SnapshotStream};
use crate::tier::*;

type Watchers = Arc<Mutex<HashMap<SlotRef, SlotWatch>>>;

/// Watchers of one slot and the handle keeping its watch task alive
struct SlotWatch {
    users: HashSet<String>,
    // Dropped with the entry, which ends the task
    stop: oneshot::Sender<()>,
}

/// Whether a tier change means the slot became bookable again
pub fn is_opening(previous: StatusTier, next: StatusTier) -> bool {
    previous.is_closed() && !next.is_closed()
}

/// "Notify me when available" watches on closed slots.
///
/// Every watcher of a slot gets one `availability_opened` notification each
/// time the slot moves from full or cancelled back to a bookable tier. A slot
/// is only followed while it has watchers: removing the last one ends its
/// task and lets the publisher retire the slot's topic.
pub struct AvailabilityAlerts {
    publisher: Arc<AvailabilityPublisher>,
    dispatcher: Arc<NotificationDispatcher>,
    watchers: Watchers,
}

impl AvailabilityAlerts {
    /// Creates the alert registry
    pub fn new(publisher: Arc<AvailabilityPublisher>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            publisher,
            dispatcher,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `user_id` as a watcher of a slot. Returns false when the
    /// user was already watching it.
    pub async fn watch(
        &self,
        user_id: &str,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<bool, LedgerError> {
        let slot = SlotRef::new(resource_id, *slot_key);
        let mut watchers = self.watchers.lock().await;

        if let Some(watch) = watchers.get_mut(&slot) {
            return Ok(watch.users.insert(user_id.to_string()));
        }

        let mut stream = self.publisher.subscribe(resource_id, slot_key).await?;
        // The first item is the state at subscription time.
        let Some(initial) = stream.next().await else {
            return Err(LedgerError::SlotNotFound(slot.to_string()));
        };
        let (stop, stopped) = oneshot::channel();
        watchers.insert(
            slot.clone(),
            SlotWatch {
                users: HashSet::from([user_id.to_string()]),
                stop,
            },
        );
        info!("Watching {} for openings", slot);

        tokio::spawn(watch_openings(
            slot,
            initial.status_tier,
            stream,
            stopped,
            self.watchers.clone(),
            self.dispatcher.clone(),
        ));
        Ok(true)
    }

    /// Removes a watcher. Returns false when the user was not watching.
    /// The slot stops being followed once its last watcher is gone.
    pub async fn unwatch(&self, user_id: &str, resource_id: &str, slot_key: &SlotKey) -> bool {
        let slot = SlotRef::new(resource_id, *slot_key);
        let mut watchers = self.watchers.lock().await;
        let Some(watch) = watchers.get_mut(&slot) else {
            return false;
        };
        if !watch.users.remove(user_id) {
            return false;
        }

        if watch.users.is_empty() {
            watchers.remove(&slot);
            info!("No watchers left on {}", slot);
        }
        true
    }

    /// Number of slots being followed for openings
    pub async fn watched_slots(&self) -> usize {
        self.watchers.lock().await.len()
    }

    /// Users currently watching a slot
    pub async fn watchers_of(&self, resource_id: &str, slot_key: &SlotKey) -> Vec<String> {
        let watchers = self.watchers.lock().await;
        let mut users: Vec<String> = watchers
            .get(&SlotRef::new(resource_id, *slot_key))
            .map(|watch| watch.users.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }
}

async fn watch_openings(
    slot: SlotRef,
    mut previous: StatusTier,
    mut stream: SnapshotStream,
    mut stopped: oneshot::Receiver<()>,
    watchers: Watchers,
    dispatcher: Arc<NotificationDispatcher>,
) {
    loop {
        let snapshot = tokio::select! {
            _ = &mut stopped => {
                debug!("Stopped watching {} for openings", slot);
                return;
            }
            next = stream.next() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
        };

        if is_opening(previous, snapshot.status_tier) {
            notify_watchers(&slot, &snapshot, &watchers, &dispatcher).await;
        }
        previous = snapshot.status_tier;
    }

    // The topic closed under us. Forget the slot so the next watch
    // subscribes afresh, unless a newer task already owns the entry.
    drop(stopped);
    let mut watchers = watchers.lock().await;
    if watchers.get(&slot).is_some_and(|watch| watch.stop.is_closed()) {
        watchers.remove(&slot);
        info!("Availability stream for {} ended, dropped its watchers", slot);
    }
}

async fn notify_watchers(
    slot: &SlotRef,
    snapshot: &AvailabilitySnapshot,
    watchers: &Watchers,
    dispatcher: &NotificationDispatcher,
) {
    let users: Vec<String> = {
        let watchers = watchers.lock().await;
        watchers
            .get(slot)
            .map(|watch| watch.users.iter().cloned().collect())
            .unwrap_or_default()
    };

    info!(
        "{} reopened with {} spots, notifying {} watchers",
        slot,
        snapshot.spots_left,
        users.len()
    );

    for user_id in users {
        let notification = Notification::new(
            user_id.as_str(),
            NotificationKind::AvailabilityOpened,
            "Spots available again",
            format!(
                "{} on {} has {} spots available",
                slot.resource_id, slot.slot_key, snapshot.spots_left
            ),
        )
        .with_data(NotificationData {
            resource_id: Some(slot.resource_id.clone()),
            slot_key: Some(slot.slot_key),
            ..NotificationData::default()
        });

        if let Err(e) = dispatcher.publish(notification).await {
            error!("Failed to notify {} about {}: {}", user_id, slot, e);
        }
    }
}
