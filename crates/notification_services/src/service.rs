use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use booking_store::{Notification, NotificationStore, StoreError};
use futures_util::Stream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::*;

/// Buffer size of each per-user live channel
pub const INBOX_CHANNEL_CAPACITY: usize = 256;

/// Notification ids a subscription remembers for deduplication
const SEEN_CAPACITY: usize = 1024;

/// Appends notifications to user inboxes and fans them out to live
/// subscribers.
///
/// Delivery to subscribers is at-least-once: a publish retried with the same
/// notification id is broadcast again, and [`InboxSubscription`] drops the
/// duplicate.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    mirrors: Vec<Arc<dyn DeliveryChannel>>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher over an inbox store
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            channels: Mutex::new(HashMap::new()),
            mirrors: Vec::new(),
        }
    }

    /// Adds an external mirror. Mirror failures never fail a publish.
    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.mirrors.push(channel);
        self
    }

    /// Appends `notification` to its user's inbox, then pushes it to live
    /// subscribers and mirrors.
    pub async fn publish(&self, notification: Notification) -> Result<Notification, NotificationError> {
        match self.store.append_notification(&notification).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!("Notification {} already stored, re-broadcasting", notification.id);
            }
            Err(e) => return Err(e.into()),
        }

        {
            let channels = self.channels.lock().await;
            if let Some(sender) = channels.get(&notification.user_id) {
                // Nobody listening right now; the inbox still has it.
                let _ = sender.send(notification.clone());
            }
        }

        info!(
            "Published {} notification {} to user {}",
            notification.kind.as_str(),
            notification.id,
            notification.user_id
        );

        for mirror in &self.mirrors {
            if let Err(e) = mirror.deliver(&notification).await {
                warn!(
                    "Failed to mirror notification {} via {}: {}",
                    notification.id,
                    mirror.name(),
                    e
                );
            }
        }

        Ok(notification)
    }

    /// Opens a live view of a user's inbox. Unread notifications are replayed
    /// first, then new ones as they are published.
    pub async fn subscribe(&self, user_id: &str) -> Result<InboxSubscription, NotificationError> {
        // Subscribe before listing so nothing published in between is missed.
        let receiver = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(user_id.to_string())
                .or_insert_with(|| broadcast::channel(INBOX_CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let pending = self
            .store
            .list_notifications(user_id)
            .await?
            .into_iter()
            .filter(|n| !n.read)
            .collect();

        Ok(InboxSubscription {
            user_id: user_id.to_string(),
            store: self.store.clone(),
            receiver,
            pending,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        })
    }

    /// Every notification of a user, oldest first
    pub async fn inbox(&self, user_id: &str) -> Result<Vec<Notification>, NotificationError> {
        Ok(self.store.list_notifications(user_id).await?)
    }

    /// Unread notifications of a user, counted from the inbox itself
    pub async fn unread_count(&self, user_id: &str) -> Result<usize, NotificationError> {
        let inbox = self.store.list_notifications(user_id).await?;
        Ok(inbox.iter().filter(|n| !n.read).count())
    }

    /// Marks one notification read. Marking it again changes nothing.
    pub async fn mark_read(&self, notification_id: Uuid) -> Result<Notification, NotificationError> {
        self.store
            .mark_read(notification_id)
            .await?
            .ok_or(NotificationError::NotFound(notification_id))
    }

    /// Marks every notification of a user read, returning how many changed
    pub async fn mark_all_read(&self, user_id: &str) -> Result<usize, NotificationError> {
        let updated = self.store.mark_all_read(user_id).await?;
        debug!("Marked {} notifications read for user {}", updated, user_id);
        Ok(updated)
    }
}

/// Live, deduplicated view of one user's inbox
pub struct InboxSubscription {
    user_id: String,
    store: Arc<dyn NotificationStore>,
    receiver: broadcast::Receiver<Notification>,
    pending: VecDeque<Notification>,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
}

impl InboxSubscription {
    /// Waits for the next notification not yet yielded. Returns `None` once
    /// the dispatcher is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                if self.remember(notification.id) {
                    return Some(notification);
                }
                continue;
            }

            match self.receiver.recv().await {
                Ok(notification) => {
                    if self.remember(notification.id) {
                        return Some(notification);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Inbox subscription for {} lagged by {} notifications, replaying unread",
                        self.user_id, skipped
                    );
                    self.replay_unread().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a notification if one is ready without waiting
    pub fn try_next(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                if self.remember(notification.id) {
                    return Some(notification);
                }
                continue;
            }

            match self.receiver.try_recv() {
                Ok(notification) => {
                    if self.remember(notification.id) {
                        return Some(notification);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Converts the subscription into a stream
    pub fn into_stream(self) -> impl Stream<Item = Notification> {
        futures_util::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|notification| (notification, subscription))
        })
    }

    async fn replay_unread(&mut self) {
        match self.store.list_notifications(&self.user_id).await {
            Ok(inbox) => self.pending.extend(inbox.into_iter().filter(|n| !n.read)),
            Err(e) => warn!("Failed to replay inbox for {}: {}", self.user_id, e),
        }
    }

    /// Records `id`, returning false when it was already yielded
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }

        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use booking_store::{MemoryStore, NotificationKind};
    use futures_util::StreamExt;

    use super::*;

    fn dispatcher() -> NotificationDispatcher {
        NotificationDispatcher::new(Arc::new(MemoryStore::new()))
    }

    fn held(user_id: &str) -> Notification {
        Notification::new(
            user_id,
            NotificationKind::BookingHeld,
            "Booking held",
            "Your spot is held for 15 minutes",
        )
    }

    struct FailingChannel;

    #[async_trait]
    impl DeliveryChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _notification: &Notification) -> Result<String, NotificationError> {
            Err(NotificationError::Channel("smtp down".to_string()))
        }
    }

    struct CountingChannel(AtomicUsize);

    #[async_trait]
    impl DeliveryChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _notification: &Notification) -> Result<String, NotificationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("mock-id".to_string())
        }
    }

    #[tokio::test]
    async fn test_subscription_replays_unread_then_live() {
        let dispatcher = dispatcher();
        let first = dispatcher.publish(held("u1")).await.unwrap();
        let read = dispatcher.publish(held("u1")).await.unwrap();
        dispatcher.mark_read(read.id).await.unwrap();

        let mut subscription = dispatcher.subscribe("u1").await.unwrap();
        assert_eq!(subscription.next().await.unwrap().id, first.id);

        let live = dispatcher.publish(held("u1")).await.unwrap();
        assert_eq!(subscription.next().await.unwrap().id, live.id);
        assert!(subscription.try_next().is_none());
    }

    #[tokio::test]
    async fn test_redelivered_notification_is_yielded_once() {
        let dispatcher = dispatcher();
        let mut subscription = dispatcher.subscribe("u1").await.unwrap();

        let notification = held("u1");
        dispatcher.publish(notification.clone()).await.unwrap();
        dispatcher.publish(notification.clone()).await.unwrap();

        assert_eq!(subscription.next().await.unwrap().id, notification.id);
        assert!(subscription.try_next().is_none());
        assert_eq!(dispatcher.inbox("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unread_count_after_mark_all_read_is_zero() {
        let dispatcher = dispatcher();
        for _ in 0..3 {
            dispatcher.publish(held("u1")).await.unwrap();
        }
        dispatcher.publish(held("u2")).await.unwrap();
        assert_eq!(dispatcher.unread_count("u1").await.unwrap(), 3);

        assert_eq!(dispatcher.mark_all_read("u1").await.unwrap(), 3);
        assert_eq!(dispatcher.unread_count("u1").await.unwrap(), 0);
        assert_eq!(dispatcher.mark_all_read("u1").await.unwrap(), 0);
        assert_eq!(dispatcher.unread_count("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_is_monotonic() {
        let dispatcher = dispatcher();
        let notification = dispatcher.publish(held("u1")).await.unwrap();

        assert!(dispatcher.mark_read(notification.id).await.unwrap().read);
        assert!(dispatcher.mark_read(notification.id).await.unwrap().read);
        assert!(matches!(
            dispatcher.mark_read(Uuid::new_v4()).await,
            Err(NotificationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_fail_publish() {
        let counting = Arc::new(CountingChannel(AtomicUsize::new(0)));
        let dispatcher = dispatcher()
            .with_channel(Arc::new(FailingChannel))
            .with_channel(counting.clone())
            .with_channel(Arc::new(LogChannel));

        dispatcher.publish(held("u1")).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.unread_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let dispatcher = dispatcher();
        dispatcher.publish(held("u1")).await.unwrap();
        let stream = dispatcher.subscribe("u1").await.unwrap().into_stream();
        tokio::pin!(stream);

        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(first.is_some());
    }
}
