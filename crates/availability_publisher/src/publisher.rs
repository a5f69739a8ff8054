use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use booking_store::{SlotKey, SlotRecord, SlotRef};
use capacity_ledger::{CapacityLedger, LedgerError};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::tier::*;

/// Snapshot stream handed to observers
pub type SnapshotStream = BoxStream<'static, AvailabilitySnapshot>;

type Topics = Arc<Mutex<HashMap<SlotRef, Arc<watch::Sender<AvailabilitySnapshot>>>>>;

/// Configuration for the availability publisher
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Changes arriving within this window of the first one are coalesced
    /// into a single update (default: 150 ms)
    pub coalesce_window: Duration,

    /// Tier thresholds
    pub thresholds: TierThresholds,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(150),
            thresholds: TierThresholds::default(),
        }
    }
}

/// Pushes debounced availability snapshots to observers.
///
/// One background task per observed slot turns the store's change stream into
/// a `watch` channel shared by every subscriber of that slot. The task stops
/// once the last subscriber is gone.
pub struct AvailabilityPublisher {
    ledger: Arc<CapacityLedger>,
    config: PublisherConfig,
    topics: Topics,
}

impl AvailabilityPublisher {
    /// Creates a publisher reading through `ledger`
    pub fn new(ledger: Arc<CapacityLedger>, config: Option<PublisherConfig>) -> Self {
        Self {
            ledger,
            config: config.unwrap_or_default(),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Tier thresholds in use
    pub fn thresholds(&self) -> &TierThresholds {
        &self.config.thresholds
    }

    /// One-off snapshot read straight from the ledger
    pub async fn current(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<AvailabilitySnapshot, LedgerError> {
        let record = self.ledger.snapshot(resource_id, slot_key).await?;
        Ok(AvailabilitySnapshot::from_record(
            &record,
            &self.config.thresholds,
        ))
    }

    /// Stream of snapshots for one slot: the current snapshot first, then one
    /// per debounced change.
    pub async fn subscribe(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<SnapshotStream, LedgerError> {
        let receiver = self
            .topic_receiver(SlotRef::new(resource_id, *slot_key))
            .await?;

        Ok(futures_util::stream::unfold(
            (receiver, true),
            |(mut receiver, first)| async move {
                if !first && receiver.changed().await.is_err() {
                    return None;
                }
                let snapshot = receiver.borrow_and_update().clone();
                Some((snapshot, (receiver, false)))
            },
        )
        .boxed())
    }

    /// Number of slots with a running publishing task
    pub async fn active_topics(&self) -> usize {
        self.topics.lock().await.len()
    }

    async fn topic_receiver(
        &self,
        slot: SlotRef,
    ) -> Result<watch::Receiver<AvailabilitySnapshot>, LedgerError> {
        let mut topics = self.topics.lock().await;
        if let Some(sender) = topics.get(&slot) {
            return Ok(sender.subscribe());
        }

        // Listen before reading so a write between the two is not lost.
        let changes = self.ledger.watch(&slot.resource_id, &slot.slot_key).await;
        let record = self
            .ledger
            .snapshot(&slot.resource_id, &slot.slot_key)
            .await?;

        let (sender, receiver) = watch::channel(AvailabilitySnapshot::from_record(
            &record,
            &self.config.thresholds,
        ));
        let sender = Arc::new(sender);
        topics.insert(slot.clone(), sender.clone());

        info!("Publishing availability for {}", slot);
        let pump = SlotPump {
            slot,
            ledger: self.ledger.clone(),
            config: self.config.clone(),
            sender,
            topics: self.topics.clone(),
        };
        tokio::spawn(pump.run(changes));

        Ok(receiver)
    }
}

/// Debouncing bridge between one slot's change stream and its watch channel
struct SlotPump {
    slot: SlotRef,
    ledger: Arc<CapacityLedger>,
    config: PublisherConfig,
    sender: Arc<watch::Sender<AvailabilitySnapshot>>,
    topics: Topics,
}

impl SlotPump {
    async fn run(self, mut changes: broadcast::Receiver<SlotRecord>) {
        loop {
            let first = tokio::select! {
                received = changes.recv() => received,
                _ = self.sender.closed() => {
                    if self.retire().await {
                        return;
                    }
                    continue;
                }
            };

            let mut burst = Burst::default();
            let mut closed = false;
            match first {
                Ok(record) => burst.record(record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => burst.lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => closed = true,
            }

            let deadline = Instant::now() + self.config.coalesce_window;
            while !closed {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    received = changes.recv() => match received {
                        Ok(record) => burst.record(record),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => burst.lagged(skipped),
                        Err(broadcast::error::RecvError::Closed) => closed = true,
                    },
                }
            }

            if burst.needs_read {
                match self
                    .ledger
                    .snapshot(&self.slot.resource_id, &self.slot.slot_key)
                    .await
                {
                    Ok(record) => burst.record(record),
                    Err(e) => warn!("Failed to re-read {} after lag: {}", self.slot, e),
                }
            }

            if let Some(record) = burst.latest {
                self.emit(&record);
            }

            if closed {
                warn!("Change stream for {} closed", self.slot);
                self.topics.lock().await.remove(&self.slot);
                return;
            }
        }
    }

    fn emit(&self, record: &SlotRecord) {
        let snapshot = AvailabilitySnapshot::from_record(record, &self.config.thresholds);
        let sent = self.sender.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot.clone();
                true
            } else {
                false
            }
        });

        if sent {
            debug!(
                "{} now {:?} ({} left, v{})",
                self.slot, snapshot.status_tier, snapshot.spots_left, snapshot.version
            );
        }
    }

    /// Removes the topic if nobody subscribed in the meantime
    async fn retire(&self) -> bool {
        let mut topics = self.topics.lock().await;
        if self.sender.receiver_count() > 0 {
            return false;
        }
        topics.remove(&self.slot);
        debug!("Stopped publishing availability for {}", self.slot);
        true
    }
}

/// Changes collected during one coalescing window
#[derive(Default)]
struct Burst {
    latest: Option<SlotRecord>,
    needs_read: bool,
}

impl Burst {
    fn record(&mut self, record: SlotRecord) {
        // Change notifications may arrive out of order; keep the newest.
        if self
            .latest
            .as_ref()
            .is_none_or(|latest| record.version >= latest.version)
        {
            self.latest = Some(record);
        }
    }

    fn lagged(&mut self, skipped: u64) {
        debug!("Change stream lagged by {} updates", skipped);
        self.needs_read = true;
    }
}

#[cfg(test)]
mod tests {
    use booking_store::MemoryStore;
    use capacity_ledger::ReserveOutcome;
    use tokio::time::timeout;

    use super::*;

    fn key() -> SlotKey {
        "2025-09-01#morning".parse().unwrap()
    }

    async fn setup(capacity: u32, window: Duration) -> (Arc<CapacityLedger>, AvailabilityPublisher) {
        let ledger = Arc::new(CapacityLedger::new(Arc::new(MemoryStore::new()), None));
        ledger.provision("tour-1", &key(), capacity).await.unwrap();
        let publisher = AvailabilityPublisher::new(
            ledger.clone(),
            Some(PublisherConfig {
                coalesce_window: window,
                ..PublisherConfig::default()
            }),
        );
        (ledger, publisher)
    }

    #[tokio::test]
    async fn test_stream_starts_with_current_snapshot() {
        let (ledger, publisher) = setup(20, Duration::from_millis(20)).await;
        for _ in 0..17 {
            ledger.reserve("tour-1", &key(), 1).await.unwrap();
        }

        let stream = publisher.subscribe("tour-1", &key()).await.unwrap();
        tokio::pin!(stream);

        let first = timeout(Duration::from_millis(100), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.spots_left, 3);
        assert_eq!(first.status_tier, StatusTier::Limited);
    }

    #[tokio::test]
    async fn test_burst_is_coalesced_to_last_state() {
        let (ledger, publisher) = setup(10, Duration::from_millis(100)).await;
        let stream = publisher.subscribe("tour-1", &key()).await.unwrap();
        tokio::pin!(stream);
        assert_eq!(stream.next().await.unwrap().booked_count, 0);

        for _ in 0..5 {
            ledger.reserve("tour-1", &key(), 1).await.unwrap();
        }

        let update = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.booked_count, 5);
        assert_eq!(update.spots_left, 5);

        assert!(
            timeout(Duration::from_millis(300), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_last_seat_ends_full() {
        let (ledger, publisher) = setup(10, Duration::from_millis(20)).await;
        for _ in 0..9 {
            ledger.reserve("tour-1", &key(), 1).await.unwrap();
        }
        let stream = publisher.subscribe("tour-1", &key()).await.unwrap();
        tokio::pin!(stream);
        assert_eq!(stream.next().await.unwrap().status_tier, StatusTier::Limited);

        let won = ledger.reserve("tour-1", &key(), 1).await.unwrap();
        assert!(matches!(won, ReserveOutcome::Reserved(_)));
        let lost = ledger.reserve("tour-1", &key(), 1).await.unwrap();
        assert_eq!(lost, ReserveOutcome::SoldOut { spots_left: 0 });

        let update = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status_tier, StatusTier::Full);
        assert_eq!(
            publisher.current("tour-1", &key()).await.unwrap().status_tier,
            StatusTier::Full
        );
    }

    #[tokio::test]
    async fn test_cancellation_is_published() {
        let (ledger, publisher) = setup(10, Duration::from_millis(20)).await;
        let stream = publisher.subscribe("tour-1", &key()).await.unwrap();
        tokio::pin!(stream);
        stream.next().await.unwrap();

        ledger.set_cancelled("tour-1", &key(), true).await.unwrap();
        let update = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status_tier, StatusTier::Cancelled);
    }

    #[tokio::test]
    async fn test_subscribers_share_one_topic() {
        let (_ledger, publisher) = setup(10, Duration::from_millis(20)).await;
        let first = publisher.subscribe("tour-1", &key()).await.unwrap();
        let second = publisher.subscribe("tour-1", &key()).await.unwrap();
        assert_eq!(publisher.active_topics().await, 1);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_unknown_slot_is_an_error() {
        let (_ledger, publisher) = setup(10, Duration::from_millis(20)).await;
        let missing: SlotKey = "2030-01-01".parse().unwrap();
        assert!(matches!(
            publisher.subscribe("tour-1", &missing).await,
            Err(LedgerError::SlotNotFound(_))
        ));
        assert_eq!(publisher.active_topics().await, 0);
    }
}
