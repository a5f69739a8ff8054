use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::coordinator::BookingCoordinator;

/// Counters reported by the reaper
#[derive(Debug, Clone, Serialize)]
pub struct ReaperStats {
    /// Holds expired since start
    pub expired_total: u64,
    /// Backlogged releases settled since start
    pub backlog_settled_total: u64,
    /// Releases still waiting for a retry
    pub backlog_len: usize,
    /// When the last pass finished
    pub last_run: Option<DateTime<Utc>>,
}

/// Periodically expires lapsed holds and retries failed releases
pub struct HoldReaper {
    coordinator: Arc<BookingCoordinator>,
    expired_total: AtomicU64,
    backlog_settled_total: AtomicU64,
    last_run: RwLock<Option<DateTime<Utc>>>,
}

impl HoldReaper {
    /// Creates a reaper for `coordinator`
    pub fn new(coordinator: Arc<BookingCoordinator>) -> Self {
        Self {
            coordinator,
            expired_total: AtomicU64::new(0),
            backlog_settled_total: AtomicU64::new(0),
            last_run: RwLock::new(None),
        }
    }

    /// Runs forever, one pass every `reaper_interval`
    pub async fn start(&self) {
        let period = self.coordinator.config().reaper_interval;
        info!("Starting hold reaper, checking every {:?}", period);

        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            self.run_once(Utc::now()).await;
        }
    }

    /// One pass: expire holds due at `now`, then retry the release backlog.
    /// Returns how many holds were expired.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        let expired = match self.coordinator.expire_due_holds(now).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Error expiring holds: {}", e);
                0
            }
        };
        let settled = self.coordinator.retry_backlog().await;

        self.expired_total
            .fetch_add(expired as u64, Ordering::Relaxed);
        self.backlog_settled_total
            .fetch_add(settled as u64, Ordering::Relaxed);
        *self.last_run.write().await = Some(now);

        debug!("Reaper pass: {} expired, {} backlog settled", expired, settled);
        expired
    }

    /// Current counters
    pub async fn stats(&self) -> ReaperStats {
        ReaperStats {
            expired_total: self.expired_total.load(Ordering::Relaxed),
            backlog_settled_total: self.backlog_settled_total.load(Ordering::Relaxed),
            backlog_len: self.coordinator.backlog_len().await,
            last_run: *self.last_run.read().await,
        }
    }
}
