//! # Availability Publisher
//!
//! Derives tiered availability views from the capacity ledger and pushes them
//! to observers. Store changes are debounced per slot so that a burst of
//! bookings produces a single update carrying the burst's final state.

/// "Notify me when available" watches.
pub mod alerts;
/// Per-slot snapshot streams.
pub mod publisher;
/// Tier thresholds and snapshot types.
pub mod tier;

pub use alerts::AvailabilityAlerts;
pub use publisher::{AvailabilityPublisher, PublisherConfig, SnapshotStream};
pub use tier::*;
