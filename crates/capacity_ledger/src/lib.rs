//! # Capacity Ledger
//!
//! Authoritative per-slot capacity accounting. Reservations and releases are
//! optimistic conditional writes against the booking store, retried with
//! jittered exponential backoff, so the booked count of a slot never exceeds
//! its capacity no matter how many coordinator instances race for it.

/// Ledger operations: reserve, release, provision and snapshots.
mod ledger;
pub use ledger::*;

/// Retry policy, reservation tokens, outcomes and errors.
mod types;
pub use types::*;
