//! # Booking Coordinator
//!
//! Turns booking requests into capacity holds and commits. A booking reserves
//! capacity through the `CapacityLedger`, then either commits straight away
//! (payment already confirmed) or sits as a pending hold until it is
//! confirmed, cancelled, or expired by the hold reaper.
//!
//! Cancellation and expiry share one release path: the intent's
//! pending-to-released transition is a conditional store update, and only its
//! winner returns the capacity.

/// Booking lifecycle operations.
mod coordinator;
pub use coordinator::*;

/// Payment confirmation seam.
mod payment;
pub use payment::*;

/// Background expiry of lapsed holds.
mod reaper;
pub use reaper::*;

/// Requests, configuration and errors.
mod types;
pub use types::*;
