//! # Notification Services
//!
//! This crate provides the per-user notification inbox: notifications are
//! appended through the booking store, fanned out to live subscribers, and
//! optionally mirrored to external delivery channels.

/// Notification dispatcher and inbox subscriptions.
pub mod service;
/// Delivery channels and error types.
pub mod types;

pub use service::{InboxSubscription, NotificationDispatcher};
pub use types::{DeliveryChannel, LogChannel, NotificationError};
