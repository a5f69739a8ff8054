//! # Web Handlers for the Booking Coordinator
//!
//! This crate provides the HTTP API of the booking coordinator: bookings,
//! slot administration, live availability, driver matching, verification
//! cases and notification inboxes. Every service is injected as
//! `web::Data`, and `configure` mounts the routes on a scope.

/// Request and response bodies
mod api_types;
pub use api_types::*;

/// Booking lifecycle handlers (create, get, confirm, cancel)
mod booking_handlers;
pub use booking_handlers::*;

/// Slot provisioning and cancellation handlers
mod slot_handlers;
pub use slot_handlers::*;

/// Availability snapshot, stream and alert handlers
mod availability_handlers;
pub use availability_handlers::*;

/// Driver registration and matching handlers
mod driver_handlers;
pub use driver_handlers::*;

/// Driver verification case handlers
mod verification_handlers;
pub use verification_handlers::*;

/// Inbox handlers
mod notification_handlers;
pub use notification_handlers::*;

/// Health check and shared helpers
mod handlers;
pub use handlers::*;

/// Route table
mod routes;
pub use routes::configure;
