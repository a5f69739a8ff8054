//! # Booking Store
//!
//! This crate isolates every access to the shared persistent store behind the
//! `SlotStore`, `NotificationStore` and `IntentStore` traits, and provides the
//! data model the coordinator crates share. Two implementations are provided:
//! an in-memory store honouring the conditional-write contract, and a
//! PostgreSQL store.

/// PostgreSQL store and connection helpers.
pub mod database;
/// In-memory store used by tests and database-less deployments.
pub mod memory;
/// Shared data model: slots, booking intents and notifications.
pub mod models;
/// Store traits and errors.
pub mod store;

pub use database::{PgStore, create_connection_pool, test_connection};
pub use memory::MemoryStore;
pub use models::*;
pub use store::*;
