//! # Matching Engine
//!
//! Ranks verified drivers against a trip request. Only drivers whose
//! verification case is approved are ever scored; the rest are filtered out
//! before ranking and never returned.

/// Registered driver profiles.
mod directory;
pub use directory::*;

/// Scoring and ranking.
mod engine;
pub use engine::*;

/// Ranking with verification stages refreshed from the pipeline.
mod service;
pub use service::*;

/// Profiles, constraints, weights and errors.
mod types;
pub use types::*;
