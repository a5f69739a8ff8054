//! # Verification Pipeline
//!
//! Per-driver identity and credential verification. Each driver has one open
//! `VerificationCase` that moves forward through document OCR, face match and
//! risk scoring; only approved drivers are eligible for matching.
//!
//! External OCR and face-match services are reached through the
//! `OcrProvider` and `FaceMatchProvider` traits. Their failures park the case
//! at its current stage instead of advancing or failing it.

/// Case store and stage operations.
pub mod pipeline;
/// External OCR and face-match services.
pub mod providers;
/// Stages, cases, risk model, configuration and errors.
pub mod types;

pub use pipeline::VerificationPipeline;
pub use providers::*;
pub use types::*;
