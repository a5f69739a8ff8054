use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Stage of a verification case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    /// Documents received
    Submitted,
    /// Waiting for a usable OCR read
    OcrPending,
    /// Document accepted
    OcrDone,
    /// Waiting for the face match
    FacePending,
    /// Face matched the document
    FaceDone,
    /// Risk assessment recorded
    RiskScored,
    /// Eligible for matching
    Approved,
    /// Not eligible
    Rejected,
    /// Waiting on a human operator
    ManualReview,
}

impl VerificationStage {
    /// Storage name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStage::Submitted => "submitted",
            VerificationStage::OcrPending => "ocr_pending",
            VerificationStage::OcrDone => "ocr_done",
            VerificationStage::FacePending => "face_pending",
            VerificationStage::FaceDone => "face_done",
            VerificationStage::RiskScored => "risk_scored",
            VerificationStage::Approved => "approved",
            VerificationStage::Rejected => "rejected",
            VerificationStage::ManualReview => "manual_review",
        }
    }

    /// Whether the case is closed
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationStage::Approved | VerificationStage::Rejected)
    }

    /// Whether `next` is a legal successor. Stages only move forward; the
    /// only sideways exits are to `manual_review` and out of it by an operator.
    pub fn can_transition_to(&self, next: VerificationStage) -> bool {
        use VerificationStage::*;

        matches!(
            (self, next),
            (Submitted, OcrPending)
                | (OcrPending, OcrDone)
                | (OcrPending, ManualReview)
                | (OcrDone, FacePending)
                | (FacePending, FaceDone)
                | (FacePending, ManualReview)
                | (FaceDone, RiskScored)
                | (RiskScored, Approved)
                | (RiskScored, Rejected)
                | (RiskScored, ManualReview)
                | (ManualReview, Approved)
                | (ManualReview, Rejected)
        )
    }
}

impl fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a case's audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    /// Stage before the transition
    pub from: VerificationStage,
    /// Stage after the transition
    pub to: VerificationStage,
    /// Why the transition happened
    pub note: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Marker left on a case whose external service call failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallMarker {
    /// Stage the case is parked at
    pub stage: VerificationStage,
    /// Failure description
    pub reason: String,
    /// When the failure happened
    pub at: DateTime<Utc>,
}

/// Documents submitted by a driver
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DocumentSet {
    /// Kind of identity document (license, passport, national id)
    #[validate(length(min = 1, max = 64, message = "Document type is required"))]
    pub document_type: String,

    /// Reference to the uploaded document image
    #[validate(length(min = 1, max = 2048, message = "Document reference is required"))]
    pub document_ref: String,

    /// Reference to the uploaded vehicle registration, if any
    #[validate(length(max = 2048))]
    pub registration_ref: Option<String>,
}

/// Boolean and numeric risk inputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskSignals {
    /// Document already used by another driver
    #[serde(default)]
    pub duplicate_document: bool,
    /// Known adverse history
    #[serde(default)]
    pub adverse_history: bool,
    /// Verification attempts in the recent window
    #[serde(default)]
    pub recent_attempts: u32,
}

/// Risk level buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Score at or below the low ceiling
    Low,
    /// Score at or below the medium ceiling
    Medium,
    /// Anything above
    High,
}

/// Action a risk level maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    /// Approve the driver
    Allow,
    /// Hand the case to an operator
    Review,
    /// Reject the driver
    Suspend,
}

/// Output of risk scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Score in `[0, 100]`
    pub score: u32,
    /// Bucketed level
    pub level: RiskLevel,
    /// Resulting action
    pub action: RiskAction,
    /// Signals that contributed to the score
    pub flags: Vec<String>,
}

/// Operator decision on a case in manual review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Approve the driver
    Approve,
    /// Reject the driver
    Reject,
}

/// A driver's verification workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCase {
    /// Case identifier
    pub case_id: Uuid,
    /// Driver under verification
    pub driver_id: String,
    stage: VerificationStage,
    /// Submitted documents
    pub documents: DocumentSet,
    /// OCR retakes requested so far
    pub retake_count: u32,
    /// Whether the driver must upload a new document photo
    pub needs_retake: bool,
    /// Reason for the final decision or escalation
    pub decision_reason: Option<String>,
    /// Risk assessment, once scored
    pub risk: Option<RiskAssessment>,
    /// Set while an external service failure blocks the case
    pub stalled: Option<StallMarker>,
    /// External service failures since the last successful call
    pub consecutive_failures: u32,
    /// When the case was opened
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    log: Vec<StageTransition>,
}

impl VerificationCase {
    /// Opens a case at `submitted`
    pub fn new(driver_id: impl Into<String>, documents: DocumentSet) -> Self {
        let now = Utc::now();
        Self {
            case_id: Uuid::new_v4(),
            driver_id: driver_id.into(),
            stage: VerificationStage::Submitted,
            documents,
            retake_count: 0,
            needs_retake: false,
            decision_reason: None,
            risk: None,
            stalled: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
            log: Vec::new(),
        }
    }

    /// Current stage
    pub fn stage(&self) -> VerificationStage {
        self.stage
    }

    /// Audit log, oldest first
    pub fn log(&self) -> &[StageTransition] {
        &self.log
    }

    /// Moves the case to `next`, appending to the log
    pub fn advance(
        &mut self,
        next: VerificationStage,
        note: impl Into<String>,
    ) -> Result<(), VerificationError> {
        if !self.stage.can_transition_to(next) {
            return Err(VerificationError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }

        let now = Utc::now();
        self.log.push(StageTransition {
            from: self.stage,
            to: next,
            note: note.into(),
            at: now,
        });
        self.stage = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Thresholds and weights of the verification workflow
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Minimum OCR confidence (default: 0.5)
    pub ocr_confidence_threshold: f64,

    /// OCR blur score must stay below this (default: 0.35)
    pub ocr_blur_limit: f64,

    /// Retakes before the case escalates to manual review (default: 3)
    pub max_retakes: u32,

    /// Minimum face match confidence (default: 0.8)
    pub face_match_threshold: f64,

    /// Bound on a single external service call (default: 10 seconds)
    pub provider_timeout: Duration,

    /// Consecutive service failures before the case degrades to manual
    /// review (default: 3)
    pub max_service_failures: u32,

    /// Weight of the duplicate-document flag (default: 50)
    pub duplicate_document_weight: u32,

    /// Weight of the adverse-history flag (default: 40)
    pub adverse_history_weight: u32,

    /// Weight of the attempt-velocity flag (default: 20)
    pub velocity_weight: u32,

    /// Recent attempts at which the velocity flag is raised (default: 3)
    pub velocity_threshold: u32,

    /// Weight of each OCR retake (default: 5)
    pub retake_weight: u32,

    /// Highest score still rated low (default: 40)
    pub low_risk_ceiling: u32,

    /// Highest score still rated medium (default: 70)
    pub medium_risk_ceiling: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            ocr_confidence_threshold: 0.5,
            ocr_blur_limit: 0.35,
            max_retakes: 3,
            face_match_threshold: 0.8,
            provider_timeout: Duration::from_secs(10),
            max_service_failures: 3,
            duplicate_document_weight: 50,
            adverse_history_weight: 40,
            velocity_weight: 20,
            velocity_threshold: 3,
            retake_weight: 5,
            low_risk_ceiling: 40,
            medium_risk_ceiling: 70,
        }
    }
}

impl VerificationConfig {
    /// Scores risk signals. The score is clamped to `[0, 100]`.
    pub fn assess(&self, signals: &RiskSignals, retake_count: u32) -> RiskAssessment {
        let mut score = 0u32;
        let mut flags = Vec::new();

        if signals.duplicate_document {
            score += self.duplicate_document_weight;
            flags.push("duplicate_document".to_string());
        }
        if signals.adverse_history {
            score += self.adverse_history_weight;
            flags.push("adverse_history".to_string());
        }
        if signals.recent_attempts >= self.velocity_threshold {
            score += self.velocity_weight;
            flags.push("attempt_velocity".to_string());
        }
        if retake_count > 0 {
            score = score.saturating_add(retake_count.saturating_mul(self.retake_weight));
            flags.push(format!("retakes:{}", retake_count));
        }

        let score = score.min(100);
        let (level, action) = if score <= self.low_risk_ceiling {
            (RiskLevel::Low, RiskAction::Allow)
        } else if score <= self.medium_risk_ceiling {
            (RiskLevel::Medium, RiskAction::Review)
        } else {
            (RiskLevel::High, RiskAction::Suspend)
        };

        RiskAssessment {
            score,
            level,
            action,
            flags,
        }
    }
}

/// Custom error type for verification operations
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Driver has no case
    #[error("No verification case for driver {0}")]
    CaseNotFound(String),

    /// Driver already has an open case
    #[error("Driver {0} already has an open verification case")]
    CaseOpen(String),

    /// Operation not allowed from the case's current stage
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current stage
        from: VerificationStage,
        /// Requested stage
        to: VerificationStage,
    },

    /// External service failure; the case is parked at `stage`
    #[error("Verification stalled at {stage}: {reason}")]
    Stalled {
        /// Stage the case is parked at
        stage: VerificationStage,
        /// Failure description
        reason: String,
    },

    /// Risk scoring rejected the driver
    #[error("Rejected by risk assessment: {reason}")]
    RiskRejected {
        /// Audit reason
        reason: String,
    },
}

impl actix_web::ResponseError for VerificationError {
    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        match self {
            VerificationError::Validation(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "validation_error",
                "message": msg
            })),
            VerificationError::CaseNotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "case_not_found",
                "message": self.to_string()
            })),
            VerificationError::CaseOpen(_) => HttpResponse::Conflict().json(serde_json::json!({
                "error": "case_open",
                "message": self.to_string()
            })),
            VerificationError::IllegalTransition { .. } => {
                HttpResponse::Conflict().json(serde_json::json!({
                    "error": "illegal_transition",
                    "message": self.to_string()
                }))
            }
            VerificationError::Stalled { .. } => {
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "verification_stalled",
                    "message": self.to_string(),
                    "next_step": "Retry later; the case keeps its current stage"
                }))
            }
            VerificationError::RiskRejected { reason } => {
                HttpResponse::UnprocessableEntity().json(serde_json::json!({
                    "error": "risk_rejected",
                    "message": reason,
                    "next_step": "Resubmit documents to open a new case"
                }))
            }
        }
    }
}
