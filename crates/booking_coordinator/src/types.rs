use std::sync::LazyLock;
use std::time::Duration;

use booking_store::{SlotKey, StoreError};
use capacity_ledger::LedgerError;
use chrono::Weekday;
use matching_engine::MatchingError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::payment::PaymentError;

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").expect("resource id pattern compiles")
});

/// Configuration for booking holds and the booking window
#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// How long an unconfirmed hold keeps its capacity (default: 15 minutes)
    pub hold_ttl: Duration,

    /// How often the reaper looks for lapsed holds (default: 30 seconds)
    pub reaper_interval: Duration,

    /// Minimum hours between booking and slot start (default: 24)
    pub minimum_notice_hours: i64,

    /// How many days ahead a slot can be booked (default: 60)
    pub advance_booking_days: i64,

    /// Days either side of a sold-out slot searched for alternatives (default: 3)
    pub alternate_search_days: i64,

    /// Weekdays slots can be booked on (default: every day)
    pub working_days: Vec<Weekday>,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(15 * 60), // 15 minutes
            reaper_interval: Duration::from_secs(30),
            minimum_notice_hours: 24,
            advance_booking_days: 60,
            alternate_search_days: 3,
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
        }
    }
}

/// Request structure for creating a booking
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBookingRequest {
    /// Tour departure, vehicle or driver being booked
    #[validate(custom(function = "validate_resource_id"))]
    pub resource_id: String,

    /// `YYYY-MM-DD` or `YYYY-MM-DD#<timeslot>`
    #[validate(length(min = 10, max = 32, message = "Slot key is required"))]
    pub slot_key: String,

    /// Seats or units requested
    #[validate(range(min = 1, max = 50, message = "Count must be between 1 and 50"))]
    pub count: u32,

    /// Who is booking
    #[validate(length(min = 1, max = 128, message = "Requester id is required"))]
    pub requester_id: String,
}

/// A nearby slot with enough room, offered when the requested one is sold out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateSlot {
    /// Alternate slot
    pub slot_key: SlotKey,
    /// Spots left when the suggestion was made
    pub spots_left: u32,
}

/// Custom error type for booking operations
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    /// Malformed request or outside the booking window
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not enough capacity left; nothing was reserved
    #[error("{reason}")]
    SoldOut {
        /// Human-readable reason
        reason: String,
        /// Nearby slots that still have room
        alternatives: Vec<AlternateSlot>,
    },

    /// Lost the optimistic race; the caller may retry
    #[error("Booking system busy: {0}")]
    Transient(String),

    /// Unknown booking
    #[error("Booking not found: {0}")]
    NotFound(Uuid),

    /// Committed bookings cannot be cancelled
    #[error("Booking {0} is committed and cannot be cancelled")]
    NotCancellable(Uuid),

    /// Confirmation arrived after the hold lapsed
    #[error("Hold for booking {0} has expired")]
    HoldExpired(Uuid),

    /// Booking already released
    #[error("Booking {0} was released and cannot be confirmed")]
    AlreadyReleased(Uuid),

    /// The payment gate has no confirmed payment for the hold
    #[error("Payment for booking {0} is not confirmed")]
    PaymentNotConfirmed(Uuid),

    /// Payment side error
    #[error(transparent)]
    Payment(#[from] PaymentError),

    /// Ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Matching error
    #[error(transparent)]
    Matching(#[from] MatchingError),
}

impl actix_web::ResponseError for BookingError {
    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        match self {
            BookingError::Validation(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "validation_error",
                "message": msg
            })),
            BookingError::SoldOut {
                reason,
                alternatives,
            } => {
                let next_step = if alternatives.is_empty() {
                    "Try a different date or a smaller party".to_string()
                } else {
                    let dates: Vec<String> =
                        alternatives.iter().map(|a| a.slot_key.to_string()).collect();
                    format!("Try one of: {}", dates.join(", "))
                };
                HttpResponse::Conflict().json(serde_json::json!({
                    "error": "sold_out",
                    "message": reason,
                    "next_step": next_step,
                    "alternatives": alternatives
                }))
            }
            BookingError::Transient(msg) => {
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "transient_error",
                    "message": msg,
                    "next_step": "Retry the request"
                }))
            }
            BookingError::NotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "booking_not_found",
                "message": self.to_string()
            })),
            BookingError::NotCancellable(_) => HttpResponse::Conflict().json(serde_json::json!({
                "error": "booking_committed",
                "message": self.to_string()
            })),
            BookingError::HoldExpired(_) => HttpResponse::Conflict().json(serde_json::json!({
                "error": "hold_expired",
                "message": self.to_string(),
                "next_step": "Create a new booking"
            })),
            BookingError::AlreadyReleased(_) => {
                HttpResponse::Conflict().json(serde_json::json!({
                    "error": "booking_released",
                    "message": self.to_string()
                }))
            }
            BookingError::PaymentNotConfirmed(_) => {
                HttpResponse::Conflict().json(serde_json::json!({
                    "error": "payment_not_confirmed",
                    "message": self.to_string(),
                    "next_step": "Complete payment before the hold expires"
                }))
            }
            BookingError::Payment(PaymentError::Unauthorized) => {
                HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": self.to_string()
                }))
            }
            BookingError::Payment(PaymentError::Unavailable(_)) => {
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "payment_unavailable",
                    "message": self.to_string(),
                    "next_step": "Retry the request"
                }))
            }
            BookingError::Ledger(err) => ledger_error_response(err),
            BookingError::Matching(err) => actix_web::ResponseError::error_response(err),
            BookingError::Store(_) => HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal_error",
                "message": "An internal error occurred"
            })),
        }
    }
}

/// Renders a ledger error for HTTP callers
pub fn ledger_error_response(err: &LedgerError) -> actix_web::HttpResponse {
    use actix_web::HttpResponse;

    match err {
        LedgerError::Validation(msg) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": "validation_error",
            "message": msg
        })),
        LedgerError::SlotNotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "slot_not_found",
            "message": err.to_string()
        })),
        LedgerError::SlotCancelled(_) => HttpResponse::Conflict().json(serde_json::json!({
            "error": "slot_cancelled",
            "message": err.to_string(),
            "next_step": "Choose another departure"
        })),
        LedgerError::CapacityBelowBooked { .. } => {
            HttpResponse::Conflict().json(serde_json::json!({
                "error": "capacity_below_booked",
                "message": err.to_string()
            }))
        }
        LedgerError::Contention { .. } => {
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "transient_error",
                "message": err.to_string(),
                "next_step": "Retry the request"
            }))
        }
        LedgerError::Store(_) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "internal_error",
            "message": "An internal error occurred"
        })),
    }
}

/// Custom validation function for resource identifiers
fn validate_resource_id(resource_id: &str) -> Result<(), validator::ValidationError> {
    if RESOURCE_ID.is_match(resource_id) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_resource_id"))
    }
}
