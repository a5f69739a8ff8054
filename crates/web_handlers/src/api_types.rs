use booking_coordinator::ReaperStats;
use booking_store::{BookingIntent, BookingStatus, Notification, ReleaseReason, SlotKey};
use chrono::{DateTime, Utc};
use matching_engine::RankedCandidate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;
use verification_pipeline::{ReviewDecision, VerificationStage};

/// Response structure for a booking
#[derive(Debug, Serialize, Deserialize)]
pub struct BookingResponse {
    /// Booking identifier
    pub booking_id: Uuid,
    /// Booked resource
    pub resource_id: String,
    /// Booked slot
    pub slot_key: SlotKey,
    /// Units booked
    pub count: u32,
    /// Who booked
    pub requester_id: String,
    /// Lifecycle status
    pub status: BookingStatus,
    /// When an unconfirmed hold lapses
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Why the booking was released, if it was
    pub release_reason: Option<ReleaseReason>,
    /// When the booking was created
    pub created_at: DateTime<Utc>,
    /// When the booking last changed
    pub updated_at: DateTime<Utc>,
}

impl From<BookingIntent> for BookingResponse {
    fn from(intent: BookingIntent) -> Self {
        Self {
            booking_id: intent.id,
            resource_id: intent.resource_id,
            slot_key: intent.slot_key,
            count: intent.count,
            requester_id: intent.requester_id,
            status: intent.status,
            hold_expires_at: intent.hold_expires_at,
            release_reason: intent.release_reason,
            created_at: intent.created_at,
            updated_at: intent.updated_at,
        }
    }
}

/// Request structure for provisioning a slot
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ProvisionSlotRequest {
    /// New total capacity
    #[validate(range(max = 10000, message = "Capacity must be at most 10000"))]
    pub capacity_total: u32,
}

/// Request structure for availability alerts
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct WatchRequest {
    /// User to notify
    #[validate(length(min = 1, max = 128, message = "User id is required"))]
    pub user_id: String,
}

/// Response structure for availability alerts
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Whether the user is watching the slot after the call
    pub watching: bool,
    /// Whether this call changed anything
    pub changed: bool,
}

/// Response structure for driver registration
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterDriverResponse {
    /// Driver identifier
    pub driver_id: String,
    /// False when an existing profile was replaced
    pub created: bool,
}

/// Response structure for driver matching
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchResponse {
    /// Trip the candidates were ranked for
    pub trip_id: String,
    /// Candidates, best first
    pub candidates: Vec<RankedCandidate>,
}

/// Response structure for document submission
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitDocumentsResponse {
    /// Opened case
    pub case_id: Uuid,
    /// Stage of the new case
    pub stage: VerificationStage,
}

/// Request structure for a face match
#[derive(Debug, Serialize, Deserialize)]
pub struct FaceMatchRequest {
    /// Reference to the uploaded selfie
    pub selfie_ref: String,
}

/// Request structure for an operator review
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ReviewRequest {
    /// Deciding operator
    #[validate(length(min = 1, max = 128, message = "Operator id is required"))]
    pub operator_id: String,
    /// Approve or reject
    pub decision: ReviewDecision,
    /// Recorded with the decision
    #[validate(length(min = 1, max = 1000, message = "Reason is required"))]
    pub reason: String,
}

/// Payment confirmation sent by the payment provider
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    /// Provider's reference for the captured payment
    #[validate(length(min = 1, max = 128, message = "Payment reference is required"))]
    pub payment_reference: String,
}

/// Response structure for a user's inbox
#[derive(Debug, Serialize, Deserialize)]
pub struct InboxResponse {
    /// Notifications, oldest first
    pub notifications: Vec<Notification>,
    /// Notifications not yet read
    pub unread_count: usize,
}

/// Response structure for bulk read marking
#[derive(Debug, Serialize, Deserialize)]
pub struct MarkAllReadResponse {
    /// Notifications flipped by this call
    pub updated: usize,
}

/// Response structure for the health check
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "ok" when the server answers
    pub status: &'static str,
    /// Hold reaper counters
    pub reaper: ReaperStats,
}
