use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::Validate;
use verification_pipeline::VerificationStage;

/// Weights of the driver score
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Bonus for speaking the requested language (default: 30)
    pub language_bonus: f64,

    /// Bonus for driving the requested vehicle type (default: 20)
    pub vehicle_type_bonus: f64,

    /// Points per rating star (default: 10)
    pub rating_weight: f64,

    /// Experience years counted at most (default: 10)
    pub experience_cap: u32,

    /// Penalty multiplied by the cancellation rate (default: 50)
    pub cancellation_penalty_weight: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            language_bonus: 30.0,
            vehicle_type_bonus: 20.0,
            rating_weight: 10.0,
            experience_cap: 10,
            cancellation_penalty_weight: 50.0,
        }
    }
}

/// Vehicle categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    /// Sedan, up to 3 passengers
    Sedan,
    /// SUV
    Suv,
    /// Van
    Van,
    /// Luxury car
    Luxury,
    /// Bus or coach
    Bus,
    /// Motorcycle
    Motorcycle,
}

impl VehicleType {
    /// Wire name of the vehicle type
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Sedan => "sedan",
            VehicleType::Suv => "suv",
            VehicleType::Van => "van",
            VehicleType::Luxury => "luxury",
            VehicleType::Bus => "bus",
            VehicleType::Motorcycle => "motorcycle",
        }
    }
}

/// A driver or guide candidate
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DriverProfile {
    /// Driver identifier
    #[validate(length(min = 1, max = 128, message = "Driver id is required"))]
    pub id: String,

    /// Verification stage as last known
    #[serde(default = "default_stage")]
    pub verification_stage: VerificationStage,

    /// Risk score from verification
    #[serde(default)]
    #[validate(range(max = 100))]
    pub risk_score: u32,

    /// Average rating, 0 to 5 stars
    #[validate(range(min = 0.0, max = 5.0, message = "Rating must be between 0 and 5"))]
    pub rating: f64,

    /// Years of driving experience
    #[serde(default)]
    pub experience_years: u32,

    /// Spoken languages
    #[serde(default)]
    pub languages: Vec<String>,

    /// Vehicle driven
    pub vehicle_type: VehicleType,

    /// Share of accepted trips later cancelled, 0 to 1
    #[serde(default)]
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "Cancellation rate must be between 0 and 1"
    ))]
    pub cancellation_rate: f64,

    /// Passenger seats, when known
    #[serde(default)]
    pub seat_capacity: Option<u32>,

    /// Days the driver is unavailable
    #[serde(default)]
    pub blocked_dates: Vec<NaiveDate>,
}

fn default_stage() -> VerificationStage {
    VerificationStage::Submitted
}

impl DriverProfile {
    /// Whether the driver speaks `language`, ignoring case
    pub fn speaks(&self, language: &str) -> bool {
        self.languages
            .iter()
            .any(|spoken| spoken.eq_ignore_ascii_case(language))
    }
}

/// Trip requirements a candidate is scored against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchConstraints {
    /// Preferred language
    #[serde(default)]
    pub language: Option<String>,
    /// Preferred vehicle type
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    /// Travelling party size
    #[serde(default)]
    pub passenger_count: u32,
    /// Trip date
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

/// Driver assignment request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MatchRequest {
    /// Trip being staffed
    #[validate(length(min = 1, max = 128, message = "Trip id is required"))]
    pub trip_id: String,

    /// Requirements
    #[serde(default)]
    pub constraints: MatchConstraints,

    /// Maximum candidates returned
    #[serde(default)]
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,
}

/// One ranked candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// Driver identifier
    pub driver_id: String,
    /// Score normalized to `[0, 1]`
    pub score: f64,
    /// Human-readable score contributions
    pub reasons: Vec<String>,
}

/// Custom error type for matching operations
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    /// Malformed request or profile
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown driver
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
}

impl actix_web::ResponseError for MatchingError {
    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        match self {
            MatchingError::Validation(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "validation_error",
                "message": msg
            })),
            MatchingError::DriverNotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "driver_not_found",
                "message": self.to_string()
            })),
        }
    }
}
