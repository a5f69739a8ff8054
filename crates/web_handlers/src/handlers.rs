use actix_web::{HttpResponse, Result, web};
use booking_coordinator::{BookingError, HoldReaper};
use booking_store::SlotKey;

use crate::api_types::HealthResponse;

/// Reports liveness and hold reaper counters
pub async fn health(reaper: web::Data<HoldReaper>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        reaper: reaper.stats().await,
    }))
}

/// Parses a slot key path segment (`2025-06-01` or `2025-06-01#morning`)
pub fn parse_slot_key(raw: &str) -> Result<SlotKey, BookingError> {
    raw.parse()
        .map_err(|e: booking_store::ParseError| BookingError::Validation(e.to_string()))
}
