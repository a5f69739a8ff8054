use actix_web::{HttpResponse, Result, web};
use booking_coordinator::{BookingCoordinator, BookingError};
use matching_engine::{DriverDirectory, DriverProfile, MatchRequest, MatchingError};

use crate::api_types::{MatchResponse, RegisterDriverResponse};

/// Registers or replaces a driver profile
pub async fn register_driver(
    directory: web::Data<DriverDirectory>,
    request: web::Json<DriverProfile>,
) -> Result<HttpResponse, MatchingError> {
    let profile = request.into_inner();
    let driver_id = profile.id.clone();
    let created = directory.register(profile).await?;

    let response = RegisterDriverResponse { driver_id, created };
    if created {
        Ok(HttpResponse::Created().json(response))
    } else {
        Ok(HttpResponse::Ok().json(response))
    }
}

/// Ranks approved drivers for a trip
pub async fn match_drivers(
    coordinator: web::Data<BookingCoordinator>,
    request: web::Json<MatchRequest>,
) -> Result<HttpResponse, BookingError> {
    let candidates = coordinator.assign_drivers(&request).await?;

    Ok(HttpResponse::Ok().json(MatchResponse {
        trip_id: request.trip_id.clone(),
        candidates,
    }))
}
