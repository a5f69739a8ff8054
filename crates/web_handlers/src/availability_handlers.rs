use actix_web::{HttpResponse, Result, web};
use availability_publisher::{AvailabilityAlerts, AvailabilityPublisher};
use booking_coordinator::BookingError;
use futures_util::StreamExt;
use validator::Validate;

use crate::api_types::{WatchRequest, WatchResponse};
use crate::handlers::parse_slot_key;

/// Current availability of a slot. Informational only; the booking call
/// decides whether capacity is really there.
pub async fn get_availability(
    publisher: web::Data<AvailabilityPublisher>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, BookingError> {
    let (resource_id, raw_slot) = path.into_inner();
    let slot_key = parse_slot_key(&raw_slot)?;
    let snapshot = publisher.current(&resource_id, &slot_key).await?;

    Ok(HttpResponse::Ok().json(snapshot))
}

/// Live availability as server-sent events, current state first
pub async fn stream_availability(
    publisher: web::Data<AvailabilityPublisher>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, BookingError> {
    let (resource_id, raw_slot) = path.into_inner();
    let slot_key = parse_slot_key(&raw_slot)?;
    let snapshots = publisher.subscribe(&resource_id, &slot_key).await?;
    log::debug!("Streaming availability of {}/{}", resource_id, slot_key);

    let events = snapshots.map(|snapshot| {
        serde_json::to_string(&snapshot)
            .map(|json| web::Bytes::from(format!("data: {}\n\n", json)))
            .map_err(actix_web::error::ErrorInternalServerError)
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events))
}

/// Asks to be notified when a closed slot opens up again
pub async fn watch_availability(
    alerts: web::Data<AvailabilityAlerts>,
    path: web::Path<(String, String)>,
    request: web::Json<WatchRequest>,
) -> Result<HttpResponse, BookingError> {
    request
        .validate()
        .map_err(|e| BookingError::Validation(e.to_string()))?;

    let (resource_id, raw_slot) = path.into_inner();
    let slot_key = parse_slot_key(&raw_slot)?;
    let changed = alerts
        .watch(&request.user_id, &resource_id, &slot_key)
        .await?;

    Ok(HttpResponse::Ok().json(WatchResponse {
        watching: true,
        changed,
    }))
}

/// Stops an availability alert
pub async fn unwatch_availability(
    alerts: web::Data<AvailabilityAlerts>,
    path: web::Path<(String, String)>,
    request: web::Json<WatchRequest>,
) -> Result<HttpResponse, BookingError> {
    let (resource_id, raw_slot) = path.into_inner();
    let slot_key = parse_slot_key(&raw_slot)?;
    let changed = alerts
        .unwatch(&request.user_id, &resource_id, &slot_key)
        .await;

    Ok(HttpResponse::Ok().json(WatchResponse {
        watching: false,
        changed,
    }))
}
