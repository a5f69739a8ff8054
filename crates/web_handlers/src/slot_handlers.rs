use actix_web::{HttpResponse, Result, web};
use availability_publisher::{AvailabilityPublisher, AvailabilitySnapshot};
use booking_coordinator::BookingError;
use capacity_ledger::CapacityLedger;
use validator::Validate;

use crate::api_types::ProvisionSlotRequest;
use crate::handlers::parse_slot_key;

/// Creates a slot or resizes it. Shrinking below what is already booked is
/// refused.
pub async fn provision_slot(
    ledger: web::Data<CapacityLedger>,
    publisher: web::Data<AvailabilityPublisher>,
    path: web::Path<(String, String)>,
    request: web::Json<ProvisionSlotRequest>,
) -> Result<HttpResponse, BookingError> {
    request
        .validate()
        .map_err(|e| BookingError::Validation(e.to_string()))?;

    let (resource_id, raw_slot) = path.into_inner();
    let slot_key = parse_slot_key(&raw_slot)?;
    let record = ledger
        .provision(&resource_id, &slot_key, request.capacity_total)
        .await?;
    log::info!(
        "Slot {} provisioned with capacity {}",
        record.slot_ref(),
        record.capacity_total
    );

    Ok(HttpResponse::Ok().json(AvailabilitySnapshot::from_record(
        &record,
        publisher.thresholds(),
    )))
}

/// Marks the resource cancelled; nothing more can be booked on the slot
pub async fn cancel_slot(
    ledger: web::Data<CapacityLedger>,
    publisher: web::Data<AvailabilityPublisher>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, BookingError> {
    set_cancelled(&ledger, &publisher, path.into_inner(), true).await
}

/// Clears the cancelled flag of a slot
pub async fn reopen_slot(
    ledger: web::Data<CapacityLedger>,
    publisher: web::Data<AvailabilityPublisher>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, BookingError> {
    set_cancelled(&ledger, &publisher, path.into_inner(), false).await
}

async fn set_cancelled(
    ledger: &CapacityLedger,
    publisher: &AvailabilityPublisher,
    (resource_id, raw_slot): (String, String),
    cancelled: bool,
) -> Result<HttpResponse, BookingError> {
    let slot_key = parse_slot_key(&raw_slot)?;
    let record = ledger
        .set_cancelled(&resource_id, &slot_key, cancelled)
        .await?;

    Ok(HttpResponse::Ok().json(AvailabilitySnapshot::from_record(
        &record,
        publisher.thresholds(),
    )))
}
