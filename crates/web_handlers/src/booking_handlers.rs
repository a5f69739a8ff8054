use actix_web::{HttpRequest, HttpResponse, Result, web};
use booking_coordinator::{BookingCoordinator, BookingError, CreateBookingRequest, RecordedPayments};
use uuid::Uuid;
use validator::Validate;

use crate::api_types::{BookingResponse, RecordPaymentRequest};

/// Creates a booking. Returns 201 with the booking, committed or held
/// depending on payment state.
pub async fn create_booking(
    coordinator: web::Data<BookingCoordinator>,
    request: web::Json<CreateBookingRequest>,
) -> Result<HttpResponse, BookingError> {
    let intent = coordinator.create_booking(&request).await?;
    log::info!(
        "Booking {} created for {} ({:?})",
        intent.id,
        intent.requester_id,
        intent.status
    );

    Ok(HttpResponse::Created().json(BookingResponse::from(intent)))
}

/// Gets a booking by id
pub async fn get_booking(
    coordinator: web::Data<BookingCoordinator>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, BookingError> {
    let intent = coordinator.get_booking(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(BookingResponse::from(intent)))
}

/// Commits a held booking if its payment has been recorded
pub async fn confirm_booking(
    coordinator: web::Data<BookingCoordinator>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, BookingError> {
    let intent = coordinator.confirm_booking(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(BookingResponse::from(intent)))
}

/// Cancels a held booking
pub async fn cancel_booking(
    coordinator: web::Data<BookingCoordinator>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, BookingError> {
    let booking_id = path.into_inner();
    let intent = coordinator.cancel_booking(booking_id).await?;
    log::info!("Booking {} cancelled", booking_id);

    Ok(HttpResponse::Ok().json(BookingResponse::from(intent)))
}

/// Payment provider webhook: records the payment, then commits the hold.
/// Requires `Authorization: Bearer <webhook secret>`.
pub async fn record_payment(
    coordinator: web::Data<BookingCoordinator>,
    payments: web::Data<RecordedPayments>,
    req: HttpRequest,
    path: web::Path<Uuid>,
    request: web::Json<RecordPaymentRequest>,
) -> Result<HttpResponse, BookingError> {
    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    payments.authorize(presented)?;
    request
        .validate()
        .map_err(|e| BookingError::Validation(e.to_string()))?;

    let booking_id = path.into_inner();
    coordinator.get_booking(booking_id).await?;
    payments
        .record(booking_id, &request.payment_reference)
        .await;

    let intent = coordinator.confirm_booking(booking_id).await?;
    log::info!(
        "Payment {} settled booking {}",
        request.payment_reference,
        booking_id
    );

    Ok(HttpResponse::Ok().json(BookingResponse::from(intent)))
}
