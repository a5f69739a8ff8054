use actix_web::web;

use crate::availability_handlers::*;
use crate::booking_handlers::*;
use crate::driver_handlers::*;
use crate::handlers::health;
use crate::notification_handlers::*;
use crate::slot_handlers::*;
use crate::verification_handlers::*;

/// Mounts every API route. Expects the coordinator services, including
/// `RecordedPayments`, as `web::Data`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/bookings")
                .route("", web::post().to(create_booking))
                .route("/{booking_id}", web::get().to(get_booking))
                .route("/{booking_id}", web::delete().to(cancel_booking))
                .route("/{booking_id}/confirm", web::post().to(confirm_booking))
                .route("/{booking_id}/payment", web::post().to(record_payment)),
        )
        .service(
            web::scope("/slots")
                .route("/{resource_id}/{slot_key}", web::put().to(provision_slot))
                .route("/{resource_id}/{slot_key}/cancel", web::post().to(cancel_slot))
                .route("/{resource_id}/{slot_key}/reopen", web::post().to(reopen_slot)),
        )
        .service(
            web::scope("/availability")
                .route("/{resource_id}/{slot_key}", web::get().to(get_availability))
                .route(
                    "/{resource_id}/{slot_key}/stream",
                    web::get().to(stream_availability),
                )
                .route(
                    "/{resource_id}/{slot_key}/watch",
                    web::post().to(watch_availability),
                )
                .route(
                    "/{resource_id}/{slot_key}/watch",
                    web::delete().to(unwatch_availability),
                ),
        )
        .route("/drivers", web::post().to(register_driver))
        .route("/match", web::post().to(match_drivers))
        .service(
            web::scope("/verification/{driver_id}")
                .route("", web::get().to(get_case))
                .route("/documents", web::post().to(submit_documents))
                .route("/ocr", web::post().to(run_ocr))
                .route("/face", web::post().to(run_face_match))
                .route("/risk", web::post().to(score_risk))
                .route("/review", web::post().to(review_case)),
        )
        .route("/users/{user_id}/notifications", web::get().to(get_inbox))
        .route(
            "/users/{user_id}/notifications/read-all",
            web::post().to(mark_all_notifications_read),
        )
        .route(
            "/notifications/{notification_id}/read",
            web::post().to(mark_notification_read),
        );
}
