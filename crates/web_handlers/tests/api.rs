use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{App, test, web};
use async_trait::async_trait;
use availability_publisher::{AvailabilityAlerts, AvailabilityPublisher};
use booking_coordinator::{BookingCoordinator, HoldReaper, RecordedPayments};
use booking_store::{MemoryStore, SlotKey};
use capacity_ledger::CapacityLedger;
use chrono::Utc;
use matching_engine::{DriverDirectory, MatchingService};
use notification_services::NotificationDispatcher;
use serde_json::{Value, json};
use verification_pipeline::{
    DocumentSet, FaceMatchProvider, FaceMatchResult, OcrProvider, OcrResult, ProviderError,
    VerificationPipeline,
};
use web_handlers::configure;

struct ClearOcr;

#[async_trait]
impl OcrProvider for ClearOcr {
    async fn extract(&self, _documents: &DocumentSet) -> Result<OcrResult, ProviderError> {
        Ok(OcrResult {
            confidence: 0.93,
            blur_score: 0.05,
            extracted_name: Some("Nimal Perera".to_string()),
        })
    }
}

struct MatchingFace;

#[async_trait]
impl FaceMatchProvider for MatchingFace {
    async fn compare(
        &self,
        _selfie_ref: &str,
        _document_ref: &str,
    ) -> Result<FaceMatchResult, ProviderError> {
        Ok(FaceMatchResult {
            match_confidence: 0.91,
            liveness_passed: true,
        })
    }
}

struct Services {
    ledger: Arc<CapacityLedger>,
    publisher: Arc<AvailabilityPublisher>,
    alerts: Arc<AvailabilityAlerts>,
    directory: Arc<DriverDirectory>,
    pipeline: Arc<VerificationPipeline>,
    dispatcher: Arc<NotificationDispatcher>,
    coordinator: Arc<BookingCoordinator>,
    payments: Arc<RecordedPayments>,
    reaper: Arc<HoldReaper>,
}

const WEBHOOK_SECRET: &str = "whsec_test";

fn services() -> Services {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(CapacityLedger::new(store.clone(), None));
    let dispatcher = Arc::new(NotificationDispatcher::new(store.clone()));
    let publisher = Arc::new(AvailabilityPublisher::new(ledger.clone(), None));
    let alerts = Arc::new(AvailabilityAlerts::new(publisher.clone(), dispatcher.clone()));
    let directory = Arc::new(DriverDirectory::default());
    let pipeline = Arc::new(
        VerificationPipeline::new(Arc::new(ClearOcr), Arc::new(MatchingFace), None)
            .with_dispatcher(dispatcher.clone()),
    );
    let matching = Arc::new(MatchingService::new(
        directory.clone(),
        pipeline.clone(),
        None,
    ));
    let payments = Arc::new(RecordedPayments::new(Some(WEBHOOK_SECRET.to_string())));
    let coordinator = Arc::new(BookingCoordinator::new(
        store,
        ledger.clone(),
        dispatcher.clone(),
        matching,
        payments.clone(),
        None,
    ));
    let reaper = Arc::new(HoldReaper::new(coordinator.clone()));

    Services {
        ledger,
        publisher,
        alerts,
        directory,
        pipeline,
        dispatcher,
        coordinator,
        payments,
        reaper,
    }
}

macro_rules! app {
    ($services:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from($services.ledger.clone()))
                .app_data(web::Data::from($services.publisher.clone()))
                .app_data(web::Data::from($services.alerts.clone()))
                .app_data(web::Data::from($services.directory.clone()))
                .app_data(web::Data::from($services.pipeline.clone()))
                .app_data(web::Data::from($services.dispatcher.clone()))
                .app_data(web::Data::from($services.coordinator.clone()))
                .app_data(web::Data::from($services.payments.clone()))
                .app_data(web::Data::from($services.reaper.clone()))
                .service(web::scope("/api").configure(configure)),
        )
        .await
    };
}

fn slot_in(days: i64) -> String {
    (Utc::now().date_naive() + chrono::Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

fn key(slot: &str) -> SlotKey {
    slot.parse().unwrap()
}

fn booking_body(slot: &str, count: u32) -> Value {
    json!({
        "resource_id": "tour-ella",
        "slot_key": slot,
        "count": count,
        "requester_id": "traveller-7"
    })
}

#[actix_web::test]
async fn test_booking_lifecycle() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(14);

    let req = test::TestRequest::put()
        .uri(&format!("/api/slots/tour-ella/{}", slot))
        .set_json(json!({ "capacity_total": 10 }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status_tier"], "available");

    let req = test::TestRequest::post()
        .uri("/api/bookings")
        .set_json(booking_body(&slot, 2))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let booking: Value = test::read_body_json(resp).await;
    assert_eq!(booking["status"], "pending");
    let booking_id = booking["booking_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/api/availability/tour-ella/{}", slot))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["spots_left"], 8);

    // Nothing paid yet
    let req = test::TestRequest::post()
        .uri(&format!("/api/bookings/{}/confirm", booking_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "payment_not_confirmed");

    let req = test::TestRequest::post()
        .uri(&format!("/api/bookings/{}/payment", booking_id))
        .insert_header(("Authorization", "Bearer not-the-secret"))
        .set_json(json!({ "payment_reference": "pay_778" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri(&format!("/api/bookings/{}/payment", booking_id))
        .insert_header(("Authorization", format!("Bearer {}", WEBHOOK_SECRET)))
        .set_json(json!({ "payment_reference": "pay_778" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "committed");
    assert_eq!(services.payments.outstanding().await, 0);

    let req = test::TestRequest::post()
        .uri(&format!("/api/bookings/{}/confirm", booking_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "committed");

    let req = test::TestRequest::delete()
        .uri(&format!("/api/bookings/{}", booking_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "booking_committed");

    let req = test::TestRequest::get()
        .uri("/api/users/traveller-7/notifications")
        .to_request();
    let inbox: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(inbox["unread_count"], 2);
    assert_eq!(inbox["notifications"][0]["type"], "booking_held");
    assert_eq!(inbox["notifications"][1]["type"], "booking_confirmed");

    let req = test::TestRequest::post()
        .uri("/api/users/traveller-7/notifications/read-all")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["updated"], 2);

    let req = test::TestRequest::get()
        .uri("/api/users/traveller-7/notifications")
        .to_request();
    let inbox: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(inbox["unread_count"], 0);
}

#[actix_web::test]
async fn test_cancel_hold_is_idempotent() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(7);
    services
        .ledger
        .provision("tour-ella", &key(&slot), 4)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri("/api/bookings")
        .set_json(booking_body(&slot, 3))
        .to_request();
    let booking: Value = test::call_and_read_body_json(&app, req).await;
    let booking_id = booking["booking_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let req = test::TestRequest::delete()
            .uri(&format!("/api/bookings/{}", booking_id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "released");
        assert_eq!(body["release_reason"], "cancelled");
    }

    let req = test::TestRequest::get()
        .uri(&format!("/api/availability/tour-ella/{}", slot))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["spots_left"], 4);
}

#[actix_web::test]
async fn test_sold_out_returns_conflict_with_next_step() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(7);
    services
        .ledger
        .provision("tour-ella", &key(&slot), 1)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri("/api/bookings")
        .set_json(booking_body(&slot, 2))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "sold_out");
    assert!(body["next_step"].is_string());
    assert!(body["alternatives"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn test_validation_and_not_found() {
    let services = services();
    let app = app!(services);

    let req = test::TestRequest::post()
        .uri("/api/bookings")
        .set_json(booking_body(&slot_in(7), 0))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri("/api/availability/tour-ella/next-tuesday")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri(&format!("/api/availability/tour-ella/{}", slot_in(7)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get()
        .uri(&format!("/api/bookings/{}", uuid::Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri(&format!("/api/notifications/{}/read", uuid::Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_slot_cancel_blocks_bookings() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(7);
    services
        .ledger
        .provision("tour-ella", &key(&slot), 10)
        .await
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/slots/tour-ella/{}/cancel", slot))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status_tier"], "cancelled");

    let req = test::TestRequest::post()
        .uri("/api/bookings")
        .set_json(booking_body(&slot, 1))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "slot_cancelled");

    let req = test::TestRequest::post()
        .uri(&format!("/api/slots/tour-ella/{}/reopen", slot))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status_tier"], "available");
}

#[actix_web::test]
async fn test_watch_full_slot() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(7);
    let key = key(&slot);
    services.ledger.provision("tour-ella", &key, 1).await.unwrap();
    services.ledger.reserve("tour-ella", &key, 1).await.unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/availability/tour-ella/{}/watch", slot))
        .set_json(json!({ "user_id": "traveller-7" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["watching"], true);
    assert_eq!(body["changed"], true);
    assert_eq!(
        services.alerts.watchers_of("tour-ella", &key).await,
        vec!["traveller-7".to_string()]
    );

    let req = test::TestRequest::delete()
        .uri(&format!("/api/availability/tour-ella/{}/watch", slot))
        .set_json(json!({ "user_id": "traveller-7" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["watching"], false);
    assert_eq!(body["changed"], true);
}

#[actix_web::test]
async fn test_availability_stream_opens() {
    let services = services();
    let app = app!(services);
    let slot = slot_in(7);
    services
        .ledger
        .provision("tour-ella", &key(&slot), 3)
        .await
        .unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/availability/tour-ella/{}/stream", slot))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
}

#[actix_web::test]
async fn test_driver_verification_gates_matching() {
    let services = services();
    let app = app!(services);

    let req = test::TestRequest::post()
        .uri("/api/drivers")
        .set_json(json!({
            "id": "driver-nimal",
            "rating": 4.7,
            "experience_years": 6,
            "languages": ["Sinhala", "English"],
            "vehicle_type": "van",
            "cancellation_rate": 0.03,
            "seat_capacity": 8
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let match_body = json!({
        "trip_id": "trip-kandy",
        "constraints": { "language": "english", "passenger_count": 5 }
    });
    let req = test::TestRequest::post()
        .uri("/api/match")
        .set_json(&match_body)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert!(body["candidates"].as_array().unwrap().is_empty());

    let req = test::TestRequest::post()
        .uri("/api/verification/driver-nimal/documents")
        .set_json(json!({ "document_type": "license", "document_ref": "uploads/lic.jpg" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["stage"], "submitted");
    assert!(body["case_id"].is_string());

    let req = test::TestRequest::post()
        .uri("/api/verification/driver-nimal/ocr")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["stage"], "ocr_done");

    let req = test::TestRequest::post()
        .uri("/api/verification/driver-nimal/face")
        .set_json(json!({ "selfie_ref": "uploads/selfie.jpg" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["stage"], "face_done");

    let req = test::TestRequest::post()
        .uri("/api/verification/driver-nimal/risk")
        .set_json(json!({}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["stage"], "approved");

    let req = test::TestRequest::get()
        .uri("/api/verification/driver-nimal")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["stage"], "approved");

    let req = test::TestRequest::post()
        .uri("/api/match")
        .set_json(&match_body)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["trip_id"], "trip-kandy");
    assert_eq!(body["candidates"][0]["driver_id"], "driver-nimal");
    assert_eq!(body["candidates"][0]["score"], 1.0);

    // Case is approved, so a review is an illegal transition
    let req = test::TestRequest::post()
        .uri("/api/verification/driver-nimal/review")
        .set_json(json!({
            "operator_id": "ops-1",
            "decision": "reject",
            "reason": "second look"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[actix_web::test]
async fn test_health_reports_reaper() {
    let services = services();
    let app = app!(services);

    let req = test::TestRequest::get().uri("/api/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["reaper"]["backlog_len"], 0);
}
