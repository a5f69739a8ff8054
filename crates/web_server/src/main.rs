//! Entry point for the booking coordinator server.
//! Wires the stores and services together and serves the REST API.

mod config;
mod reaper_manager;

use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, middleware::Logger, web};
use anyhow::Context;
use availability_publisher::{AvailabilityAlerts, AvailabilityPublisher};
use booking_coordinator::{BookingCoordinator, HoldReaper, RecordedPayments};
use booking_store::database::{PgStore, create_connection_pool, test_connection};
use booking_store::{IntentStore, MemoryStore, NotificationStore, SlotStore};
use capacity_ledger::CapacityLedger;
use matching_engine::{DriverDirectory, MatchingService};
use notification_services::{LogChannel, NotificationDispatcher};
use verification_pipeline::{
    FaceMatchProvider, HttpFaceMatchClient, HttpOcrClient, OcrProvider, UnconfiguredProvider,
    VerificationPipeline,
};
use web_handlers::configure;

use crate::config::ServerConfig;
use crate::reaper_manager::ReaperManager;

struct Stores {
    slots: Arc<dyn SlotStore>,
    notifications: Arc<dyn NotificationStore>,
    intents: Arc<dyn IntentStore>,
}

async fn open_stores(config: &ServerConfig) -> anyhow::Result<Stores> {
    let Some(ref database_url) = config.database_url else {
        log::warn!("DATABASE_URL not set, bookings are kept in memory only");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            slots: store.clone(),
            notifications: store.clone(),
            intents: store,
        });
    };

    let pool = create_connection_pool(database_url)
        .await
        .context("Failed to create database pool")?;
    test_connection(&pool)
        .await
        .context("Database connection test failed")?;

    let store = Arc::new(PgStore::new(pool));
    store.migrate().await.context("Failed to apply schema")?;
    // Runs for the life of the process.
    store
        .spawn_change_listener()
        .await
        .context("Failed to listen for slot changes")?;
    log::info!("Database store ready");

    Ok(Stores {
        slots: store.clone(),
        notifications: store.clone(),
        intents: store,
    })
}

fn verification_providers(
    config: &ServerConfig,
) -> anyhow::Result<(Arc<dyn OcrProvider>, Arc<dyn FaceMatchProvider>)> {
    let ocr: Arc<dyn OcrProvider> = match config.ocr_service_url {
        Some(ref url) => Arc::new(HttpOcrClient::new(
            url.as_str(),
            config.verification_api_key.clone(),
            config.provider_timeout,
        )?),
        None => {
            log::warn!("OCR_SERVICE_URL not set, OCR checks will stall to manual review");
            Arc::new(UnconfiguredProvider)
        }
    };

    let face: Arc<dyn FaceMatchProvider> = match config.face_service_url {
        Some(ref url) => Arc::new(HttpFaceMatchClient::new(
            url.as_str(),
            config.verification_api_key.clone(),
            config.provider_timeout,
        )?),
        None => {
            log::warn!("FACE_MATCH_SERVICE_URL not set, face checks will stall to manual review");
            Arc::new(UnconfiguredProvider)
        }
    };

    Ok((ocr, face))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("Starting booking coordinator server...");
    let config = ServerConfig::from_env()?;
    let stores = open_stores(&config).await?;

    let ledger = Arc::new(CapacityLedger::new(stores.slots, None));
    let dispatcher = Arc::new(
        NotificationDispatcher::new(stores.notifications).with_channel(Arc::new(LogChannel)),
    );
    let publisher = Arc::new(AvailabilityPublisher::new(
        ledger.clone(),
        Some(config.publisher_config()),
    ));
    let alerts = Arc::new(AvailabilityAlerts::new(publisher.clone(), dispatcher.clone()));

    let (ocr, face) = verification_providers(&config)?;
    let pipeline = Arc::new(
        VerificationPipeline::new(ocr, face, Some(config.verification_config()))
            .with_dispatcher(dispatcher.clone()),
    );
    let directory = Arc::new(DriverDirectory::new());
    let matching = Arc::new(MatchingService::new(
        directory.clone(),
        pipeline.clone(),
        None,
    ));

    if config.payment_webhook_secret.is_none() {
        log::warn!("PAYMENT_WEBHOOK_SECRET not set, payment confirmations will be refused");
    }
    let payments = Arc::new(RecordedPayments::new(config.payment_webhook_secret.clone()));
    let coordinator = Arc::new(BookingCoordinator::new(
        stores.intents,
        ledger.clone(),
        dispatcher.clone(),
        matching,
        payments.clone(),
        Some(config.booking_config()),
    ));

    let reaper = Arc::new(HoldReaper::new(coordinator.clone()));
    let mut reaper_manager = ReaperManager::new(reaper.clone());
    reaper_manager.start();

    log::info!("Server will be available at: http://{}", config.bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::from(ledger.clone()))
            .app_data(web::Data::from(publisher.clone()))
            .app_data(web::Data::from(alerts.clone()))
            .app_data(web::Data::from(directory.clone()))
            .app_data(web::Data::from(pipeline.clone()))
            .app_data(web::Data::from(dispatcher.clone()))
            .app_data(web::Data::from(coordinator.clone()))
            .app_data(web::Data::from(payments.clone()))
            .app_data(web::Data::from(reaper.clone()))
            .wrap(Logger::default())
            .service(web::scope("/api").configure(configure))
            .route(
                "/health",
                web::get().to(|| async { HttpResponse::Ok().body("OK") }),
            )
    })
    .bind(&config.bind_addr)
    .with_context(|| format!("Failed to bind {}", config.bind_addr))?
    .run()
    .await?;

    let stats = reaper_manager.stats().await;
    reaper_manager.stop().await;
    log::info!(
        "Server stopped, {} holds expired and {} releases retried",
        stats.expired_total,
        stats.backlog_settled_total
    );
    Ok(())
}
