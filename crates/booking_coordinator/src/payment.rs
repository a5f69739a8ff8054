use std::collections::HashMap;

use async_trait::async_trait;
use booking_store::BookingIntent;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from the payment side
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Payment status could not be read
    #[error("Payment status unavailable: {0}")]
    Unavailable(String),

    /// Confirmation sent without the shared webhook secret
    #[error("Payment confirmation not authorized")]
    Unauthorized,
}

/// Answers whether a booking has already been paid for.
///
/// The coordinator never talks to a payment processor itself. A booking
/// whose payment is not confirmed at creation becomes a hold, and
/// `BookingCoordinator::confirm_booking` asks again before committing it.
#[async_trait]
pub trait PaymentGate: Send + Sync {
    /// Whether payment for `intent` is confirmed
    async fn is_payment_confirmed(&self, intent: &BookingIntent) -> Result<bool, PaymentError>;

    /// Called once a booking is committed or released; the gate may drop
    /// whatever it kept for it.
    async fn settled(&self, _booking_id: Uuid) {}
}

/// Payment confirmations reported by the payment provider's webhook.
///
/// Only callers presenting the configured secret can record a payment.
/// Without a secret every confirmation is refused, so holds can only lapse.
pub struct RecordedPayments {
    webhook_secret: Option<String>,
    confirmed: RwLock<HashMap<Uuid, String>>,
}

impl RecordedPayments {
    /// Creates the registry. `webhook_secret` is the bearer token the
    /// payment provider sends.
    pub fn new(webhook_secret: Option<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.filter(|secret| !secret.is_empty()),
            confirmed: RwLock::new(HashMap::new()),
        }
    }

    /// Checks the bearer token presented with a confirmation
    pub fn authorize(&self, presented: Option<&str>) -> Result<(), PaymentError> {
        match (&self.webhook_secret, presented) {
            (Some(secret), Some(presented)) if secret == presented => Ok(()),
            (None, _) => {
                warn!("Payment confirmation refused: no webhook secret configured");
                Err(PaymentError::Unauthorized)
            }
            _ => Err(PaymentError::Unauthorized),
        }
    }

    /// Records that `booking_id` was paid under `payment_reference`
    pub async fn record(&self, booking_id: Uuid, payment_reference: &str) {
        info!(
            "Payment {} recorded for booking {}",
            payment_reference, booking_id
        );
        self.confirmed
            .write()
            .await
            .insert(booking_id, payment_reference.to_string());
    }

    /// Payment reference recorded for a booking that is not yet settled
    pub async fn reference_of(&self, booking_id: Uuid) -> Option<String> {
        self.confirmed.read().await.get(&booking_id).cloned()
    }

    /// Recorded payments whose booking is not yet settled
    pub async fn outstanding(&self) -> usize {
        self.confirmed.read().await.len()
    }
}

#[async_trait]
impl PaymentGate for RecordedPayments {
    async fn is_payment_confirmed(&self, intent: &BookingIntent) -> Result<bool, PaymentError> {
        Ok(self.confirmed.read().await.contains_key(&intent.id))
    }

    async fn settled(&self, booking_id: Uuid) {
        self.confirmed.write().await.remove(&booking_id);
    }
}
