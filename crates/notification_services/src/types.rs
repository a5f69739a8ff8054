use async_trait::async_trait;
use booking_store::{Notification, StoreError};
use tracing::info;
use uuid::Uuid;

/// Errors raised by the notification dispatcher
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Inbox store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Unknown notification id
    #[error("Notification not found: {0}")]
    NotFound(Uuid),

    /// Mirror delivery failure
    #[error("Delivery channel error: {0}")]
    Channel(String),
}

impl actix_web::ResponseError for NotificationError {
    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        match self {
            NotificationError::NotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "notification_not_found",
                "message": "Notification not found"
            })),
            _ => HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal_error",
                "message": "An internal error occurred"
            })),
        }
    }
}

/// Trait for external mirrors of the inbox (email, SMS, push)
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    /// Delivers one notification, returning an external message id
    async fn deliver(&self, notification: &Notification) -> Result<String, NotificationError>;
}

/// Delivery channel that only writes the notification to the log
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<String, NotificationError> {
        info!(
            "[{}] {} -> {}: {}",
            notification.kind.as_str(),
            notification.title,
            notification.user_id,
            notification.message
        );
        Ok(format!("log-{}", notification.id))
    }
}
