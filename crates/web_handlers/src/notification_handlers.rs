use actix_web::{HttpResponse, Result, web};
use notification_services::{NotificationDispatcher, NotificationError};
use uuid::Uuid;

use crate::api_types::{InboxResponse, MarkAllReadResponse};

/// Lists a user's inbox with the unread count
pub async fn get_inbox(
    dispatcher: web::Data<NotificationDispatcher>,
    path: web::Path<String>,
) -> Result<HttpResponse, NotificationError> {
    let notifications = dispatcher.inbox(&path.into_inner()).await?;
    let unread_count = notifications.iter().filter(|n| !n.read).count();

    Ok(HttpResponse::Ok().json(InboxResponse {
        notifications,
        unread_count,
    }))
}

/// Marks one notification read
pub async fn mark_notification_read(
    dispatcher: web::Data<NotificationDispatcher>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, NotificationError> {
    let notification = dispatcher.mark_read(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(notification))
}

/// Marks every notification of a user read
pub async fn mark_all_notifications_read(
    dispatcher: web::Data<NotificationDispatcher>,
    path: web::Path<String>,
) -> Result<HttpResponse, NotificationError> {
    let updated = dispatcher.mark_all_read(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(MarkAllReadResponse { updated }))
}
