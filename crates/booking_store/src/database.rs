use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::*;
use crate::store::*;

/// Postgres channel carrying slot change payloads
pub const SLOT_CHANGES_CHANNEL: &str = "slot_changes";

/// Schema applied by [`PgStore::migrate`]
pub const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

/// Creates a connection pool to the PostgreSQL database.
pub async fn create_connection_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

/// Tests the database connection by executing a simple query.
pub async fn test_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    let row = sqlx::query("SELECT 1 as test").fetch_one(pool).await?;

    let test_value: i32 = row.get("test");
    info!("Database connection successful, test value: {}", test_value);

    Ok(())
}

/// PostgreSQL-backed store. Slot changes are fanned out with `LISTEN/NOTIFY`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    changes_channel: String,
    channels: Arc<Mutex<HashMap<SlotRef, broadcast::Sender<SlotRecord>>>>,
}

impl PgStore {
    /// Wraps an existing pool. Call [`PgStore::spawn_change_listener`] to
    /// feed subscribers.
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, SLOT_CHANGES_CHANNEL)
    }

    /// Like [`PgStore::new`], announcing changes on `changes_channel`
    /// instead of [`SLOT_CHANGES_CHANNEL`]
    pub fn with_channel(pool: PgPool, changes_channel: impl Into<String>) -> Self {
        Self {
            pool,
            changes_channel: changes_channel.into(),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Applies the schema (idempotent)
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Starts the background task that forwards `NOTIFY` payloads to subscribers
    pub async fn spawn_change_listener(&self) -> Result<tokio::task::JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.changes_channel).await?;
        let channels = self.channels.clone();
        let changes_channel = self.changes_channel.clone();

        let handle = tokio::spawn(async move {
            info!("Listening for slot changes on '{}'", changes_channel);
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(e) => {
                        error!("Slot change listener failed: {}", e);
                        break;
                    }
                };

                let record: SlotRecord = match serde_json::from_str(notification.payload()) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Ignoring malformed slot change payload: {}", e);
                        continue;
                    }
                };

                let channels = channels.lock().await;
                if let Some(sender) = channels.get(&record.slot_ref()) {
                    let _ = sender.send(record);
                }
            }
        });

        Ok(handle)
    }

    /// Announces a committed slot write. The write already stands, so a
    /// failed `NOTIFY` only costs subscribers this change.
    async fn notify_change(&self, record: &SlotRecord) {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode change of {}: {}", record.slot_ref(), e);
                return;
            }
        };

        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.changes_channel)
            .bind(payload)
            .execute(&self.pool)
            .await
        {
            warn!(
                "Committed write to {} (v{}) was not announced: {}",
                record.slot_ref(),
                record.version,
                e
            );
        }
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::DataFormat(format!("negative value in {}: {}", column, value)))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::DataFormat(format!("value too large for {}: {}", column, value)))
}

fn slot_from_row(row: &PgRow) -> Result<SlotRecord, StoreError> {
    let slot_key: String = row.get("slot_key");
    let version: i64 = row.get("version");

    Ok(SlotRecord {
        resource_id: row.get("resource_id"),
        slot_key: slot_key.parse()?,
        capacity_total: to_u32(row.get("capacity_total"), "capacity_total")?,
        booked_count: to_u32(row.get("booked_count"), "booked_count")?,
        cancelled: row.get("cancelled"),
        version: u64::try_from(version)
            .map_err(|_| StoreError::DataFormat(format!("negative version: {}", version)))?,
        updated_at: row.get("updated_at"),
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    let kind: String = row.get("kind");
    let data: serde_json::Value = row.get("data");

    Ok(Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: kind.parse()?,
        title: row.get("title"),
        message: row.get("message"),
        data: serde_json::from_value(data).map_err(|e| StoreError::DataFormat(e.to_string()))?,
        created_at: row.get("created_at"),
        read: row.get("read"),
    })
}

fn intent_from_row(row: &PgRow) -> Result<BookingIntent, StoreError> {
    let slot_key: String = row.get("slot_key");
    let status: String = row.get("status");
    let release_reason: Option<String> = row.get("release_reason");

    Ok(BookingIntent {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        slot_key: slot_key.parse()?,
        count: to_u32(row.get("count"), "count")?,
        requester_id: row.get("requester_id"),
        status: status.parse()?,
        hold_expires_at: row.get("hold_expires_at"),
        token_id: row.get("token_id"),
        release_reason: release_reason.map(|r| r.parse()).transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SLOT_COLUMNS: &str =
    "resource_id, slot_key, capacity_total, booked_count, cancelled, version, updated_at";

const INTENT_COLUMNS: &str = "id, resource_id, slot_key, count, requester_id, status, \
     hold_expires_at, token_id, release_reason, created_at, updated_at";

#[async_trait]
impl SlotStore for PgStore {
    async fn read_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> Result<Option<SlotRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM capacity_slots WHERE resource_id = $1 AND slot_key = $2",
            SLOT_COLUMNS
        ))
        .bind(resource_id)
        .bind(slot_key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(slot_from_row).transpose()
    }

    async fn create_slot(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        capacity_total: u32,
    ) -> Result<SlotRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO capacity_slots (resource_id, slot_key, capacity_total)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_id, slot_key) DO NOTHING
            RETURNING {}
            "#,
            SLOT_COLUMNS
        ))
        .bind(resource_id)
        .bind(slot_key.to_string())
        .bind(to_i32(capacity_total, "capacity_total")?)
        .fetch_optional(&self.pool)
        .await?;

        let record = match row {
            Some(row) => slot_from_row(&row)?,
            None => {
                return Err(StoreError::AlreadyExists(
                    SlotRef::new(resource_id, *slot_key).to_string(),
                ));
            }
        };

        self.notify_change(&record).await;
        Ok(record)
    }

    async fn conditional_write(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        expected_version: u64,
        update: SlotUpdate,
    ) -> Result<WriteOutcome, StoreError> {
        let slot = SlotRef::new(resource_id, *slot_key);
        check_slot_update(&slot, &update)?;

        let expected = i64::try_from(expected_version)
            .map_err(|_| StoreError::DataFormat(format!("version too large: {}", expected_version)))?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE capacity_slots
            SET booked_count = $4,
                capacity_total = $5,
                cancelled = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE resource_id = $1 AND slot_key = $2 AND version = $3
            RETURNING {}
            "#,
            SLOT_COLUMNS
        ))
        .bind(resource_id)
        .bind(slot_key.to_string())
        .bind(expected)
        .bind(to_i32(update.booked_count, "booked_count")?)
        .bind(to_i32(update.capacity_total, "capacity_total")?)
        .bind(update.cancelled)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                let record = slot_from_row(&row)?;

                match update.token {
                    Some(TokenChange::Issue { token_id, count }) => {
                        sqlx::query(
                            r#"
                            INSERT INTO reservation_tokens (token_id, resource_id, slot_key, count)
                            VALUES ($1, $2, $3, $4)
                            "#,
                        )
                        .bind(token_id)
                        .bind(resource_id)
                        .bind(slot_key.to_string())
                        .bind(to_i32(count, "count")?)
                        .execute(&mut *tx)
                        .await?;
                    }
                    Some(TokenChange::Consume { token_id, count }) => {
                        let consumed = sqlx::query(
                            r#"
                            DELETE FROM reservation_tokens
                            WHERE token_id = $1 AND resource_id = $2 AND slot_key = $3 AND count = $4
                            "#,
                        )
                        .bind(token_id)
                        .bind(resource_id)
                        .bind(slot_key.to_string())
                        .bind(to_i32(count, "count")?)
                        .execute(&mut *tx)
                        .await?;

                        if consumed.rows_affected() == 0 {
                            tx.rollback().await?;
                            debug!("Token {} is not outstanding on {}", token_id, slot);
                            return Ok(WriteOutcome::TokenNotOutstanding);
                        }
                    }
                    None => {}
                }

                tx.commit().await?;
                self.notify_change(&record).await;
                Ok(WriteOutcome::Written(record))
            }
            None => {
                tx.rollback().await?;
                let current = self
                    .read_slot(resource_id, slot_key)
                    .await?
                    .ok_or_else(|| StoreError::SlotNotFound(slot.to_string()))?;
                debug!(
                    "Version mismatch on {}: expected {}, found {}",
                    slot, expected_version, current.version
                );
                Ok(WriteOutcome::VersionMismatch {
                    current_version: current.version,
                })
            }
        }
    }

    async fn subscribe(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
    ) -> broadcast::Receiver<SlotRecord> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(SlotRef::new(resource_id, *slot_key))
            .or_insert_with(|| broadcast::channel(SLOT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn append_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let data = serde_json::to_value(&notification.data)
            .map_err(|e| StoreError::DataFormat(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, kind, title, message, data, created_at, read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(&notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(data)
        .bind(notification.created_at)
        .bind(notification.read)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(notification.id.to_string()));
        }

        Ok(())
    }

    async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, title, message, data, created_at, read
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_read(&self, notification_id: Uuid) -> Result<Option<Notification>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE notifications SET read = TRUE
            WHERE id = $1
            RETURNING id, user_id, kind, title, message, data, created_at, read
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        let result =
            sqlx::query("UPDATE notifications SET read = TRUE WHERE user_id = $1 AND NOT read")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl IntentStore for PgStore {
    async fn insert_intent(&self, intent: &BookingIntent) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO booking_intents ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            INTENT_COLUMNS
        ))
        .bind(intent.id)
        .bind(&intent.resource_id)
        .bind(intent.slot_key.to_string())
        .bind(to_i32(intent.count, "count")?)
        .bind(&intent.requester_id)
        .bind(intent.status.as_str())
        .bind(intent.hold_expires_at)
        .bind(intent.token_id)
        .bind(intent.release_reason.map(|r| r.as_str()))
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> Result<Option<BookingIntent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM booking_intents WHERE id = $1",
            INTENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
        reason: Option<ReleaseReason>,
    ) -> Result<Option<BookingIntent>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE booking_intents
            SET status = $3,
                release_reason = $4,
                hold_expires_at = CASE WHEN $3 = 'pending' THEN hold_expires_at ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(reason.map(|r| r.as_str()))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<BookingIntent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM booking_intents
            WHERE status = 'pending' AND hold_expires_at IS NOT NULL AND hold_expires_at <= $1
            ORDER BY hold_expires_at ASC
            LIMIT 500
            "#,
            INTENT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(intent_from_row).collect()
    }
}
