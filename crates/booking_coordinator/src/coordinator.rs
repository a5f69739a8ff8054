use std::sync::Arc;

use booking_store::{
    BookingIntent, BookingStatus, IntentStore, Notification, NotificationData, NotificationKind,
    ParseError, ReleaseReason, SlotKey,
};
use capacity_ledger::{
    CapacityLedger, LedgerError, ReleaseOutcome, ReservationToken, ReserveOutcome,
};
use chrono::{DateTime, Datelike, Utc};
use matching_engine::{MatchRequest, MatchingService, RankedCandidate};
use notification_services::NotificationDispatcher;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::payment::PaymentGate;
use crate::types::*;

/// Drives bookings from request to commit or release.
///
/// The ledger's `reserve` result is the only thing that decides whether a
/// booking gets capacity. Every pending-to-released transition goes through
/// the intent store's conditional update, and only the caller that wins it
/// releases the reservation token.
pub struct BookingCoordinator {
    config: BookingConfig,
    intents: Arc<dyn IntentStore>,
    ledger: Arc<CapacityLedger>,
    dispatcher: Arc<NotificationDispatcher>,
    matching: Arc<MatchingService>,
    payments: Arc<dyn PaymentGate>,
    backlog: Mutex<Vec<ReservationToken>>,
}

impl BookingCoordinator {
    /// Creates a coordinator
    pub fn new(
        intents: Arc<dyn IntentStore>,
        ledger: Arc<CapacityLedger>,
        dispatcher: Arc<NotificationDispatcher>,
        matching: Arc<MatchingService>,
        payments: Arc<dyn PaymentGate>,
        config: Option<BookingConfig>,
    ) -> Self {
        Self {
            config: config.unwrap_or_default(),
            intents,
            ledger,
            dispatcher,
            matching,
            payments,
            backlog: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    /// Reserves capacity for `request` and records the booking.
    ///
    /// A booking whose payment is already confirmed is committed straight
    /// away; otherwise it is held until `hold_ttl` elapses. A sold-out slot
    /// leaves no trace and the error lists nearby slots that still have room.
    pub async fn create_booking(
        &self,
        request: &CreateBookingRequest,
    ) -> Result<BookingIntent, BookingError> {
        request
            .validate()
            .map_err(|e| BookingError::Validation(e.to_string()))?;

        let slot_key: SlotKey = request
            .slot_key
            .parse()
            .map_err(|e: ParseError| BookingError::Validation(e.to_string()))?;

        let now = Utc::now();
        self.check_window(&slot_key, now)?;
        let hold_ttl = chrono::Duration::from_std(self.config.hold_ttl)
            .map_err(|_| BookingError::Validation("Hold TTL out of range".to_string()))?;

        let outcome = self
            .ledger
            .reserve(&request.resource_id, &slot_key, request.count)
            .await?;

        let token = match outcome {
            ReserveOutcome::Reserved(token) => token,
            ReserveOutcome::SoldOut { spots_left } => {
                let reason = if spots_left == 0 {
                    format!("{} on {} is sold out", request.resource_id, slot_key)
                } else {
                    format!(
                        "Only {} spots left for {} on {}, {} requested",
                        spots_left, request.resource_id, slot_key, request.count
                    )
                };
                let alternatives = self
                    .find_alternatives(&request.resource_id, &slot_key, request.count, now)
                    .await;
                return Err(BookingError::SoldOut {
                    reason,
                    alternatives,
                });
            }
            ReserveOutcome::Contention { attempts } => {
                return Err(BookingError::Transient(format!(
                    "{} on {} is busy, gave up after {} attempts",
                    request.resource_id, slot_key, attempts
                )));
            }
        };

        let expires_at = now + hold_ttl;
        let mut intent = BookingIntent {
            id: Uuid::new_v4(),
            resource_id: request.resource_id.clone(),
            slot_key,
            count: request.count,
            requester_id: request.requester_id.clone(),
            status: BookingStatus::Pending,
            hold_expires_at: Some(expires_at),
            token_id: token.id,
            release_reason: None,
            created_at: now,
            updated_at: now,
        };

        let paid = match self.payments.is_payment_confirmed(&intent).await {
            Ok(paid) => paid,
            Err(e) => {
                warn!("Holding booking {}: {}", intent.id, e);
                false
            }
        };
        if paid {
            intent.status = BookingStatus::Committed;
            intent.hold_expires_at = None;
        }

        if let Err(e) = self.intents.insert_intent(&intent).await {
            error!("Failed to store booking {}: {}", intent.id, e);
            self.release_token(&token).await;
            return Err(e.into());
        }

        if paid {
            self.payments.settled(intent.id).await;
            info!(
                "Booking {} committed: {} on {}/{}",
                intent.id, intent.count, intent.resource_id, intent.slot_key
            );
            self.notify(
                &intent,
                NotificationKind::BookingConfirmed,
                "Booking confirmed",
                format!(
                    "Your booking for {} on {} is confirmed.",
                    intent.resource_id, intent.slot_key
                ),
            )
            .await;
        } else {
            info!(
                "Booking {} held until {}: {} on {}/{}",
                intent.id, expires_at, intent.count, intent.resource_id, intent.slot_key
            );
            self.notify(
                &intent,
                NotificationKind::BookingHeld,
                "Spots held",
                format!(
                    "{} spots on {} are held for you until {}. Complete payment to confirm.",
                    intent.count,
                    intent.slot_key,
                    expires_at.format("%Y-%m-%d %H:%M UTC")
                ),
            )
            .await;
        }

        Ok(intent)
    }

    /// Commits a pending hold once the payment gate reports it paid.
    ///
    /// Confirming a committed booking again returns it unchanged. A hold
    /// that has already lapsed is released on the spot. An unpaid hold stays
    /// pending and the call fails with `PaymentNotConfirmed`.
    pub async fn confirm_booking(&self, id: Uuid) -> Result<BookingIntent, BookingError> {
        let intent = self.get_booking(id).await?;
        if intent.status != BookingStatus::Pending {
            self.payments.settled(id).await;
            return match intent.status {
                BookingStatus::Committed => Ok(intent),
                _ => Err(settled_error(&intent)),
            };
        }

        if intent.is_expired_at(Utc::now()) {
            self.release_intent(&intent, ReleaseReason::Expired).await?;
            return Err(BookingError::HoldExpired(id));
        }

        let paid = match self.payments.is_payment_confirmed(&intent).await {
            Ok(paid) => paid,
            Err(e) => {
                warn!("Payment status of booking {} unavailable: {}", id, e);
                false
            }
        };
        if !paid {
            debug!("Booking {} not confirmed: payment outstanding", id);
            return Err(BookingError::PaymentNotConfirmed(id));
        }

        match self
            .intents
            .transition_intent(id, BookingStatus::Pending, BookingStatus::Committed, None)
            .await?
        {
            Some(committed) => {
                self.payments.settled(id).await;
                info!("Booking {} confirmed", id);
                self.notify(
                    &committed,
                    NotificationKind::BookingConfirmed,
                    "Booking confirmed",
                    format!(
                        "Your booking for {} on {} is confirmed.",
                        committed.resource_id, committed.slot_key
                    ),
                )
                .await;
                Ok(committed)
            }
            None => {
                self.payments.settled(id).await;
                let current = self.get_booking(id).await?;
                match current.status {
                    BookingStatus::Committed => Ok(current),
                    _ => Err(settled_error(&current)),
                }
            }
        }
    }

    /// Cancels a pending hold and returns its capacity.
    ///
    /// Cancelling a released booking is a no-op success; committed bookings
    /// are final and cannot be cancelled.
    pub async fn cancel_booking(&self, id: Uuid) -> Result<BookingIntent, BookingError> {
        let intent = self.get_booking(id).await?;
        match intent.status {
            BookingStatus::Released => {
                debug!("Booking {} already released", id);
                return Ok(intent);
            }
            BookingStatus::Committed => return Err(BookingError::NotCancellable(id)),
            BookingStatus::Pending => {}
        }

        if let Some(released) = self
            .release_intent(&intent, ReleaseReason::Cancelled)
            .await?
        {
            return Ok(released);
        }

        // Lost to the reaper or a confirmation
        let current = self.get_booking(id).await?;
        match current.status {
            BookingStatus::Released => Ok(current),
            BookingStatus::Committed => Err(BookingError::NotCancellable(id)),
            BookingStatus::Pending => Err(BookingError::Transient(format!(
                "Booking {} changed during cancellation",
                id
            ))),
        }
    }

    /// Loads a booking
    pub async fn get_booking(&self, id: Uuid) -> Result<BookingIntent, BookingError> {
        self.intents
            .get_intent(id)
            .await?
            .ok_or(BookingError::NotFound(id))
    }

    /// Releases every pending hold whose TTL lapsed at or before `now`.
    /// Returns how many holds this call expired.
    pub async fn expire_due_holds(&self, now: DateTime<Utc>) -> Result<usize, BookingError> {
        let due = self.intents.due_holds(now).await?;
        if due.is_empty() {
            debug!("No lapsed holds");
            return Ok(0);
        }

        let mut expired = 0;
        for intent in due {
            match self.release_intent(&intent, ReleaseReason::Expired).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => error!("Failed to expire booking {}: {}", intent.id, e),
            }
        }

        if expired > 0 {
            info!("Expired {} lapsed holds", expired);
        }
        Ok(expired)
    }

    /// Retries ledger releases that previously failed. Returns how many
    /// settled on this pass; the rest stay queued.
    pub async fn retry_backlog(&self) -> usize {
        let queued = std::mem::take(&mut *self.backlog.lock().await);
        if queued.is_empty() {
            return 0;
        }

        let mut settled = 0;
        let mut still_queued = Vec::new();
        for token in queued {
            match self.ledger.release(&token).await {
                Ok(ReleaseOutcome::Released { .. }) | Ok(ReleaseOutcome::AlreadyReleased) => {
                    settled += 1;
                }
                Ok(ReleaseOutcome::Contention { attempts }) => {
                    debug!(
                        "Token {} still contended after {} attempts",
                        token.id, attempts
                    );
                    still_queued.push(token);
                }
                Err(e) => {
                    warn!("Token {} still failing: {}", token.id, e);
                    still_queued.push(token);
                }
            }
        }

        if !still_queued.is_empty() {
            self.backlog.lock().await.extend(still_queued);
        }
        info!("Release backlog: {} settled", settled);
        settled
    }

    /// Ledger releases waiting for a retry
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Ranks registered drivers for a trip
    pub async fn assign_drivers(
        &self,
        request: &MatchRequest,
    ) -> Result<Vec<RankedCandidate>, BookingError> {
        Ok(self.matching.match_request(request).await?)
    }

    /// Moves a pending intent to released and, if this call won the
    /// transition, returns its capacity. `None` means another caller already
    /// settled the intent.
    async fn release_intent(
        &self,
        intent: &BookingIntent,
        reason: ReleaseReason,
    ) -> Result<Option<BookingIntent>, BookingError> {
        let Some(released) = self
            .intents
            .transition_intent(
                intent.id,
                BookingStatus::Pending,
                BookingStatus::Released,
                Some(reason),
            )
            .await?
        else {
            debug!(
                "Booking {} already settled, skipping {} release",
                intent.id,
                reason.as_str()
            );
            return Ok(None);
        };

        self.release_token(&token_of(&released)).await;
        self.payments.settled(released.id).await;
        info!("Booking {} released ({})", released.id, reason.as_str());

        match reason {
            ReleaseReason::Cancelled => {
                self.notify(
                    &released,
                    NotificationKind::BookingCancelled,
                    "Booking cancelled",
                    format!(
                        "Your hold for {} on {} was cancelled.",
                        released.resource_id, released.slot_key
                    ),
                )
                .await
            }
            ReleaseReason::Expired => {
                self.notify(
                    &released,
                    NotificationKind::BookingExpired,
                    "Hold expired",
                    format!(
                        "Your hold for {} on {} expired before payment was confirmed.",
                        released.resource_id, released.slot_key
                    ),
                )
                .await
            }
        }

        Ok(Some(released))
    }

    async fn release_token(&self, token: &ReservationToken) {
        match self.ledger.release(token).await {
            Ok(ReleaseOutcome::Released { booked_count }) => {
                debug!("Token {} released, {} booked", token.id, booked_count);
            }
            Ok(ReleaseOutcome::AlreadyReleased) => {
                debug!("Token {} was already released", token.id);
            }
            Ok(ReleaseOutcome::Contention { attempts }) => {
                warn!(
                    "Release of token {} contended after {} attempts, queued for retry",
                    token.id, attempts
                );
                self.backlog.lock().await.push(token.clone());
            }
            Err(e) => {
                error!("Release of token {} failed, queued for retry: {}", token.id, e);
                self.backlog.lock().await.push(token.clone());
            }
        }
    }

    fn check_window(&self, slot_key: &SlotKey, now: DateTime<Utc>) -> Result<(), BookingError> {
        let until_start = slot_key.starts_at() - now;
        if until_start < chrono::Duration::hours(self.config.minimum_notice_hours) {
            return Err(BookingError::Validation(format!(
                "{} starts too soon: bookings need {} hours notice",
                slot_key, self.config.minimum_notice_hours
            )));
        }
        if until_start > chrono::Duration::days(self.config.advance_booking_days) {
            return Err(BookingError::Validation(format!(
                "{} is more than {} days ahead",
                slot_key, self.config.advance_booking_days
            )));
        }
        let weekday = slot_key.date.weekday();
        if !self.config.working_days.contains(&weekday) {
            return Err(BookingError::Validation(format!(
                "{} falls on a {}, which is not a working day",
                slot_key, weekday
            )));
        }
        Ok(())
    }

    /// Nearby slots, closest first, that could take `count` more units
    async fn find_alternatives(
        &self,
        resource_id: &str,
        slot_key: &SlotKey,
        count: u32,
        now: DateTime<Utc>,
    ) -> Vec<AlternateSlot> {
        let mut alternatives = Vec::new();
        for offset in 1..=self.config.alternate_search_days {
            for days in [-offset, offset] {
                let Some(candidate) = slot_key.shifted(days) else {
                    continue;
                };
                if self.check_window(&candidate, now).is_err() {
                    continue;
                }

                match self.ledger.snapshot(resource_id, &candidate).await {
                    Ok(record) if !record.cancelled && record.spots_left() >= count => {
                        alternatives.push(AlternateSlot {
                            slot_key: candidate,
                            spots_left: record.spots_left(),
                        });
                    }
                    Ok(_) | Err(LedgerError::SlotNotFound(_)) => {}
                    Err(e) => warn!("Could not check alternate slot {}: {}", candidate, e),
                }
            }
        }
        alternatives
    }

    async fn notify(
        &self,
        intent: &BookingIntent,
        kind: NotificationKind,
        title: &str,
        message: String,
    ) {
        let notification = Notification::new(&intent.requester_id, kind, title, message)
            .with_data(NotificationData {
                booking_id: Some(intent.id),
                resource_id: Some(intent.resource_id.clone()),
                slot_key: Some(intent.slot_key),
                driver_id: None,
            });

        if let Err(e) = self.dispatcher.publish(notification).await {
            warn!(
                "Failed to notify {} about booking {}: {}",
                intent.requester_id, intent.id, e
            );
        }
    }
}

fn token_of(intent: &BookingIntent) -> ReservationToken {
    ReservationToken {
        id: intent.token_id,
        resource_id: intent.resource_id.clone(),
        slot_key: intent.slot_key,
        count: intent.count,
    }
}

fn settled_error(intent: &BookingIntent) -> BookingError {
    match intent.release_reason {
        Some(ReleaseReason::Expired) => BookingError::HoldExpired(intent.id),
        _ => BookingError::AlreadyReleased(intent.id),
    }
}
