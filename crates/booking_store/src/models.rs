use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a slot key, time slot or status string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Slot key is not `YYYY-MM-DD` or `YYYY-MM-DD#<timeslot>`
    #[error("Invalid slot key '{0}': expected YYYY-MM-DD or YYYY-MM-DD#<timeslot>")]
    SlotKey(String),

    /// Unknown time slot name
    #[error("Invalid time slot '{0}': expected morning, afternoon, evening or full_day")]
    TimeSlot(String),

    /// Unknown booking status
    #[error("Invalid booking status '{0}'")]
    BookingStatus(String),

    /// Unknown release reason
    #[error("Invalid release reason '{0}'")]
    ReleaseReason(String),

    /// Unknown notification type
    #[error("Invalid notification type '{0}'")]
    NotificationKind(String),
}

/// Part of the day a bookable slot covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSlot {
    /// 06:00 - 12:00
    Morning,
    /// 12:00 - 18:00
    Afternoon,
    /// 18:00 - 22:00
    Evening,
    /// The whole working day
    FullDay,
}

impl TimeSlot {
    /// Wire name of the time slot
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSlot::Morning => "morning",
            TimeSlot::Afternoon => "afternoon",
            TimeSlot::Evening => "evening",
            TimeSlot::FullDay => "full_day",
        }
    }

    /// Hour of the day the slot starts, UTC
    pub fn start_hour(&self) -> i64 {
        match self {
            TimeSlot::Morning | TimeSlot::FullDay => 6,
            TimeSlot::Afternoon => 12,
            TimeSlot::Evening => 18,
        }
    }
}

impl FromStr for TimeSlot {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "morning" => Ok(TimeSlot::Morning),
            "afternoon" => Ok(TimeSlot::Afternoon),
            "evening" => Ok(TimeSlot::Evening),
            "full_day" => Ok(TimeSlot::FullDay),
            other => Err(ParseError::TimeSlot(other.to_string())),
        }
    }
}

/// Capacity bucket key: a date with an optional time slot.
///
/// Printed as `2025-03-01` or `2025-03-01#morning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotKey {
    /// Calendar date of the slot
    pub date: NaiveDate,
    /// Optional part of the day
    pub time_slot: Option<TimeSlot>,
}

impl SlotKey {
    /// Whole-date slot key
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            time_slot: None,
        }
    }

    /// Slot key restricted to a part of the day
    pub fn with_time_slot(date: NaiveDate, time_slot: TimeSlot) -> Self {
        Self {
            date,
            time_slot: Some(time_slot),
        }
    }

    /// When the slot begins. Whole-date keys begin at midnight UTC.
    pub fn starts_at(&self) -> DateTime<Utc> {
        let hour = self.time_slot.map_or(0, |slot| slot.start_hour());
        self.date.and_time(NaiveTime::MIN).and_utc() + Duration::hours(hour)
    }

    /// Same time slot, `days` days away. `None` if the date overflows.
    pub fn shifted(&self, days: i64) -> Option<Self> {
        let date = self.date.checked_add_signed(Duration::days(days))?;
        Some(Self {
            date,
            time_slot: self.time_slot,
        })
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time_slot {
            Some(slot) => write!(f, "{}#{}", self.date.format("%Y-%m-%d"), slot.as_str()),
            None => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

impl FromStr for SlotKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date_part, slot_part) = match s.split_once('#') {
            Some((date, slot)) => (date, Some(slot)),
            None => (s, None),
        };

        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .map_err(|_| ParseError::SlotKey(s.to_string()))?;

        let time_slot = match slot_part {
            Some(slot) => Some(
                slot.parse::<TimeSlot>()
                    .map_err(|_| ParseError::SlotKey(s.to_string()))?,
            ),
            None => None,
        };

        Ok(Self { date, time_slot })
    }
}

impl TryFrom<String> for SlotKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotKey> for String {
    fn from(key: SlotKey) -> Self {
        key.to_string()
    }
}

/// Identifies one capacity slot: a resource and a slot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    /// Tour departure, vehicle or driver identifier
    pub resource_id: String,
    /// Date and optional time slot
    pub slot_key: SlotKey,
}

impl SlotRef {
    /// Creates a new slot reference
    pub fn new(resource_id: impl Into<String>, slot_key: SlotKey) -> Self {
        Self {
            resource_id: resource_id.into(),
            slot_key,
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.slot_key)
    }
}

/// Authoritative booked/total counters for one slot, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Resource the slot belongs to
    pub resource_id: String,
    /// Date and optional time slot
    pub slot_key: SlotKey,
    /// Total sellable capacity
    pub capacity_total: u32,
    /// Capacity already claimed
    pub booked_count: u32,
    /// Set when the departure/resource has been cancelled
    pub cancelled: bool,
    /// Bumped on every successful write
    pub version: u64,
    /// When the slot was last written
    pub updated_at: DateTime<Utc>,
}

impl SlotRecord {
    /// Remaining sellable capacity
    pub fn spots_left(&self) -> u32 {
        self.capacity_total.saturating_sub(self.booked_count)
    }

    /// Reference to this slot
    pub fn slot_ref(&self) -> SlotRef {
        SlotRef::new(self.resource_id.clone(), self.slot_key)
    }
}

/// Reservation token bookkeeping applied in the same write as the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenChange {
    /// Records a newly issued token holding `count` units of the slot
    Issue {
        /// Token identifier
        token_id: Uuid,
        /// Units the token holds
        count: u32,
    },
    /// Retires an outstanding token of the slot. The whole write is refused
    /// when no such token is outstanding.
    Consume {
        /// Token identifier
        token_id: Uuid,
        /// Units the token holds
        count: u32,
    },
}

/// New field values for a conditional slot write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpdate {
    /// New booked count
    pub booked_count: u32,
    /// New total capacity
    pub capacity_total: u32,
    /// New cancelled flag
    pub cancelled: bool,
    /// Token issued or consumed by this write
    pub token: Option<TokenChange>,
}

impl SlotUpdate {
    /// Update that keeps every field of `record`
    pub fn from_record(record: &SlotRecord) -> Self {
        Self {
            booked_count: record.booked_count,
            capacity_total: record.capacity_total,
            cancelled: record.cancelled,
            token: None,
        }
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The version matched and the slot was written
    Written(SlotRecord),
    /// Another writer got there first
    VersionMismatch {
        /// Version currently stored
        current_version: u64,
    },
    /// The token to consume is not outstanding on this slot; nothing was written
    TokenNotOutstanding,
}

/// Lifecycle status of a booking intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Capacity is held, waiting for payment confirmation
    Pending,
    /// Booking is final
    Committed,
    /// Hold was cancelled or expired and capacity returned
    Released,
}

impl BookingStatus {
    /// Storage name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Committed => "committed",
            BookingStatus::Released => "released",
        }
    }

    /// Committed and released intents never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }
}

impl FromStr for BookingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "committed" => Ok(BookingStatus::Committed),
            "released" => Ok(BookingStatus::Released),
            other => Err(ParseError::BookingStatus(other.to_string())),
        }
    }
}

/// Why a hold was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Requester cancelled before payment
    Cancelled,
    /// Hold TTL elapsed
    Expired,
}

impl ReleaseReason {
    /// Storage name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::Expired => "expired",
        }
    }
}

impl FromStr for ReleaseReason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancelled" => Ok(ReleaseReason::Cancelled),
            "expired" => Ok(ReleaseReason::Expired),
            other => Err(ParseError::ReleaseReason(other.to_string())),
        }
    }
}

/// A claim against a slot's capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingIntent {
    /// Booking identifier
    pub id: Uuid,
    /// Resource being booked
    pub resource_id: String,
    /// Slot being booked
    pub slot_key: SlotKey,
    /// Number of seats/units claimed
    pub count: u32,
    /// Who asked for the booking
    pub requester_id: String,
    /// Current lifecycle status
    pub status: BookingStatus,
    /// When an unconfirmed hold lapses (pending intents only)
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Ledger reservation token backing this intent
    pub token_id: Uuid,
    /// Set once the intent is released
    pub release_reason: Option<ReleaseReason>,
    /// When the intent was created
    pub created_at: DateTime<Utc>,
    /// When the intent last changed status
    pub updated_at: DateTime<Utc>,
}

impl BookingIntent {
    /// A pending hold whose TTL has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Pending
            && self.hold_expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Type of an inbox notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Booking committed
    BookingConfirmed,
    /// Capacity held pending payment
    BookingHeld,
    /// Hold cancelled by the requester
    BookingCancelled,
    /// Hold lapsed before payment
    BookingExpired,
    /// A watched slot has capacity again
    AvailabilityOpened,
    /// Identity document accepted
    DocumentVerified,
    /// Document photo must be retaken
    RetakeRequested,
    /// Driver approved for matching
    VerificationApproved,
    /// Driver rejected
    VerificationRejected,
    /// Driver case waiting on a human operator
    VerificationManualReview,
    /// Operational message
    SystemAlert,
}

impl NotificationKind {
    /// Storage name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::BookingHeld => "booking_held",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::BookingExpired => "booking_expired",
            NotificationKind::AvailabilityOpened => "availability_opened",
            NotificationKind::DocumentVerified => "document_verified",
            NotificationKind::RetakeRequested => "retake_requested",
            NotificationKind::VerificationApproved => "verification_approved",
            NotificationKind::VerificationRejected => "verification_rejected",
            NotificationKind::VerificationManualReview => "verification_manual_review",
            NotificationKind::SystemAlert => "system_alert",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "booking_confirmed" => NotificationKind::BookingConfirmed,
            "booking_held" => NotificationKind::BookingHeld,
            "booking_cancelled" => NotificationKind::BookingCancelled,
            "booking_expired" => NotificationKind::BookingExpired,
            "availability_opened" => NotificationKind::AvailabilityOpened,
            "document_verified" => NotificationKind::DocumentVerified,
            "retake_requested" => NotificationKind::RetakeRequested,
            "verification_approved" => NotificationKind::VerificationApproved,
            "verification_rejected" => NotificationKind::VerificationRejected,
            "verification_manual_review" => NotificationKind::VerificationManualReview,
            "system_alert" => NotificationKind::SystemAlert,
            other => return Err(ParseError::NotificationKind(other.to_string())),
        };
        Ok(kind)
    }
}

/// Optional links from a notification to the entity it is about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// Related booking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Uuid>,
    /// Related resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Related slot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_key: Option<SlotKey>,
    /// Related driver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
}

/// One entry in a user's inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification identifier, used for consumer-side deduplication
    pub id: Uuid,
    /// Inbox owner
    pub user_id: String,
    /// Notification type
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Short headline
    pub title: String,
    /// Human-readable body
    pub message: String,
    /// Related entities
    #[serde(default)]
    pub data: NotificationData,
    /// When the notification was created
    pub created_at: DateTime<Utc>,
    /// Whether the user has read it
    pub read: bool,
}

impl Notification {
    /// Creates a new unread notification
    pub fn new(
        user_id: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            title: title.into(),
            message: message.into(),
            data: NotificationData::default(),
            created_at: Utc::now(),
            read: false,
        }
    }

    /// Attaches related entities
    pub fn with_data(mut self, data: NotificationData) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_parsing() {
        let key: SlotKey = "2025-03-01".parse().unwrap();
        assert_eq!(key.date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(key.time_slot, None);
        assert_eq!(key.to_string(), "2025-03-01");

        let key: SlotKey = "2025-03-01#morning".parse().unwrap();
        assert_eq!(key.time_slot, Some(TimeSlot::Morning));
        assert_eq!(key.to_string(), "2025-03-01#morning");

        assert!("2025-13-01".parse::<SlotKey>().is_err());
        assert!("2025-03-01#brunch".parse::<SlotKey>().is_err());
        assert!("tomorrow".parse::<SlotKey>().is_err());
    }

    #[test]
    fn test_slot_key_start_time() {
        let key: SlotKey = "2025-03-01#afternoon".parse().unwrap();
        assert_eq!(key.starts_at().to_rfc3339(), "2025-03-01T12:00:00+00:00");

        let key: SlotKey = "2025-03-01".parse().unwrap();
        assert_eq!(key.starts_at().to_rfc3339(), "2025-03-01T00:00:00+00:00");
    }

    #[test]
    fn test_slot_key_serde_as_string() {
        let key = SlotKey::with_time_slot(
            NaiveDate::from_ymd_opt(2025, 7, 4).unwrap(),
            TimeSlot::FullDay,
        );
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2025-07-04#full_day\"");

        let back: SlotKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_slot_key_shift_keeps_time_slot() {
        let key: SlotKey = "2025-12-31#evening".parse().unwrap();
        let next = key.shifted(1).unwrap();
        assert_eq!(next.to_string(), "2026-01-01#evening");
        assert_eq!(key.shifted(-1).unwrap().to_string(), "2025-12-30#evening");
    }

    #[test]
    fn test_spots_left_never_underflows() {
        let record = SlotRecord {
            resource_id: "tour-1".to_string(),
            slot_key: "2025-03-01".parse().unwrap(),
            capacity_total: 2,
            booked_count: 5,
            cancelled: false,
            version: 1,
            updated_at: Utc::now(),
        };
        assert_eq!(record.spots_left(), 0);
    }

    #[test]
    fn test_intent_expiry() {
        let now = Utc::now();
        let mut intent = BookingIntent {
            id: Uuid::new_v4(),
            resource_id: "tour-1".to_string(),
            slot_key: "2025-03-01".parse().unwrap(),
            count: 1,
            requester_id: "user-1".to_string(),
            status: BookingStatus::Pending,
            hold_expires_at: Some(now - Duration::seconds(1)),
            token_id: Uuid::new_v4(),
            release_reason: None,
            created_at: now,
            updated_at: now,
        };
        assert!(intent.is_expired_at(now));

        intent.status = BookingStatus::Committed;
        assert!(!intent.is_expired_at(now));
    }
}
