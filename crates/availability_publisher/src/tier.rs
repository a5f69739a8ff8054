use booking_store::{SlotKey, SlotRecord};
use serde::{Deserialize, Serialize};

/// Thresholds for the `limited` tier
#[derive(Debug, Clone)]
pub struct TierThresholds {
    /// At or below this many spots left the slot is limited (default: 3)
    pub limited_spots: u32,

    /// At or above this fill ratio the slot is limited (default: 0.85)
    pub limited_fill_ratio: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            limited_spots: 3,
            limited_fill_ratio: 0.85,
        }
    }
}

/// Coarse availability shown to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTier {
    /// Plenty of room
    Available,
    /// Few spots left or nearly full
    Limited,
    /// No spots left
    Full,
    /// Resource cancelled
    Cancelled,
}

impl StatusTier {
    /// Whether nothing can be booked in this tier
    pub fn is_closed(&self) -> bool {
        matches!(self, StatusTier::Full | StatusTier::Cancelled)
    }
}

/// Computes the tier of a slot. The cancelled flag overrides the counts.
pub fn compute_tier(
    capacity_total: u32,
    booked_count: u32,
    cancelled: bool,
    thresholds: &TierThresholds,
) -> StatusTier {
    if cancelled {
        return StatusTier::Cancelled;
    }

    let spots_left = capacity_total.saturating_sub(booked_count);
    if spots_left == 0 {
        return StatusTier::Full;
    }

    let fill_ratio = f64::from(booked_count) / f64::from(capacity_total);
    if spots_left <= thresholds.limited_spots || fill_ratio >= thresholds.limited_fill_ratio {
        StatusTier::Limited
    } else {
        StatusTier::Available
    }
}

/// Derived view of one slot. Never used to decide a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    /// Resource the slot belongs to
    pub resource_id: String,
    /// Slot key
    pub slot_key: SlotKey,
    /// Units still bookable
    pub spots_left: u32,
    /// Tier derived from the counts
    pub status_tier: StatusTier,
    /// Total capacity
    pub capacity_total: u32,
    /// Units booked
    pub booked_count: u32,
    /// Store version the snapshot was derived from
    pub version: u64,
}

impl AvailabilitySnapshot {
    /// Derives a snapshot from a store record
    pub fn from_record(record: &SlotRecord, thresholds: &TierThresholds) -> Self {
        Self {
            resource_id: record.resource_id.clone(),
            slot_key: record.slot_key,
            spots_left: record.spots_left(),
            status_tier: compute_tier(
                record.capacity_total,
                record.booked_count,
                record.cancelled,
                thresholds,
            ),
            capacity_total: record.capacity_total,
            booked_count: record.booked_count,
            version: record.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(capacity: u32, booked: u32) -> StatusTier {
        compute_tier(capacity, booked, false, &TierThresholds::default())
    }

    #[test]
    fn test_full_only_when_no_spots_left() {
        assert_eq!(tier(10, 10), StatusTier::Full);
        assert_eq!(tier(10, 9), StatusTier::Limited);
        assert_eq!(tier(0, 0), StatusTier::Full);
    }

    #[test]
    fn test_limited_by_spots_left() {
        // 20 seats, 17 booked: three left, 85% filled
        assert_eq!(tier(20, 17), StatusTier::Limited);
        assert_eq!(tier(5, 2), StatusTier::Limited);
        assert_eq!(tier(5, 1), StatusTier::Available);
    }

    #[test]
    fn test_limited_by_fill_ratio() {
        assert_eq!(tier(100, 84), StatusTier::Available);
        assert_eq!(tier(100, 85), StatusTier::Limited);
        assert_eq!(tier(40, 34), StatusTier::Limited);
    }

    #[test]
    fn test_cancelled_overrides_counts() {
        let thresholds = TierThresholds::default();
        assert_eq!(compute_tier(10, 0, true, &thresholds), StatusTier::Cancelled);
        assert_eq!(compute_tier(10, 10, true, &thresholds), StatusTier::Cancelled);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = TierThresholds {
            limited_spots: 0,
            limited_fill_ratio: 1.1,
        };
        assert_eq!(compute_tier(10, 9, false, &thresholds), StatusTier::Available);
        assert_eq!(compute_tier(10, 10, false, &thresholds), StatusTier::Full);
    }
}
