use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;
use validator::Validate;

use crate::types::*;

/// Registered driver profiles, keyed by driver id
#[derive(Default)]
pub struct DriverDirectory {
    drivers: RwLock<HashMap<String, DriverProfile>>,
}

impl DriverDirectory {
    /// Creates an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a profile. Returns true when the driver is new.
    pub async fn register(&self, profile: DriverProfile) -> Result<bool, MatchingError> {
        profile
            .validate()
            .map_err(|e| MatchingError::Validation(e.to_string()))?;

        let id = profile.id.clone();
        let created = self
            .drivers
            .write()
            .await
            .insert(id.clone(), profile)
            .is_none();
        info!(
            "{} driver profile {}",
            if created { "Registered" } else { "Updated" },
            id
        );
        Ok(created)
    }

    /// Loads one profile
    pub async fn get(&self, driver_id: &str) -> Result<DriverProfile, MatchingError> {
        self.drivers
            .read()
            .await
            .get(driver_id)
            .cloned()
            .ok_or_else(|| MatchingError::DriverNotFound(driver_id.to_string()))
    }

    /// Every registered profile, ordered by driver id
    pub async fn all(&self) -> Vec<DriverProfile> {
        let mut drivers: Vec<DriverProfile> = self.drivers.read().await.values().cloned().collect();
        drivers.sort_by(|a, b| a.id.cmp(&b.id));
        drivers
    }

    /// Number of registered drivers
    pub async fn len(&self) -> usize {
        self.drivers.read().await.len()
    }

    /// Whether no driver is registered
    pub async fn is_empty(&self) -> bool {
        self.drivers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use verification_pipeline::VerificationStage;

    use super::*;

    fn profile(id: &str, rating: f64) -> DriverProfile {
        DriverProfile {
            id: id.to_string(),
            verification_stage: VerificationStage::Submitted,
            risk_score: 0,
            rating,
            experience_years: 2,
            languages: vec!["English".to_string()],
            vehicle_type: VehicleType::Van,
            cancellation_rate: 0.0,
            seat_capacity: Some(7),
            blocked_dates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_update() {
        let directory = DriverDirectory::new();
        assert!(directory.register(profile("d2", 4.0)).await.unwrap());
        assert!(directory.register(profile("d1", 4.0)).await.unwrap());
        assert!(!directory.register(profile("d1", 4.9)).await.unwrap());

        assert_eq!(directory.len().await, 2);
        assert_eq!(directory.get("d1").await.unwrap().rating, 4.9);
        let ids: Vec<String> = directory.all().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn test_invalid_profile_is_rejected() {
        let directory = DriverDirectory::new();
        assert!(matches!(
            directory.register(profile("d1", 7.5)).await,
            Err(MatchingError::Validation(_))
        ));
        assert!(matches!(
            directory.get("d1").await,
            Err(MatchingError::DriverNotFound(_))
        ));
        assert!(directory.is_empty().await);
    }
}
