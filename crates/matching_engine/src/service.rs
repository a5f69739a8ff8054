use std::sync::Arc;

use tracing::{debug, info};
use validator::Validate;
use verification_pipeline::VerificationPipeline;

use crate::directory::DriverDirectory;
use crate::engine::rank;
use crate::types::*;

/// Ranks registered drivers with verification stages read from the pipeline
pub struct MatchingService {
    directory: Arc<DriverDirectory>,
    pipeline: Arc<VerificationPipeline>,
    config: MatchingConfig,
}

impl MatchingService {
    /// Creates the service
    pub fn new(
        directory: Arc<DriverDirectory>,
        pipeline: Arc<VerificationPipeline>,
        config: Option<MatchingConfig>,
    ) -> Self {
        Self {
            directory,
            pipeline,
            config: config.unwrap_or_default(),
        }
    }

    /// Driver directory backing the service
    pub fn directory(&self) -> &Arc<DriverDirectory> {
        &self.directory
    }

    /// Ranks every registered driver against `request`.
    ///
    /// A driver with a verification case is judged by that case's stage; the
    /// stage stored on the profile only counts for drivers the pipeline has
    /// never seen.
    pub async fn match_request(
        &self,
        request: &MatchRequest,
    ) -> Result<Vec<RankedCandidate>, MatchingError> {
        request
            .validate()
            .map_err(|e| MatchingError::Validation(e.to_string()))?;

        let mut candidates = self.directory.all().await;
        for candidate in candidates.iter_mut() {
            if let Some(stage) = self.pipeline.stage_of(&candidate.id).await {
                candidate.verification_stage = stage;
            }
        }

        let mut ranked = rank(&request.constraints, &candidates, &self.config);
        debug!(
            "Trip {}: {} of {} drivers eligible",
            request.trip_id,
            ranked.len(),
            candidates.len()
        );

        if let Some(limit) = request.limit {
            ranked.truncate(limit);
        }

        info!(
            "Matched trip {} with {} candidates",
            request.trip_id,
            ranked.len()
        );
        Ok(ranked)
    }
}
