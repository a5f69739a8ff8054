use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use booking_store::{Notification, NotificationData, NotificationKind};
use notification_services::NotificationDispatcher;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};
use validator::Validate;

use crate::providers::*;
use crate::types::*;

/// One driver's case plus a copy of its stage that readers can take
/// without waiting for the case lock
struct CaseCell {
    case: Mutex<VerificationCase>,
    stage: watch::Sender<VerificationStage>,
}

impl CaseCell {
    fn new(case: VerificationCase) -> Self {
        let (stage, _) = watch::channel(case.stage());
        Self {
            case: Mutex::new(case),
            stage,
        }
    }

    async fn lock(&self) -> CaseGuard<'_> {
        CaseGuard {
            case: self.case.lock().await,
            stage: &self.stage,
        }
    }

    fn stage(&self) -> VerificationStage {
        *self.stage.borrow()
    }
}

/// Case lock that republishes the stage when released
struct CaseGuard<'a> {
    case: MutexGuard<'a, VerificationCase>,
    stage: &'a watch::Sender<VerificationStage>,
}

impl Deref for CaseGuard<'_> {
    type Target = VerificationCase;

    fn deref(&self) -> &VerificationCase {
        &self.case
    }
}

impl DerefMut for CaseGuard<'_> {
    fn deref_mut(&mut self) -> &mut VerificationCase {
        &mut self.case
    }
}

impl Drop for CaseGuard<'_> {
    fn drop(&mut self) {
        let current = self.case.stage();
        self.stage.send_if_modified(|stage| {
            let changed = *stage != current;
            *stage = current;
            changed
        });
    }
}

/// Runs verification cases through their stages.
///
/// Each case sits behind its own lock. The lock is never held across a
/// provider call, and the stage is mirrored in a `watch` cell, so eligibility
/// reads return at once even while a slow OCR or face match is in flight.
pub struct VerificationPipeline {
    config: VerificationConfig,
    ocr: Arc<dyn OcrProvider>,
    face: Arc<dyn FaceMatchProvider>,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    cases: RwLock<HashMap<String, Arc<CaseCell>>>,
    archive: Mutex<Vec<VerificationCase>>,
}

impl VerificationPipeline {
    /// Creates a pipeline using the given external services
    pub fn new(
        ocr: Arc<dyn OcrProvider>,
        face: Arc<dyn FaceMatchProvider>,
        config: Option<VerificationConfig>,
    ) -> Self {
        Self {
            config: config.unwrap_or_default(),
            ocr,
            face,
            dispatcher: None,
            cases: RwLock::new(HashMap::new()),
            archive: Mutex::new(Vec::new()),
        }
    }

    /// Sends stage notifications to drivers through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Thresholds in use
    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Opens a case at `submitted`. A driver whose previous case was rejected
    /// may resubmit; the rejected case is archived.
    pub async fn submit_documents(
        &self,
        driver_id: &str,
        documents: DocumentSet,
    ) -> Result<VerificationCase, VerificationError> {
        if driver_id.trim().is_empty() {
            return Err(VerificationError::Validation(
                "Driver id is required".to_string(),
            ));
        }
        documents
            .validate()
            .map_err(|e| VerificationError::Validation(e.to_string()))?;

        // The map lock is never held while waiting on a case lock.
        let existing = self.cases.read().await.get(driver_id).cloned();
        let replaced = match existing {
            Some(ref cell) => {
                let current = cell.lock().await;
                if current.stage() != VerificationStage::Rejected {
                    return Err(VerificationError::CaseOpen(driver_id.to_string()));
                }
                Some(current.clone())
            }
            None => None,
        };

        let case = VerificationCase::new(driver_id, documents);
        {
            let mut cases = self.cases.write().await;
            let unchanged = match (cases.get(driver_id), existing.as_ref()) {
                (Some(current), Some(seen)) => Arc::ptr_eq(current, seen),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                return Err(VerificationError::CaseOpen(driver_id.to_string()));
            }
            cases.insert(driver_id.to_string(), Arc::new(CaseCell::new(case.clone())));
        }

        if let Some(rejected) = replaced {
            info!(
                "Archived rejected case {} of driver {}",
                rejected.case_id, driver_id
            );
            self.archive.lock().await.push(rejected);
        }
        info!("Opened verification case {} for driver {}", case.case_id, driver_id);
        Ok(case)
    }

    /// Reads the submitted document.
    ///
    /// A usable read moves the case to `ocr_done`. A poor read asks for a
    /// retake and keeps the case at `ocr_pending` until the retake budget is
    /// spent, after which the case goes to manual review.
    pub async fn run_ocr(&self, driver_id: &str) -> Result<VerificationCase, VerificationError> {
        let cell = self.case_cell(driver_id).await?;
        let documents = {
            let mut case = cell.lock().await;
            match case.stage() {
                VerificationStage::Submitted => {
                    case.advance(VerificationStage::OcrPending, "OCR requested")?
                }
                VerificationStage::OcrPending => {}
                stage => {
                    return Err(VerificationError::IllegalTransition {
                        from: stage,
                        to: VerificationStage::OcrDone,
                    });
                }
            }
            case.documents.clone()
        };

        let outcome = self.bounded(self.ocr.extract(&documents)).await;

        let mut case = cell.lock().await;
        // Another call may have settled the case meanwhile.
        if case.stage() != VerificationStage::OcrPending {
            return Err(VerificationError::IllegalTransition {
                from: case.stage(),
                to: VerificationStage::OcrDone,
            });
        }
        let result = match outcome {
            Ok(result) => result,
            Err(e) => return self.record_failure(&mut case, e).await,
        };
        case.stalled = None;
        case.consecutive_failures = 0;

        if result.confidence >= self.config.ocr_confidence_threshold
            && result.blur_score < self.config.ocr_blur_limit
        {
            case.needs_retake = false;
            case.advance(
                VerificationStage::OcrDone,
                format!("OCR confidence {:.2}", result.confidence),
            )?;
            self.notify(
                &case,
                NotificationKind::DocumentVerified,
                "Document verified",
                "Your identity document was read successfully",
            )
            .await;
            return Ok(case.clone());
        }

        case.retake_count += 1;
        case.needs_retake = true;
        info!(
            "OCR for driver {} below threshold (confidence {:.2}, blur {:.2}), retake {}/{}",
            driver_id,
            result.confidence,
            result.blur_score,
            case.retake_count,
            self.config.max_retakes
        );

        if case.retake_count >= self.config.max_retakes {
            let reason = format!(
                "No usable document after {} retakes",
                case.retake_count
            );
            case.advance(VerificationStage::ManualReview, reason.clone())?;
            case.decision_reason = Some(reason);
            self.notify(
                &case,
                NotificationKind::VerificationManualReview,
                "Verification under review",
                "An operator will review your documents",
            )
            .await;
        } else {
            case.updated_at = chrono::Utc::now();
            self.notify(
                &case,
                NotificationKind::RetakeRequested,
                "Please retake your document photo",
                "The photo was unclear. Upload a sharper image of your document",
            )
            .await;
        }

        Ok(case.clone())
    }

    /// Compares a selfie with the document. A mismatch or failed liveness
    /// check goes straight to manual review; it is never retried.
    pub async fn run_face_match(
        &self,
        driver_id: &str,
        selfie_ref: &str,
    ) -> Result<VerificationCase, VerificationError> {
        if selfie_ref.trim().is_empty() {
            return Err(VerificationError::Validation(
                "Selfie reference is required".to_string(),
            ));
        }

        let cell = self.case_cell(driver_id).await?;
        let document_ref = {
            let mut case = cell.lock().await;
            match case.stage() {
                VerificationStage::OcrDone => {
                    case.advance(VerificationStage::FacePending, "Face match requested")?
                }
                VerificationStage::FacePending => {}
                stage => {
                    return Err(VerificationError::IllegalTransition {
                        from: stage,
                        to: VerificationStage::FaceDone,
                    });
                }
            }
            case.documents.document_ref.clone()
        };

        let outcome = self
            .bounded(self.face.compare(selfie_ref, &document_ref))
            .await;

        let mut case = cell.lock().await;
        if case.stage() != VerificationStage::FacePending {
            return Err(VerificationError::IllegalTransition {
                from: case.stage(),
                to: VerificationStage::FaceDone,
            });
        }
        let result = match outcome {
            Ok(result) => result,
            Err(e) => return self.record_failure(&mut case, e).await,
        };
        case.stalled = None;
        case.consecutive_failures = 0;

        if result.match_confidence >= self.config.face_match_threshold && result.liveness_passed {
            case.advance(
                VerificationStage::FaceDone,
                format!("Face match confidence {:.2}", result.match_confidence),
            )?;
        } else {
            let reason = format!(
                "Face match confidence {:.2}, liveness {}",
                result.match_confidence,
                if result.liveness_passed { "passed" } else { "failed" }
            );
            case.advance(VerificationStage::ManualReview, reason.clone())?;
            case.decision_reason = Some(reason);
            self.notify(
                &case,
                NotificationKind::VerificationManualReview,
                "Verification under review",
                "An operator will review your selfie and document",
            )
            .await;
        }

        Ok(case.clone())
    }

    /// Scores risk and decides the case: allow approves, review escalates,
    /// suspend rejects with [`VerificationError::RiskRejected`].
    pub async fn score_risk(
        &self,
        driver_id: &str,
        signals: RiskSignals,
    ) -> Result<VerificationCase, VerificationError> {
        let cell = self.case_cell(driver_id).await?;
        let mut case = cell.lock().await;

        if case.stage() != VerificationStage::FaceDone {
            return Err(VerificationError::IllegalTransition {
                from: case.stage(),
                to: VerificationStage::RiskScored,
            });
        }

        let assessment = self.config.assess(&signals, case.retake_count);
        case.advance(
            VerificationStage::RiskScored,
            format!("Risk score {} ({:?})", assessment.score, assessment.level),
        )?;
        case.risk = Some(assessment.clone());

        match assessment.action {
            RiskAction::Allow => {
                let reason = format!("Risk score {} within allowance", assessment.score);
                case.advance(VerificationStage::Approved, reason.clone())?;
                case.decision_reason = Some(reason);
                info!("Driver {} approved", driver_id);
                self.notify(
                    &case,
                    NotificationKind::VerificationApproved,
                    "You're verified",
                    "You can now be matched with trips",
                )
                .await;
                Ok(case.clone())
            }
            RiskAction::Review => {
                let reason = format!("Risk score {} requires review", assessment.score);
                case.advance(VerificationStage::ManualReview, reason.clone())?;
                case.decision_reason = Some(reason);
                self.notify(
                    &case,
                    NotificationKind::VerificationManualReview,
                    "Verification under review",
                    "An operator will finish your verification",
                )
                .await;
                Ok(case.clone())
            }
            RiskAction::Suspend => {
                let reason = format!(
                    "Risk score {} flagged: {}",
                    assessment.score,
                    assessment.flags.join(", ")
                );
                case.advance(VerificationStage::Rejected, reason.clone())?;
                case.decision_reason = Some(reason.clone());
                warn!(
                    "Driver {} rejected by risk assessment (case {}): {}",
                    driver_id, case.case_id, reason
                );
                self.notify(
                    &case,
                    NotificationKind::VerificationRejected,
                    "Verification rejected",
                    "Your verification could not be completed. You may resubmit documents",
                )
                .await;
                Err(VerificationError::RiskRejected { reason })
            }
        }
    }

    /// Operator decision; the only way out of `manual_review`
    pub async fn resolve_manual_review(
        &self,
        driver_id: &str,
        operator: &str,
        decision: ReviewDecision,
        reason: &str,
    ) -> Result<VerificationCase, VerificationError> {
        if operator.trim().is_empty() || reason.trim().is_empty() {
            return Err(VerificationError::Validation(
                "Operator and reason are required".to_string(),
            ));
        }

        let cell = self.case_cell(driver_id).await?;
        let mut case = cell.lock().await;

        let (target, kind, title, message) = match decision {
            ReviewDecision::Approve => (
                VerificationStage::Approved,
                NotificationKind::VerificationApproved,
                "You're verified",
                "You can now be matched with trips",
            ),
            ReviewDecision::Reject => (
                VerificationStage::Rejected,
                NotificationKind::VerificationRejected,
                "Verification rejected",
                "Your verification could not be completed. You may resubmit documents",
            ),
        };

        if case.stage() != VerificationStage::ManualReview {
            return Err(VerificationError::IllegalTransition {
                from: case.stage(),
                to: target,
            });
        }

        case.advance(target, format!("{} by {}: {}", target, operator, reason))?;
        case.decision_reason = Some(reason.to_string());
        case.needs_retake = false;
        case.stalled = None;
        info!(
            "Operator {} resolved case {} of driver {} as {}",
            operator, case.case_id, driver_id, target
        );
        self.notify(&case, kind, title, message).await;

        Ok(case.clone())
    }

    /// Current case of a driver
    pub async fn get_case(&self, driver_id: &str) -> Result<VerificationCase, VerificationError> {
        let cell = self.case_cell(driver_id).await?;
        let case = cell.case.lock().await;
        Ok(case.clone())
    }

    /// Stage of a driver's current case. Never waits on a case in progress.
    pub async fn stage_of(&self, driver_id: &str) -> Option<VerificationStage> {
        let cell = self.case_cell(driver_id).await.ok()?;
        Some(cell.stage())
    }

    /// Whether a driver may be matched
    pub async fn is_eligible(&self, driver_id: &str) -> bool {
        self.stage_of(driver_id).await == Some(VerificationStage::Approved)
    }

    /// Closed cases replaced by a resubmission, oldest first
    pub async fn archived_cases(&self, driver_id: &str) -> Vec<VerificationCase> {
        self.archive
            .lock()
            .await
            .iter()
            .filter(|case| case.driver_id == driver_id)
            .cloned()
            .collect()
    }

    async fn case_cell(&self, driver_id: &str) -> Result<Arc<CaseCell>, VerificationError> {
        self.cases
            .read()
            .await
            .get(driver_id)
            .cloned()
            .ok_or_else(|| VerificationError::CaseNotFound(driver_id.to_string()))
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.provider_timeout)),
        }
    }

    /// Parks the case after a provider failure. Too many consecutive failures
    /// degrade it to manual review.
    async fn record_failure(
        &self,
        case: &mut VerificationCase,
        failure: ProviderError,
    ) -> Result<VerificationCase, VerificationError> {
        let stage = case.stage();
        let reason = failure.to_string();
        case.consecutive_failures += 1;
        case.updated_at = chrono::Utc::now();

        if case.consecutive_failures < self.config.max_service_failures {
            warn!(
                "Verification of driver {} stalled at {} ({}/{}): {}",
                case.driver_id,
                stage,
                case.consecutive_failures,
                self.config.max_service_failures,
                reason
            );
            case.stalled = Some(StallMarker {
                stage,
                reason: reason.clone(),
                at: case.updated_at,
            });
            return Err(VerificationError::Stalled { stage, reason });
        }

        let decision = format!(
            "Verification services failed {} times: {}",
            case.consecutive_failures, reason
        );
        error!("Case {} degraded to manual review: {}", case.case_id, decision);
        case.advance(VerificationStage::ManualReview, decision.clone())?;
        case.stalled = None;
        case.decision_reason = Some(decision);
        self.notify(
            case,
            NotificationKind::VerificationManualReview,
            "Verification under review",
            "Automatic checks are unavailable, an operator will review your documents",
        )
        .await;

        Ok(case.clone())
    }

    async fn notify(
        &self,
        case: &VerificationCase,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };

        let notification = Notification::new(case.driver_id.as_str(), kind, title, message)
            .with_data(NotificationData {
                driver_id: Some(case.driver_id.clone()),
                ..NotificationData::default()
            });
        if let Err(e) = dispatcher.publish(notification).await {
            error!(
                "Failed to notify driver {} about case {}: {}",
                case.driver_id, case.case_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use booking_store::MemoryStore;

    use super::*;

    /// Returns scripted OCR outcomes in order, repeating the last one
    struct ScriptedOcr(StdMutex<VecDeque<Option<OcrResult>>>);

    impl ScriptedOcr {
        fn new(script: Vec<Option<OcrResult>>) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(script.into())))
        }
    }

    #[async_trait]
    impl OcrProvider for ScriptedOcr {
        async fn extract(&self, _documents: &DocumentSet) -> Result<OcrResult, ProviderError> {
            let mut script = self.0.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            next.ok_or_else(|| ProviderError::Unavailable("ocr down".to_string()))
        }
    }

    struct MockFace(FaceMatchResult);

    #[async_trait]
    impl FaceMatchProvider for MockFace {
        async fn compare(
            &self,
            _selfie_ref: &str,
            _document_ref: &str,
        ) -> Result<FaceMatchResult, ProviderError> {
            Ok(self.0.clone())
        }
    }

    struct SlowOcr;

    #[async_trait]
    impl OcrProvider for SlowOcr {
        async fn extract(&self, _documents: &DocumentSet) -> Result<OcrResult, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(good_read().unwrap())
        }
    }

    fn good_read() -> Option<OcrResult> {
        Some(OcrResult {
            confidence: 0.93,
            blur_score: 0.1,
            extracted_name: Some("Ana".to_string()),
        })
    }

    fn poor_read() -> Option<OcrResult> {
        Some(OcrResult {
            confidence: 0.3,
            blur_score: 0.1,
            extracted_name: None,
        })
    }

    fn matching_face() -> Arc<MockFace> {
        Arc::new(MockFace(FaceMatchResult {
            match_confidence: 0.92,
            liveness_passed: true,
        }))
    }

    fn documents() -> DocumentSet {
        DocumentSet {
            document_type: "license".to_string(),
            document_ref: "s3://docs/license.jpg".to_string(),
            registration_ref: None,
        }
    }

    fn pipeline(ocr: Arc<dyn OcrProvider>, face: Arc<dyn FaceMatchProvider>) -> VerificationPipeline {
        VerificationPipeline::new(ocr, face, None)
    }

    #[tokio::test]
    async fn test_clean_driver_is_approved() {
        let pipeline = pipeline(ScriptedOcr::new(vec![good_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        assert_eq!(
            pipeline.run_ocr("d1").await.unwrap().stage(),
            VerificationStage::OcrDone
        );
        assert_eq!(
            pipeline.run_face_match("d1", "selfie.jpg").await.unwrap().stage(),
            VerificationStage::FaceDone
        );
        let case = pipeline
            .score_risk("d1", RiskSignals::default())
            .await
            .unwrap();
        assert_eq!(case.stage(), VerificationStage::Approved);
        assert!(pipeline.is_eligible("d1").await);

        let stages: Vec<VerificationStage> = case.log().iter().map(|t| t.to).collect();
        assert_eq!(
            stages,
            vec![
                VerificationStage::OcrPending,
                VerificationStage::OcrDone,
                VerificationStage::FacePending,
                VerificationStage::FaceDone,
                VerificationStage::RiskScored,
                VerificationStage::Approved,
            ]
        );
    }

    #[tokio::test]
    async fn test_low_confidence_ocr_requests_retake() {
        let pipeline = pipeline(ScriptedOcr::new(vec![poor_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        let case = pipeline.run_ocr("d1").await.unwrap();
        assert_eq!(case.stage(), VerificationStage::OcrPending);
        assert!(case.needs_retake);
        assert_eq!(case.retake_count, 1);

        pipeline.run_ocr("d1").await.unwrap();
        let case = pipeline.run_ocr("d1").await.unwrap();
        assert_eq!(case.retake_count, 3);
        assert_eq!(case.stage(), VerificationStage::ManualReview);
        assert!(!pipeline.is_eligible("d1").await);
    }

    #[tokio::test]
    async fn test_blurry_document_needs_retake() {
        let blurry = Some(OcrResult {
            confidence: 0.95,
            blur_score: 0.6,
            extracted_name: None,
        });
        let pipeline = pipeline(ScriptedOcr::new(vec![blurry, good_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        assert!(pipeline.run_ocr("d1").await.unwrap().needs_retake);
        let case = pipeline.run_ocr("d1").await.unwrap();
        assert_eq!(case.stage(), VerificationStage::OcrDone);
        assert!(!case.needs_retake);
        assert_eq!(case.retake_count, 1);
    }

    #[tokio::test]
    async fn test_face_mismatch_goes_to_manual_review() {
        let face = Arc::new(MockFace(FaceMatchResult {
            match_confidence: 0.95,
            liveness_passed: false,
        }));
        let pipeline = pipeline(ScriptedOcr::new(vec![good_read()]), face);
        pipeline.submit_documents("d1", documents()).await.unwrap();
        pipeline.run_ocr("d1").await.unwrap();

        let case = pipeline.run_face_match("d1", "selfie.jpg").await.unwrap();
        assert_eq!(case.stage(), VerificationStage::ManualReview);

        let case = pipeline
            .resolve_manual_review("d1", "ops-7", ReviewDecision::Approve, "checked in person")
            .await
            .unwrap();
        assert_eq!(case.stage(), VerificationStage::Approved);
        assert_eq!(case.decision_reason.as_deref(), Some("checked in person"));
    }

    #[tokio::test]
    async fn test_high_risk_is_rejected_and_can_resubmit() {
        let pipeline = pipeline(ScriptedOcr::new(vec![good_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();
        pipeline.run_ocr("d1").await.unwrap();
        pipeline.run_face_match("d1", "selfie.jpg").await.unwrap();

        let signals = RiskSignals {
            duplicate_document: true,
            adverse_history: true,
            recent_attempts: 0,
        };
        let result = pipeline.score_risk("d1", signals).await;
        assert!(matches!(result, Err(VerificationError::RiskRejected { .. })));

        let rejected = pipeline.get_case("d1").await.unwrap();
        assert_eq!(rejected.stage(), VerificationStage::Rejected);
        assert_eq!(rejected.risk.as_ref().unwrap().score, 90);

        let reopened = pipeline.submit_documents("d1", documents()).await.unwrap();
        assert_ne!(reopened.case_id, rejected.case_id);
        assert_eq!(reopened.stage(), VerificationStage::Submitted);
        assert_eq!(pipeline.archived_cases("d1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_service_failure_stalls_then_degrades() {
        let pipeline = pipeline(ScriptedOcr::new(vec![None]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        for _ in 0..2 {
            let result = pipeline.run_ocr("d1").await;
            assert!(matches!(
                result,
                Err(VerificationError::Stalled {
                    stage: VerificationStage::OcrPending,
                    ..
                })
            ));
            let case = pipeline.get_case("d1").await.unwrap();
            assert_eq!(case.stage(), VerificationStage::OcrPending);
            assert!(case.stalled.is_some());
        }

        let case = pipeline.run_ocr("d1").await.unwrap();
        assert_eq!(case.stage(), VerificationStage::ManualReview);
        assert!(case.stalled.is_none());
    }

    #[tokio::test]
    async fn test_recovery_clears_stall() {
        let pipeline = pipeline(ScriptedOcr::new(vec![None, good_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        assert!(pipeline.run_ocr("d1").await.is_err());
        let case = pipeline.run_ocr("d1").await.unwrap();
        assert_eq!(case.stage(), VerificationStage::OcrDone);
        assert!(case.stalled.is_none());
        assert_eq!(case.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let config = VerificationConfig {
            provider_timeout: Duration::from_millis(20),
            ..VerificationConfig::default()
        };
        let pipeline = VerificationPipeline::new(Arc::new(SlowOcr), matching_face(), Some(config));
        pipeline.submit_documents("d1", documents()).await.unwrap();

        match pipeline.run_ocr("d1").await {
            Err(VerificationError::Stalled { reason, .. }) => assert!(reason.contains("timed out")),
            other => panic!("expected a stall, got {:?}", other.map(|c| c.stage())),
        }
    }

    #[tokio::test]
    async fn test_stage_reads_do_not_wait_for_provider_calls() {
        let pipeline = Arc::new(pipeline(Arc::new(SlowOcr), matching_face()));
        pipeline.submit_documents("d1", documents()).await.unwrap();
        pipeline.submit_documents("d2", documents()).await.unwrap();

        let background = pipeline.clone();
        let ocr = tokio::spawn(async move { background.run_ocr("d1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quick = Duration::from_millis(100);
        let stage = timeout(quick, pipeline.stage_of("d1")).await.unwrap();
        assert_eq!(stage, Some(VerificationStage::OcrPending));
        assert!(!timeout(quick, pipeline.is_eligible("d1")).await.unwrap());
        assert_eq!(
            timeout(quick, pipeline.get_case("d1")).await.unwrap().unwrap().stage(),
            VerificationStage::OcrPending
        );

        let resubmit = timeout(quick, pipeline.submit_documents("d1", documents()))
            .await
            .unwrap();
        assert!(matches!(resubmit, Err(VerificationError::CaseOpen(_))));
        assert_eq!(
            timeout(quick, pipeline.stage_of("d2")).await.unwrap(),
            Some(VerificationStage::Submitted)
        );

        ocr.abort();
    }

    #[tokio::test]
    async fn test_out_of_order_operations_are_rejected() {
        let pipeline = pipeline(ScriptedOcr::new(vec![good_read()]), matching_face());
        pipeline.submit_documents("d1", documents()).await.unwrap();

        assert!(matches!(
            pipeline.submit_documents("d1", documents()).await,
            Err(VerificationError::CaseOpen(_))
        ));
        assert!(matches!(
            pipeline.score_risk("d1", RiskSignals::default()).await,
            Err(VerificationError::IllegalTransition { .. })
        ));
        assert!(matches!(
            pipeline.run_face_match("d1", "selfie.jpg").await,
            Err(VerificationError::IllegalTransition { .. })
        ));
        assert!(matches!(
            pipeline
                .resolve_manual_review("d1", "ops", ReviewDecision::Approve, "ok")
                .await,
            Err(VerificationError::IllegalTransition { .. })
        ));
        assert!(matches!(
            pipeline.run_ocr("nobody").await,
            Err(VerificationError::CaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_notifications_reach_driver_inbox() {
        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::new(MemoryStore::new())));
        let pipeline = pipeline(ScriptedOcr::new(vec![poor_read(), good_read()]), matching_face())
            .with_dispatcher(dispatcher.clone());
        pipeline.submit_documents("d1", documents()).await.unwrap();
        pipeline.run_ocr("d1").await.unwrap();
        pipeline.run_ocr("d1").await.unwrap();

        let kinds: Vec<NotificationKind> = dispatcher
            .inbox("d1")
            .await
            .unwrap()
            .iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::RetakeRequested,
                NotificationKind::DocumentVerified
            ]
        );
    }
}
