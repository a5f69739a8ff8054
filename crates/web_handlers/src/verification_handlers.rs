use actix_web::{HttpResponse, Result, web};
use validator::Validate;
use verification_pipeline::{DocumentSet, RiskSignals, VerificationError, VerificationPipeline};

use crate::api_types::{FaceMatchRequest, ReviewRequest, SubmitDocumentsResponse};

/// Opens a verification case with the driver's documents
pub async fn submit_documents(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
    request: web::Json<DocumentSet>,
) -> Result<HttpResponse, VerificationError> {
    let driver_id = path.into_inner();
    let case = pipeline
        .submit_documents(&driver_id, request.into_inner())
        .await?;
    log::info!("Verification case {} opened for {}", case.case_id, driver_id);

    Ok(HttpResponse::Ok().json(SubmitDocumentsResponse {
        case_id: case.case_id,
        stage: case.stage(),
    }))
}

/// Runs OCR on the submitted document
pub async fn run_ocr(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
) -> Result<HttpResponse, VerificationError> {
    let case = pipeline.run_ocr(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(case))
}

/// Compares the driver's selfie with the document photo
pub async fn run_face_match(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
    request: web::Json<FaceMatchRequest>,
) -> Result<HttpResponse, VerificationError> {
    let case = pipeline
        .run_face_match(&path.into_inner(), &request.selfie_ref)
        .await?;
    Ok(HttpResponse::Ok().json(case))
}

/// Scores risk and decides the case
pub async fn score_risk(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
    request: web::Json<RiskSignals>,
) -> Result<HttpResponse, VerificationError> {
    let case = pipeline
        .score_risk(&path.into_inner(), request.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(case))
}

/// Records an operator's decision on a case in manual review
pub async fn review_case(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
    request: web::Json<ReviewRequest>,
) -> Result<HttpResponse, VerificationError> {
    request
        .validate()
        .map_err(|e| VerificationError::Validation(e.to_string()))?;

    let driver_id = path.into_inner();
    let case = pipeline
        .resolve_manual_review(
            &driver_id,
            &request.operator_id,
            request.decision,
            &request.reason,
        )
        .await?;
    log::info!(
        "Operator {} decided case {} for {}: {:?}",
        request.operator_id,
        case.case_id,
        driver_id,
        request.decision
    );

    Ok(HttpResponse::Ok().json(case))
}

/// Gets the driver's open case
pub async fn get_case(
    pipeline: web::Data<VerificationPipeline>,
    path: web::Path<String>,
) -> Result<HttpResponse, VerificationError> {
    let case = pipeline.get_case(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(case))
}
