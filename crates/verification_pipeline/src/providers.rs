use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::DocumentSet;

/// Result of reading an identity document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    /// Extraction confidence in `[0, 1]`
    pub confidence: f64,
    /// Blur score in `[0, 1]`, higher is blurrier
    pub blur_score: f64,
    /// Name read from the document, if any
    #[serde(default)]
    pub extracted_name: Option<String>,
}

/// Result of comparing a selfie with the document photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatchResult {
    /// Match confidence in `[0, 1]`
    pub match_confidence: f64,
    /// Whether the liveness check passed
    pub liveness_passed: bool,
}

/// Errors from external verification services
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status
    #[error("Service returned status {0}")]
    Status(u16),

    /// Call exceeded its time bound
    #[error("Service call timed out after {0:?}")]
    Timeout(Duration),

    /// Service not configured or refused the request
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Trait for document OCR services
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Reads the submitted identity document
    async fn extract(&self, documents: &DocumentSet) -> Result<OcrResult, ProviderError>;
}

/// Trait for face match and liveness services
#[async_trait]
pub trait FaceMatchProvider: Send + Sync {
    /// Compares a selfie with the identity document photo
    async fn compare(
        &self,
        selfie_ref: &str,
        document_ref: &str,
    ) -> Result<FaceMatchResult, ProviderError>;
}

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Ok(Client::builder()
        .user_agent("booking-coordinator/0.1")
        .timeout(timeout)
        .build()?)
}

/// Client for an HTTP OCR service
pub struct HttpOcrClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    document_type: &'a str,
    document_ref: &'a str,
}

impl HttpOcrClient {
    /// Creates a client for the service at `base_url`
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl OcrProvider for HttpOcrClient {
    async fn extract(&self, documents: &DocumentSet) -> Result<OcrResult, ProviderError> {
        let url = format!("{}/ocr", self.base_url.trim_end_matches('/'));
        debug!("Requesting OCR for {} from {}", documents.document_type, url);

        let mut request = self.client.post(&url).json(&OcrRequest {
            document_type: &documents.document_type,
            document_ref: &documents.document_ref,
        });
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            warn!("OCR service returned {}", status);
            return Err(ProviderError::Status(status.as_u16()));
        }

        Ok(response.json::<OcrResult>().await?)
    }
}

/// Client for an HTTP face match service
pub struct HttpFaceMatchClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct FaceMatchRequest<'a> {
    selfie_ref: &'a str,
    document_ref: &'a str,
}

impl HttpFaceMatchClient {
    /// Creates a client for the service at `base_url`
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl FaceMatchProvider for HttpFaceMatchClient {
    async fn compare(
        &self,
        selfie_ref: &str,
        document_ref: &str,
    ) -> Result<FaceMatchResult, ProviderError> {
        let url = format!("{}/face-match", self.base_url.trim_end_matches('/'));
        debug!("Requesting face match from {}", url);

        let mut request = self.client.post(&url).json(&FaceMatchRequest {
            selfie_ref,
            document_ref,
        });
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            warn!("Face match service returned {}", status);
            return Err(ProviderError::Status(status.as_u16()));
        }

        Ok(response.json::<FaceMatchResult>().await?)
    }
}

/// Provider used when no service URL is configured. Every call fails, so
/// cases stall and eventually degrade to manual review.
pub struct UnconfiguredProvider;

#[async_trait]
impl OcrProvider for UnconfiguredProvider {
    async fn extract(&self, _documents: &DocumentSet) -> Result<OcrResult, ProviderError> {
        Err(ProviderError::Unavailable(
            "OCR service is not configured".to_string(),
        ))
    }
}

#[async_trait]
impl FaceMatchProvider for UnconfiguredProvider {
    async fn compare(
        &self,
        _selfie_ref: &str,
        _document_ref: &str,
    ) -> Result<FaceMatchResult, ProviderError> {
        Err(ProviderError::Unavailable(
            "Face match service is not configured".to_string(),
        ))
    }
}
