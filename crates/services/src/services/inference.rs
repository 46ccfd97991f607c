use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use super::config::InferenceConfig;

const INVOKE_TIMEOUT: Duration = Duration::from_secs(120);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum InferenceError {
    /// Network failure or 5xx; worth retrying.
    #[error("Inference request failed: {0}")]
    Request(String),
    #[error("Inference rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Inference response was malformed: {0}")]
    Malformed(String),
    #[error("Inference returned no images")]
    EmptyResult,
}

impl InferenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, InferenceError::Request(_))
    }
}

/// One image produced by a model call.
#[derive(Clone, Debug, Deserialize)]
pub struct GeneratedImage {
    pub url: String,
    #[serde(default, alias = "contentType")]
    pub content_type: String,
}

/// Bytes pulled down from a URL, with the content type the origin reported.
#[derive(Clone, Debug)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Deserialize)]
struct ImagesPayload {
    images: Vec<GeneratedImage>,
}

/// The model API answers either `{images: [...]}` or the same payload nested
/// under `data`. Anything else fails to parse and surfaces as `Malformed`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseEnvelope {
    Wrapped { data: ImagesPayload },
    Bare(ImagesPayload),
}

impl ResponseEnvelope {
    fn into_images(self) -> Vec<GeneratedImage> {
        match self {
            ResponseEnvelope::Wrapped { data } => data.images,
            ResponseEnvelope::Bare(payload) => payload.images,
        }
    }
}

/// External model calls plus the raw byte fetches around them. Behind a
/// trait so runs can be driven against a stub in tests.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Full-image enhancement.
    async fn enhance(
        &self,
        image_url: &str,
        prompt: &str,
    ) -> Result<GeneratedImage, InferenceError>;

    /// Masked removal (mask present) or generative add (mask absent).
    async fn edit(
        &self,
        image_url: &str,
        mask_url: Option<&str>,
        prompt: &str,
    ) -> Result<GeneratedImage, InferenceError>;

    /// Download of an image the model produced or referenced.
    async fn fetch(&self, url: &str) -> Result<FetchedImage, InferenceError>;
}

pub struct HttpInferenceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    async fn invoke(&self, endpoint: &str, body: Value) -> Result<GeneratedImage, InferenceError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut request = self.http.post(&url).timeout(INVOKE_TIMEOUT).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        let status = response.status();

        if status.is_server_error() {
            return Err(InferenceError::Request(format!(
                "{endpoint} returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        envelope
            .into_images()
            .into_iter()
            .next()
            .ok_or(InferenceError::EmptyResult)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn enhance(
        &self,
        image_url: &str,
        prompt: &str,
    ) -> Result<GeneratedImage, InferenceError> {
        self.invoke(
            "v1/enhance",
            json!({ "image_url": image_url, "prompt": prompt }),
        )
        .await
    }

    async fn edit(
        &self,
        image_url: &str,
        mask_url: Option<&str>,
        prompt: &str,
    ) -> Result<GeneratedImage, InferenceError> {
        self.invoke(
            "v1/edit",
            json!({ "image_url": image_url, "mask_url": mask_url, "prompt": prompt }),
        )
        .await
    }

    async fn fetch(&self, url: &str) -> Result<FetchedImage, InferenceError> {
        let response = self
            .http
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        let status = response.status();

        if status.is_server_error() {
            return Err(InferenceError::Request(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?
            .to_vec();

        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}
