//! Capability adapters: the boundary to external generation services.
//!
//! Every generation kind goes through one uniform interface; the scheduler
//! never knows which vendor sits behind it. Calls are the pipeline's only
//! suspension points.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use engine::graph::AssetKind;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("generation job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("invalid response from generation service: {0}")]
    InvalidResponse(String),
    #[error("generation cancelled before dispatch")]
    Cancelled,
}

/// Handle to a generated asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub url: String,
    /// Duration as reported by the service; audio/video kinds only.
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationParams {
    pub kind: AssetKind,
    pub prompt: String,
    pub duration_secs: Option<u32>,
    pub scene_index: Option<usize>,
    /// Character reference handed to scene image generation.
    pub reference_image_url: Option<String>,
}

#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    async fn generate(&self, params: &GenerationParams) -> Result<AssetRef, GenerationError>;
}

/// HTTP adapter: submits a generation job and polls until it settles.
pub struct HttpAdapter {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String, // "pending" | "ready" | "failed"
    url: Option<String>,
    duration_secs: Option<f64>,
    error: Option<String>,
}

impl HttpAdapter {
    pub fn new(base_url: String) -> Self {
        HttpAdapter {
            client: reqwest::Client::new(),
            base_url,
            poll_interval: Duration::from_secs(2),
        }
    }

    fn endpoint(kind: AssetKind) -> &'static str {
        match kind {
            AssetKind::CharacterImage | AssetKind::SceneImage => "image",
            AssetKind::NarrationAudio => "voice",
            AssetKind::Music => "music",
            AssetKind::MotionVideo => "motion",
        }
    }

    async fn submit(&self, params: &GenerationParams) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, Self::endpoint(params.kind)))
            .json(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service {
                status: status.as_u16(),
                message,
            });
        }
        let submit: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        Ok(submit.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<AssetRef, GenerationError> {
        loop {
            let response = self
                .client
                .get(format!("{}/jobs/{}", self.base_url, job_id))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(GenerationError::Service {
                    status: status.as_u16(),
                    message,
                });
            }
            let job: JobResponse = response
                .json()
                .await
                .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

            match job.status.as_str() {
                "ready" => {
                    let url = job.url.ok_or_else(|| {
                        GenerationError::InvalidResponse("ready job without url".to_string())
                    })?;
                    return Ok(AssetRef {
                        url,
                        duration_secs: job.duration_secs,
                    });
                }
                "failed" => {
                    return Err(GenerationError::JobFailed {
                        job_id: job_id.to_string(),
                        message: job.error.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl CapabilityAdapter for HttpAdapter {
    async fn generate(&self, params: &GenerationParams) -> Result<AssetRef, GenerationError> {
        let job_id = self.submit(params).await?;
        self.poll(&job_id).await
    }
}
