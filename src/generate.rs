// Client for the external text-to-image inference endpoint.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::metrics;

/// Errors from an image generation attempt.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("image generation is not configured (missing API token)")]
    MissingToken,
    #[error("Failed to fetch image: {0}")]
    Http(String),
    #[error("image generation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to store generated image: {0}")]
    Store(#[from] std::io::Error),
}

/// A stored generated image: the on-disk filename and the URL it is served at.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub filename: String,
    pub url: String,
}

/// Calls the model endpoint with `{ "inputs": <prompt> }` and a bearer token,
/// writes the returned image bytes under a random filename, and hands back a
/// locally addressable URL. No automatic retries: a failed call is surfaced
/// and the player may resubmit.
pub struct GenerationClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    images_dir: PathBuf,
}

impl GenerationClient {
    pub fn new(api_url: String, token: Option<String>, images_dir: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            api_url,
            token,
            images_dir,
        }
    }

    /// Generate one image for the given prompt.
    pub async fn generate(&self, prompt: &str) -> Result<GeneratedArtifact, GenerateError> {
        let token = self.token.as_deref().ok_or(GenerateError::MissingToken)?;

        let started = std::time::Instant::now();
        let result = self.request(prompt, token).await;
        let elapsed = started.elapsed().as_secs_f64();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(GenerateError::Http(_)) => "http_error",
            Err(_) => "transport_error",
        };
        metrics::GENERATION_REQUESTS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        metrics::GENERATION_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(elapsed);

        result
    }

    async fn request(&self, prompt: &str, token: &str) -> Result<GeneratedArtifact, GenerateError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(token)
            .json(&json!({ "inputs": prompt }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "Generation endpoint returned an error");
            return Err(GenerateError::Http(status.to_string()));
        }

        let bytes = response.bytes().await?;
        tokio::fs::create_dir_all(&self.images_dir).await?;
        let filename = format!("{}.png", Uuid::new_v4().simple());
        tokio::fs::write(self.images_dir.join(&filename), &bytes).await?;

        tracing::debug!(filename = %filename, bytes = bytes.len(), "Stored generated image");
        Ok(GeneratedArtifact {
            url: format!("/images/{filename}"),
            filename,
        })
    }
}
