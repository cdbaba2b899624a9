//! Image captioning backends

use crate::config::VisionConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for image captioning
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Produce a one-line caption for raw image bytes
    async fn caption(&self, image: &[u8]) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Captioner backed by the Hugging Face image-to-text inference API
pub struct HuggingFaceCaptioner {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

#[derive(Deserialize)]
struct GeneratedText {
    generated_text: String,
}

impl HuggingFaceCaptioner {
    /// Create a new captioner
    pub fn new(config: &VisionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api-inference.huggingface.co".to_string()),
        })
    }

    async fn make_request(&self, image: &[u8]) -> Result<String> {
        let url = format!("{}/models/{}", self.base_url, self.model);

        let mut request = self.client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec());

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| AppError::VisionError {
            message: format!("Request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::VisionError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: Vec<GeneratedText> = response.json().await.map_err(|e| {
            AppError::VisionError {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        result
            .into_iter()
            .next()
            .map(|g| g.generated_text.trim().to_string())
            .ok_or_else(|| AppError::VisionError {
                message: "Empty response".to_string(),
            })
    }
}

#[async_trait]
impl Captioner for HuggingFaceCaptioner {
    async fn caption(&self, image: &[u8]) -> Result<String> {
        let start = Instant::now();
        let result = self.make_request(image).await;
        metrics::record_collaborator("captioner", start.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Captioner that returns a fixed caption, for offline runs and tests
pub struct MockCaptioner {
    caption: String,
}

impl MockCaptioner {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
        }
    }
}

#[async_trait]
impl Captioner for MockCaptioner {
    async fn caption(&self, _image: &[u8]) -> Result<String> {
        Ok(self.caption.clone())
    }

    fn model_name(&self) -> &str {
        "mock-captioner"
    }
}

/// Create a captioner based on configuration
pub fn create_captioner(config: &VisionConfig) -> Result<Arc<dyn Captioner>> {
    match config.provider.as_str() {
        "huggingface" => Ok(Arc::new(HuggingFaceCaptioner::new(config)?)),
        "mock" => Ok(Arc::new(MockCaptioner::new(config.mock_caption.clone()))),
        other => {
            tracing::warn!(provider = other, "Unknown captioning provider, using mock");
            Ok(Arc::new(MockCaptioner::new(config.mock_caption.clone())))
        }
    }
}
