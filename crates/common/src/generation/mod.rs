//! Reply generation
//!
//! Provides:
//! - The `ResponseGenerator` seam used by the message router
//! - Prompt assembly from context, prior turns, and the current message
//! - Hosted LLM clients (Gemini, OpenAI-compatible) and a mock

pub mod prompt;

use crate::chat::Message;
use crate::config::GenerationConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use prompt::build_prompt;

/// Trait for reply generation
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate a reply to `message` given prior turns and reference context.
    /// `history` ends with the message being answered.
    async fn generate(&self, message: &str, history: &[Message], context: &str) -> Result<String>;
}

/// Hosted model API flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    OpenAI,
}

impl LlmProvider {
    fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            LlmProvider::OpenAI => "https://api.openai.com/v1",
        }
    }
}

/// Generator backed by a hosted language model
pub struct LlmGenerator {
    provider: LlmProvider,
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

// Gemini generateContent wire types
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

// OpenAI chat completions wire types
#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl LlmGenerator {
    /// Create a new generator
    pub fn new(provider: LlmProvider, config: &GenerationConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: format!("{:?} generation provider requires generation.api_key", provider),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            provider,
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| provider.default_base_url().to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn call_gemini(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt.to_string() }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let response = self.client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::GenerationError {
                message: format!("LLM API request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            AppError::GenerationError {
                message: format!("Failed to parse LLM response: {}", e),
            }
        })?;

        extract_gemini_text(parsed)
    }

    async fn call_openai(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::GenerationError {
                message: format!("LLM API request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            AppError::GenerationError {
                message: format!("Failed to parse LLM response: {}", e),
            }
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::GenerationError {
                message: "Empty response from LLM".to_string(),
            })
    }
}

fn extract_gemini_text(response: GeminiResponse) -> Result<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(AppError::GenerationError {
            message: "Empty response from LLM".to_string(),
        });
    }
    Ok(text)
}

#[async_trait]
impl ResponseGenerator for LlmGenerator {
    async fn generate(&self, message: &str, history: &[Message], context: &str) -> Result<String> {
        let prompt = build_prompt(message, history, context);
        let start = Instant::now();

        let result = match self.provider {
            LlmProvider::Gemini => self.call_gemini(&prompt).await,
            LlmProvider::OpenAI => self.call_openai(&prompt).await,
        };

        metrics::record_collaborator("generator", start.elapsed().as_secs_f64(), result.is_ok());
        tracing::debug!(
            provider = ?self.provider,
            model = %self.model,
            prompt_len = prompt.len(),
            history_len = history.len(),
            ok = result.is_ok(),
            "Generation finished"
        );

        result
    }
}

/// Generator that answers without calling a model, for local runs
pub struct MockGenerator;

#[async_trait]
impl ResponseGenerator for MockGenerator {
    async fn generate(&self, message: &str, history: &[Message], context: &str) -> Result<String> {
        let grounding = if context.trim().is_empty() {
            "I have no reference material for this.".to_string()
        } else {
            format!("I found {} characters of reference material.", context.len())
        };

        Ok(format!(
            "You asked: {} {} (turn {}) [Mock response - LLM API key not configured]",
            message,
            grounding,
            history.len().saturating_sub(1).div_ceil(2).max(1)
        ))
    }
}

/// Create a generator based on configuration
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn ResponseGenerator>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(LlmGenerator::new(LlmProvider::Gemini, config)?)),
        "openai" => Ok(Arc::new(LlmGenerator::new(LlmProvider::OpenAI, config)?)),
        "mock" => Ok(Arc::new(MockGenerator)),
        other => {
            tracing::warn!(provider = other, "Unknown generation provider, using mock");
            Ok(Arc::new(MockGenerator))
        }
    }
}
