//! Message routing between the image path and the retrieval path

use super::Message;
use crate::errors::{AppError, Result};
use crate::generation::ResponseGenerator;
use crate::retrieval::ContextProvider;
use crate::vision::{ImageAnalysis, ImageAnalyzer};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One inbound message, classified by whether it carries an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRequest {
    Text { message: String },
    Image { message: String, image: Vec<u8> },
}

impl RouteRequest {
    /// An absent or empty image routes to the text path
    pub fn new(message: impl Into<String>, image: Option<Vec<u8>>) -> Self {
        let message = message.into();
        match image {
            Some(image) if !image.is_empty() => RouteRequest::Image { message, image },
            _ => RouteRequest::Text { message },
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RouteRequest::Text { message } | RouteRequest::Image { message, .. } => message,
        }
    }

    /// Route label used in logs and metrics
    pub fn route_name(&self) -> &'static str {
        match self {
            RouteRequest::Text { .. } => "text",
            RouteRequest::Image { .. } => "image",
        }
    }
}

/// Outcome of routing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub reply: String,
    pub context_used: String,
}

/// Picks a path per message, builds its context, and generates the reply
pub struct MessageRouter {
    context_provider: Arc<dyn ContextProvider>,
    image_analyzer: Arc<dyn ImageAnalyzer>,
    generator: Arc<dyn ResponseGenerator>,
    timeout: Duration,
}

impl MessageRouter {
    pub fn new(
        context_provider: Arc<dyn ContextProvider>,
        image_analyzer: Arc<dyn ImageAnalyzer>,
        generator: Arc<dyn ResponseGenerator>,
        timeout: Duration,
    ) -> Self {
        Self {
            context_provider,
            image_analyzer,
            generator,
            timeout,
        }
    }

    /// Route one message. `history` already ends with that message.
    pub async fn route(&self, request: &RouteRequest, history: &[Message]) -> Result<RouteResult> {
        let start = Instant::now();

        let context_used = match request {
            RouteRequest::Image { message, image } => {
                let analysis = self
                    .bounded("image_analyzer", self.image_analyzer.analyze(image, message))
                    .await?;
                format_image_context(&analysis)
            }
            RouteRequest::Text { message } => {
                self.bounded("context_provider", self.context_provider.context_for(message))
                    .await?
            }
        };

        let reply = self
            .bounded(
                "generator",
                self.generator.generate(request.message(), history, &context_used),
            )
            .await?;

        tracing::debug!(
            route = request.route_name(),
            context_len = context_used.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Message routed"
        );

        Ok(RouteResult { reply, context_used })
    }

    async fn bounded<T>(
        &self,
        service: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Render an image analysis as generation context
pub fn format_image_context(analysis: &ImageAnalysis) -> String {
    let mut context = format!("Image Analysis:\n{}", analysis.description);

    if !analysis.issues.is_empty() {
        let lines: Vec<String> = analysis
            .issues
            .iter()
            .map(|issue| {
                format!(
                    "- {}: {} (Severity: {})",
                    issue.label, issue.description, issue.severity
                )
            })
            .collect();

        context.push_str("\nDetected Issues:\n");
        context.push_str(&lines.join("\n"));
    }

    context
}
