//! Image analysis for property photos
//!
//! Provides:
//! - The `ImageAnalyzer` seam used by the message router
//! - Caption-based analysis with keyword issue tagging
//! - Captioning backends (hosted inference API, mock)

mod captioner;

pub use captioner::{create_captioner, Captioner, HuggingFaceCaptioner, MockCaptioner};

use crate::errors::Result;
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How urgent a detected issue is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        };
        f.write_str(s)
    }
}

/// A problem flagged in an image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectedIssue {
    pub label: String,
    pub severity: Severity,
    pub description: String,
}

/// Result of analyzing one image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAnalysis {
    /// Natural-language description of the image
    pub description: String,

    /// Issues flagged from the description
    pub issues: Vec<DetectedIssue>,
}

/// Trait for image analysis
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    /// Describe an image and flag issues, given the user's question about it
    async fn analyze(&self, image: &[u8], prompt: &str) -> Result<ImageAnalysis>;
}

/// Keyword triggers: (substring, label, severity, description)
const ISSUE_RULES: &[(&str, &str, Severity, &str)] = &[
    (
        "mold",
        "Mold detected",
        Severity::High,
        "Presence of mold indicates potential health hazard and moisture problems",
    ),
    (
        "damage",
        "Structural damage",
        Severity::High,
        "Visible damage that may require immediate attention",
    ),
    (
        "crack",
        "Cracks present",
        Severity::High,
        "Cracks may indicate structural issues or settling",
    ),
];

/// Tag issues in a caption by case-insensitive substring match
pub fn detect_issues(caption: &str) -> Vec<DetectedIssue> {
    let lower = caption.to_lowercase();

    ISSUE_RULES
        .iter()
        .filter(|(trigger, ..)| lower.contains(trigger))
        .map(|(_, label, severity, description)| DetectedIssue {
            label: label.to_string(),
            severity: *severity,
            description: description.to_string(),
        })
        .collect()
}

/// Analyzer that captions the image and tags issues from the caption
pub struct CaptioningAnalyzer {
    captioner: Arc<dyn Captioner>,
}

impl CaptioningAnalyzer {
    pub fn new(captioner: Arc<dyn Captioner>) -> Self {
        Self { captioner }
    }
}

#[async_trait]
impl ImageAnalyzer for CaptioningAnalyzer {
    async fn analyze(&self, image: &[u8], prompt: &str) -> Result<ImageAnalysis> {
        // The captioning model is unconditional; the prompt only shapes generation later.
        let caption = self.captioner.caption(image).await?;
        let issues = detect_issues(&caption);

        for issue in &issues {
            metrics::record_detected_issue(&issue.label);
        }

        tracing::debug!(
            image_bytes = image.len(),
            prompt_len = prompt.len(),
            caption = %caption,
            issues = issues.len(),
            "Image analyzed"
        );

        Ok(ImageAnalysis {
            description: caption,
            issues,
        })
    }
}
