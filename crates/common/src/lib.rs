//! PropBot Common Library
//!
//! Shared code for the PropBot services including:
//! - The conversation core (sessions, routing, registry)
//! - Retrieval, image analysis, and generation collaborators
//! - Embedding client abstraction
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod cache;
pub mod chat;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod generation;
pub mod metrics;
pub mod retrieval;
pub mod vision;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
