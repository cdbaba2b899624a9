//! Document retrieval for the text path
//!
//! Provides:
//! - The `ContextProvider` seam used by the message router
//! - A flat vector index built by the ingest tool
//! - Embedding-based context lookup over that index

mod index;

pub use index::{IndexedChunk, ScoredChunk, VectorIndex};

use crate::embeddings::Embedder;
use crate::errors::Result;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Trait for reference-text lookup
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Return reference text relevant to `query`; may be empty
    async fn context_for(&self, query: &str) -> Result<String>;
}

/// Context provider backed by an embedder and a vector index
pub struct VectorContextProvider {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    top_k: usize,
}

impl VectorContextProvider {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, top_k: usize) -> Self {
        if embedder.model_name() != index.model() {
            tracing::warn!(
                embedder = embedder.model_name(),
                index = index.model(),
                "Embedding model differs from the model the index was built with"
            );
        }

        Self { embedder, index, top_k }
    }

    async fn lookup(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let embedding = self.embedder.embed(query).await?;
        self.index.search(&embedding, self.top_k)
    }
}

#[async_trait]
impl ContextProvider for VectorContextProvider {
    async fn context_for(&self, query: &str) -> Result<String> {
        let start = Instant::now();
        let preview: String = query.chars().take(50).collect();

        match self.lookup(query).await {
            Ok(hits) => {
                metrics::record_collaborator("retrieval", start.elapsed().as_secs_f64(), true);
                tracing::debug!(query = %preview, documents = hits.len(), "Context retrieved");

                Ok(hits
                    .into_iter()
                    .map(|hit| hit.content)
                    .collect::<Vec<_>>()
                    .join("\n\n"))
            }
            Err(e) => {
                // A failed lookup degrades to "no context" rather than failing the turn.
                metrics::record_collaborator("retrieval", start.elapsed().as_secs_f64(), false);
                metrics::record_retrieval_fallback();
                tracing::warn!(query = %preview, error = %e, "Context retrieval failed, continuing without context");
                Ok(String::new())
            }
        }
    }
}
