//! Ingestion processor
//!
//! Core logic for building the retrieval index: PDF extraction, chunking,
//! embedding, and index persistence.

use crate::chunker::{chunk_text, ChunkingConfig};
use crate::errors::IngestionError;
use crate::pdf::extract_text_from_pdf;
use propbot_common::embeddings::Embedder;
use propbot_common::retrieval::VectorIndex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Outcome of one ingestion run
#[derive(Debug, Clone)]
pub struct IngestionSummary {
    pub characters: usize,
    pub chunks: usize,
    pub duration_ms: u64,
}

/// Ingestion processor
pub struct IngestionProcessor {
    embedder: Arc<dyn Embedder>,
    chunking_config: ChunkingConfig,
}

impl IngestionProcessor {
    pub fn new(embedder: Arc<dyn Embedder>, chunking_config: ChunkingConfig) -> Self {
        Self {
            embedder,
            chunking_config,
        }
    }

    /// Ingest a PDF: write its raw text to `text_out` and its index to `index_out`
    #[instrument(skip(self), fields(model = self.embedder.model_name()))]
    pub async fn process_pdf(
        &self,
        pdf: &Path,
        text_out: &Path,
        index_out: &Path,
    ) -> Result<IngestionSummary, IngestionError> {
        let start = Instant::now();

        let text = extract_text_from_pdf(pdf)?;
        write_text(text_out, &text)?;
        info!(path = %text_out.display(), characters = text.len(), "Extracted text written");

        let index = self.build_index(&text).await?;
        index
            .save(index_out)
            .map_err(|e| IngestionError::IndexError(e.to_string()))?;

        let summary = IngestionSummary {
            characters: text.len(),
            chunks: index.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            path = %index_out.display(),
            chunks = summary.chunks,
            duration_ms = summary.duration_ms,
            "Vector index written"
        );

        Ok(summary)
    }

    /// Chunk and embed `text` into a fresh index
    pub async fn build_index(&self, text: &str) -> Result<VectorIndex, IngestionError> {
        let chunks: Vec<String> = chunk_text(text, &self.chunking_config)?
            .into_iter()
            .map(|chunk| chunk.content)
            .collect();

        if chunks.is_empty() {
            return Err(IngestionError::ChunkingError("document produced no chunks".to_string()));
        }

        let embeddings = self
            .embedder
            .embed_batch(&chunks)
            .await
            .map_err(|e| IngestionError::EmbeddingError(e.to_string()))?;

        let mut index = VectorIndex::new(self.embedder.model_name(), self.embedder.dimension());
        index
            .add(chunks, embeddings)
            .map_err(|e| IngestionError::IndexError(e.to_string()))?;

        Ok(index)
    }
}

fn write_text(path: &Path, text: &str) -> Result<(), IngestionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, text)?;
    Ok(())
}
