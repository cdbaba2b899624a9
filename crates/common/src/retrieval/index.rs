//! Flat vector index
//!
//! Exact nearest-neighbour search by L2 distance over every stored chunk,
//! persisted as a single JSON file written by the ingest tool.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One embedded chunk of reference text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub content: String,
    pub embedding: Vec<f32>,
}

/// A search hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub content: String,
    /// Squared L2 distance to the query (lower is closer)
    pub distance: f32,
}

/// Flat (brute-force) vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    model: String,
    dimension: usize,
    chunks: Vec<IndexedChunk>,
}

impl VectorIndex {
    /// Create an empty index for embeddings of `dimension` from `model`
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            chunks: Vec::new(),
        }
    }

    /// Add chunks with their embeddings
    pub fn add(&mut self, contents: Vec<String>, embeddings: Vec<Vec<f32>>) -> Result<()> {
        if contents.len() != embeddings.len() {
            return Err(AppError::Internal {
                message: format!(
                    "{} chunks but {} embeddings",
                    contents.len(),
                    embeddings.len()
                ),
            });
        }

        for (content, embedding) in contents.into_iter().zip(embeddings) {
            self.check_dimension(&embedding)?;
            self.chunks.push(IndexedChunk { content, embedding });
        }
        Ok(())
    }

    /// Return the `k` chunks nearest to `query`, closest first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        self.check_dimension(query)?;

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .map(|chunk| ScoredChunk {
                content: chunk.content.clone(),
                distance: squared_l2(query, &chunk.embedding),
            })
            .collect();

        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Load an index written by `save`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
            message: format!(
                "Vector index not found at {} ({}). Run the ingest tool first.",
                path.display(),
                e
            ),
        })?;

        let index: VectorIndex = serde_json::from_str(&raw)?;
        if let Some(bad) = index.chunks.iter().find(|c| c.embedding.len() != index.dimension) {
            return Err(AppError::Configuration {
                message: format!(
                    "Corrupt vector index {}: chunk of dimension {} in a {}-dimension index",
                    path.display(),
                    bad.embedding.len(),
                    index.dimension
                ),
            });
        }

        tracing::info!(
            path = %path.display(),
            chunks = index.len(),
            model = %index.model,
            "Vector index loaded"
        );
        Ok(index)
    }

    /// Persist the index, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(AppError::RetrievalError {
                message: format!(
                    "Embedding dimension {} does not match index dimension {}",
                    vector.len(),
                    self.dimension
                ),
            });
        }
        Ok(())
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
