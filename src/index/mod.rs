//! Vector index capability.
//!
//! Stores embedding vectors keyed by chunk with owner/document metadata and
//! answers nearest-neighbor queries. The index is a rebuildable projection
//! of chunk embeddings; the document store remains the source of truth for
//! document existence.
//!
//! Implementations: [`SqliteVectorIndex`] (durable, brute-force cosine) and
//! [`MemoryVectorIndex`] (ephemeral, used by tests).

mod memory;
mod sqlite;

pub use memory::MemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// One indexed vector with its retrieval metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub owner: String,
    /// Embedding-space tag of the model that produced the vector.
    pub model_version: String,
    /// Chunk position within its document; second-level tie-break.
    pub ordinal: i64,
    /// First-level tie-break: most recent wins.
    pub ingested_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

/// Scope restriction for queries. Owner scoping is how tenant isolation is
/// enforced; the engine's query path always sets it.
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub owner: Option<String>,
    pub document_id: Option<String>,
}

impl IndexFilter {
    pub fn for_owner(owner: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            document_id: None,
        }
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(owner) = &self.owner {
            if &entry.owner != owner {
                return false;
            }
        }
        if let Some(document_id) = &self.document_id {
            if &entry.document_id != document_id {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries; replacing keys on `chunk_id`.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), EngineError>;

    /// Remove every entry of a document. Idempotent; returns the number of
    /// entries removed.
    async fn delete(&self, document_id: &str) -> Result<usize, EngineError>;

    /// Remove a document's entries except the listed chunk ids. Used to drop
    /// a superseded generation after its replacement is fully written.
    async fn remove_superseded(
        &self,
        document_id: &str,
        keep_chunk_ids: &[String],
    ) -> Result<usize, EngineError>;

    /// Ranked nearest-neighbor search within the filter scope. Returns at
    /// most `top_k` entries; fewer when the scope holds fewer matches.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredEntry>, EngineError>;

    /// Distinct embedding-model tags present in an owner's scope.
    async fn model_versions(&self, owner: &str) -> Result<Vec<String>, EngineError>;

    async fn count(&self, filter: &IndexFilter) -> Result<usize, EngineError>;
}

pub(crate) fn validate_top_k(top_k: usize) -> Result<(), EngineError> {
    if top_k == 0 {
        return Err(EngineError::Validation(
            "top_k must be at least 1".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Shared ranking: score descending, ties to the most recently ingested,
/// then to the lower chunk ordinal.
pub(crate) fn rank(mut scored: Vec<ScoredEntry>, top_k: usize) -> Vec<ScoredEntry> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entry.ingested_at.cmp(&a.entry.ingested_at))
            .then_with(|| a.entry.ordinal.cmp(&b.entry.ordinal))
    });
    scored.truncate(top_k);
    scored
}
