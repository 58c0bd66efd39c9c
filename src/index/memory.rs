//! In-memory vector index.
//!
//! Same contract as the SQLite implementation without durability. Backs
//! tests and throwaway sessions where the index is rebuilt on startup.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    cosine_similarity, rank, validate_top_k, IndexEntry, IndexFilter, ScoredEntry, VectorIndex,
};
use crate::errors::EngineError;

#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), EngineError> {
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(entry.chunk_id.clone(), entry);
        }
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<usize, EngineError> {
        let mut map = self.entries.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.document_id != document_id);
        Ok(before - map.len())
    }

    async fn remove_superseded(
        &self,
        document_id: &str,
        keep_chunk_ids: &[String],
    ) -> Result<usize, EngineError> {
        let mut map = self.entries.write().await;
        let before = map.len();
        map.retain(|chunk_id, entry| {
            entry.document_id != document_id || keep_chunk_ids.contains(chunk_id)
        });
        Ok(before - map.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredEntry>, EngineError> {
        validate_top_k(top_k)?;

        let map = self.entries.read().await;
        let scored = map
            .values()
            .filter(|entry| filter.matches(entry))
            .map(|entry| ScoredEntry {
                score: cosine_similarity(vector, &entry.vector),
                entry: entry.clone(),
            })
            .collect();

        Ok(rank(scored, top_k))
    }

    async fn model_versions(&self, owner: &str) -> Result<Vec<String>, EngineError> {
        let map = self.entries.read().await;
        let mut versions: Vec<String> = map
            .values()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.model_version.clone())
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, EngineError> {
        let map = self.entries.read().await;
        Ok(map.values().filter(|entry| filter.matches(entry)).count())
    }
}
