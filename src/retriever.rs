//! Query-time retrieval.
//!
//! Embeds the query, searches the owner's slice of the vector index, joins
//! chunk text back from the document store, and optionally merges bounded
//! web-search results. Web search is an enhancement: any failure or timeout
//! there degrades to local-only results instead of failing the query.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::errors::EngineError;
use crate::index::{IndexFilter, VectorIndex};
use crate::search::{WebSearchProvider, WebSnippet};
use crate::store::{ChunkRecord, DocumentStore};

/// A local chunk hit with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievedItem {
    Local(ScoredChunk),
    Web(WebSnippet),
}

/// Ranked retrieval output for one query; transient, never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedItem>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn local_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, RetrievedItem::Local(_)))
            .count()
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: DocumentStore,
    web: Option<Arc<dyn WebSearchProvider>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: DocumentStore,
        web: Option<Arc<dyn WebSearchProvider>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            web,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        query_text: &str,
        owner: &str,
        top_k: usize,
        web_search_enabled: bool,
    ) -> Result<RetrievalResult, EngineError> {
        if query_text.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".to_string()));
        }
        if top_k == 0 {
            return Err(EngineError::Validation(
                "top_k must be at least 1".to_string(),
            ));
        }

        self.check_embedding_space(owner).await?;

        let query_vector = self.embedder.embed(query_text).await?;
        let filter = IndexFilter::for_owner(owner);

        let (hits, snippets) = tokio::join!(
            self.index.query(&query_vector, top_k, &filter),
            self.web_search(query_text, web_search_enabled)
        );
        let hits = hits?;

        let mut locals = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.store.get_chunk(&hit.entry.chunk_id).await? {
                Some(chunk) => locals.push(ScoredChunk {
                    chunk,
                    score: hit.score,
                }),
                None => {
                    tracing::warn!(
                        "index entry {} has no chunk row, skipping",
                        hit.entry.chunk_id
                    );
                }
            }
        }

        Ok(self.merge(locals, snippets))
    }

    /// Reject queries against entries embedded in a different vector space.
    /// Mixing spaces degrades ranking silently, so this is surfaced as an
    /// explicit consistency failure instead.
    async fn check_embedding_space(&self, owner: &str) -> Result<(), EngineError> {
        let active = self.embedder.model_version();
        let stale: Vec<String> = self
            .index
            .model_versions(owner)
            .await?
            .into_iter()
            .filter(|version| version != active)
            .collect();

        if stale.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Consistency(format!(
                "index holds entries embedded with {:?} but the active model is {:?}; re-ingest the affected documents",
                stale, active
            )))
        }
    }

    /// Bounded web search; degrades to no results on error or deadline.
    async fn web_search(&self, query: &str, enabled: bool) -> Vec<WebSnippet> {
        if !enabled {
            return Vec::new();
        }
        let Some(provider) = &self.web else {
            return Vec::new();
        };

        let deadline = Duration::from_secs(self.config.web_timeout_secs);
        match tokio::time::timeout(
            deadline,
            provider.search(query, self.config.web_max_results),
        )
        .await
        {
            Ok(Ok(snippets)) => snippets,
            Ok(Err(err)) => {
                tracing::warn!("web search failed, using local results only: {}", err);
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("web search timed out after {:?}", deadline);
                Vec::new()
            }
        }
    }

    /// Merge policy: locals ranked by score; locals at or above the
    /// relevance floor outrank every web snippet, locals below it are
    /// ranked behind the web results.
    fn merge(&self, locals: Vec<ScoredChunk>, snippets: Vec<WebSnippet>) -> RetrievalResult {
        let floor = self.config.relevance_floor;
        let mut items = Vec::with_capacity(locals.len() + snippets.len());

        let (strong, weak): (Vec<_>, Vec<_>) = locals
            .into_iter()
            .partition(|local| local.score >= floor);

        items.extend(strong.into_iter().map(RetrievedItem::Local));
        items.extend(snippets.into_iter().map(RetrievedItem::Web));
        items.extend(weak.into_iter().map(RetrievedItem::Local));

        RetrievalResult { items }
    }
}
