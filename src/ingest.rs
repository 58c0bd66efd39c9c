//! Ingestion pipeline.
//!
//! Drives a document from raw upload bytes to a queryable index generation:
//! extract → chunk → embed → index, with the status machine
//! `pending → processing → indexed | failed` recorded on the document row.
//!
//! Writes for one document are serialized by a per-document lock; a second
//! concurrent call for the same id is rejected as busy. Re-ingestion writes
//! the new generation before the old one is removed so concurrent queries
//! see fully-old or fully-new entries, never a partial mix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::chunker;
use crate::config::{ChunkingConfig, EngineConfig, IngestionConfig};
use crate::embedding::Embedder;
use crate::errors::EngineError;
use crate::extract::{self, DocumentFormat};
use crate::index::{IndexEntry, VectorIndex};
use crate::store::{ChunkRecord, DocumentRecord, DocumentStatus, DocumentStore};

/// Upload handed over by the document source.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub document_id: String,
    pub owner: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub bytes: Vec<u8>,
}

pub struct IngestionPipeline {
    store: DocumentStore,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    retry: IngestionConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IngestionPipeline {
    pub fn new(
        store: DocumentStore,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            chunking: config.chunking.clone(),
            retry: config.ingestion.clone(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest or re-ingest a document.
    ///
    /// Empty payloads and same-document contention are rejected
    /// synchronously; stage failures land on the document row as `failed`
    /// plus error detail, and the final record is returned either way.
    pub async fn ingest(&self, request: IngestRequest) -> Result<DocumentRecord, EngineError> {
        if request.bytes.is_empty() {
            return Err(EngineError::Validation("document is empty".to_string()));
        }
        if request.document_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "document_id must not be empty".to_string(),
            ));
        }

        let _guard = self.try_lock_document(&request.document_id).await?;

        self.store
            .upsert_document(
                &request.document_id,
                &request.owner,
                &request.filename,
                request.format,
            )
            .await?;
        self.store
            .set_status(&request.document_id, DocumentStatus::Processing, None)
            .await?;

        match self.process(&request).await {
            Ok(chunk_count) => {
                self.store
                    .set_status(&request.document_id, DocumentStatus::Indexed, None)
                    .await?;
                tracing::info!(
                    "indexed document {} ({} chunks)",
                    request.document_id,
                    chunk_count
                );
            }
            Err(err) => {
                tracing::warn!("ingestion of {} failed: {}", request.document_id, err);
                // A failed document must never surface in search results.
                if let Err(cleanup) = self.index.delete(&request.document_id).await {
                    tracing::error!(
                        "rollback of index entries for {} failed: {}",
                        request.document_id,
                        cleanup
                    );
                }
                self.store
                    .set_status(
                        &request.document_id,
                        DocumentStatus::Failed,
                        Some(&err.to_string()),
                    )
                    .await?;
            }
        }

        self.store
            .get_owned_document(&request.document_id, &request.owner)
            .await
    }

    async fn process(&self, request: &IngestRequest) -> Result<usize, EngineError> {
        let text = extract::extract_text(&request.bytes, request.format)?;
        let spans = chunker::chunk(&text, self.chunking.max_chunk_size, self.chunking.overlap)?;

        let mut chunks = Vec::with_capacity(spans.len());
        let mut texts = Vec::with_capacity(spans.len());
        for span in &spans {
            chunks.push(ChunkRecord {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: request.document_id.clone(),
                ordinal: span.ordinal as i64,
                text: span.text.clone(),
                start_offset: span.start as i64,
                end_offset: span.end as i64,
                content_hash: content_hash(&span.text),
            });
            texts.push(span.text.clone());
        }

        let vectors = with_retries(&self.retry, "embedding", || {
            self.embedder.embed_batch(&texts)
        })
        .await?;
        if vectors.len() != texts.len() {
            return Err(EngineError::Internal(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            )));
        }

        let ingested_at = Utc::now();
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                chunk_id: chunk.id.clone(),
                document_id: request.document_id.clone(),
                owner: request.owner.clone(),
                model_version: self.embedder.model_version().to_string(),
                ordinal: chunk.ordinal,
                ingested_at,
                vector,
            })
            .collect();

        // New generation first, then swap the store rows, then drop the old
        // generation from the index.
        with_retries(&self.retry, "vector index", || {
            self.index.upsert(entries.clone())
        })
        .await?;

        self.store
            .replace_chunks(&request.document_id, &chunks)
            .await?;

        let keep: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();
        self.index
            .remove_superseded(&request.document_id, &keep)
            .await?;

        Ok(chunks.len())
    }

    /// Delete a document, its chunks, and its index entries.
    pub async fn delete(&self, document_id: &str, owner: &str) -> Result<(), EngineError> {
        let _guard = self.try_lock_document(document_id).await?;

        self.store.get_owned_document(document_id, owner).await?;

        // Vectors first so a failure in between leaves no orphaned entries.
        self.index.delete(document_id).await?;
        self.store.delete_document(document_id).await?;
        tracing::info!("deleted document {}", document_id);
        Ok(())
    }

    /// Startup recovery: documents stranded in `processing` become `failed`
    /// and their index entries are dropped, making them re-ingestible.
    pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
        let interrupted = self.store.recover_interrupted().await?;
        for document_id in &interrupted {
            self.index.delete(document_id).await?;
            tracing::warn!(
                "document {} was interrupted mid-ingestion, marked failed",
                document_id
            );
        }
        Ok(interrupted)
    }

    async fn try_lock_document(
        &self,
        document_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, EngineError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        lock.try_lock_owned().map_err(|_| {
            EngineError::Consistency(format!(
                "document {} is busy with another ingestion",
                document_id
            ))
        })
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bounded exponential backoff for transient failures on the ingestion path.
async fn with_retries<T, Fut>(
    retry: &IngestionConfig,
    service: &str,
    mut op: impl FnMut() -> Fut,
) -> Result<T, EngineError>
where
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = Duration::from_millis(retry.retry_base_delay_ms << (attempt - 1));
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    service,
                    attempt,
                    retry.max_retries,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::embedding::HashingEmbedder;
    use crate::index::{IndexFilter, MemoryVectorIndex};

    const THREE_PARAGRAPHS: &str = "Solar panels convert sunlight into electricity through photovoltaic cells arranged on rooftops. Their output peaks at midday and drops sharply in overcast weather conditions.\n\nWind turbines harvest moving air and feed alternating current into the regional grid. Modern rotor designs capture useful energy even at modest wind speeds across open plains.\n\nBattery banks store surplus generation for the evening demand spike. Chemistry improvements keep pushing storage costs down year after year for household installations.";

    fn request(id: &str, owner: &str, text: &str) -> IngestRequest {
        IngestRequest {
            document_id: id.to_string(),
            owner: owner.to_string(),
            filename: format!("{}.txt", id),
            format: DocumentFormat::PlainText,
            bytes: text.as_bytes().to_vec(),
        }
    }

    async fn test_store() -> DocumentStore {
        let path = std::env::temp_dir().join(format!("ragbot-ingest-{}.db", uuid::Uuid::new_v4()));
        DocumentStore::open(path).await.unwrap()
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.chunking.max_chunk_size = 200;
        config.chunking.overlap = 20;
        config.ingestion.retry_base_delay_ms = 1;
        config
    }

    fn pipeline(
        store: DocumentStore,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> IngestionPipeline {
        IngestionPipeline::new(store, index, embedder, &test_config())
    }

    /// Embedder that fails transiently a fixed number of times.
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        failures_left: AtomicU32,
    }

    impl FlakyEmbedder {
        fn new(failures: u32) -> Self {
            Self {
                inner: HashingEmbedder::default(),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_version(&self) -> &str {
            self.inner.model_version()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::transient("embedding", "simulated outage"));
            }
            self.inner.embed_batch(texts).await
        }
    }

    /// Embedder that blocks long enough to observe lock contention.
    struct SlowEmbedder {
        inner: HashingEmbedder,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_version(&self) -> &str {
            self.inner.model_version()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn three_paragraph_document_indexes_into_ordered_chunks() {
        let store = test_store().await;
        let index: Arc<MemoryVectorIndex> = Arc::new(MemoryVectorIndex::new());
        let pipeline = pipeline(
            store.clone(),
            index.clone(),
            Arc::new(HashingEmbedder::default()),
        );

        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();

        assert_eq!(record.status, DocumentStatus::Indexed);
        assert_eq!(record.chunk_count, 3);
        assert!(record.error.is_none());

        let chunks = store.chunks_for_document("d1").await.unwrap();
        assert_eq!(chunks.len(), 3);
        for (expected, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, expected as i64);
        }
        // Overlapping boundaries between consecutive chunks.
        assert!(chunks[1].start_offset < chunks[0].end_offset);
        assert!(chunks[2].start_offset < chunks[1].end_offset);

        assert_eq!(
            index.count(&IndexFilter::for_owner("alice")).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_before_any_write() {
        let store = test_store().await;
        let pipeline = pipeline(
            store.clone(),
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(HashingEmbedder::default()),
        );

        assert!(matches!(
            pipeline.ingest(request("d1", "alice", "")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(store.get_document("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reingestion_is_idempotent_by_content() {
        let store = test_store().await;
        let index: Arc<MemoryVectorIndex> = Arc::new(MemoryVectorIndex::new());
        let pipeline = pipeline(
            store.clone(),
            index.clone(),
            Arc::new(HashingEmbedder::default()),
        );

        pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        let first: HashSet<(i64, String)> = store
            .chunks_for_document("d1")
            .await
            .unwrap()
            .into_iter()
            .map(|chunk| (chunk.ordinal, chunk.content_hash))
            .collect();

        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);

        let second: HashSet<(i64, String)> = store
            .chunks_for_document("d1")
            .await
            .unwrap()
            .into_iter()
            .map(|chunk| (chunk.ordinal, chunk.content_hash))
            .collect();

        // Same content set, no duplicate or stale entries.
        assert_eq!(first, second);
        assert_eq!(
            index.count(&IndexFilter::for_owner("alice")).await.unwrap(),
            second.len()
        );
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried() {
        let store = test_store().await;
        let pipeline = pipeline(
            store,
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(FlakyEmbedder::new(2)),
        );

        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_document_failed() {
        let store = test_store().await;
        let index: Arc<MemoryVectorIndex> = Arc::new(MemoryVectorIndex::new());
        let pipeline = pipeline(
            store.clone(),
            index.clone(),
            Arc::new(FlakyEmbedder::new(u32::MAX)),
        );

        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert!(record.error.as_deref().unwrap_or("").contains("embedding"));
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 0);

        // A failed document is re-ingestible once the service recovers.
        let pipeline = pipeline_with_good_embedder(store.clone(), index.clone());
        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 3);
    }

    fn pipeline_with_good_embedder(
        store: DocumentStore,
        index: Arc<MemoryVectorIndex>,
    ) -> IngestionPipeline {
        IngestionPipeline::new(
            store,
            index,
            Arc::new(HashingEmbedder::default()),
            &test_config(),
        )
    }

    #[tokio::test]
    async fn concurrent_same_document_ingestion_is_rejected_as_busy() {
        let store = test_store().await;
        let pipeline = pipeline(
            store,
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(SlowEmbedder {
                inner: HashingEmbedder::default(),
            }),
        );

        let (first, second) = tokio::join!(
            pipeline.ingest(request("d1", "alice", THREE_PARAGRAPHS)),
            pipeline.ingest(request("d1", "alice", THREE_PARAGRAPHS))
        );

        let busy = [&first, &second]
            .iter()
            .filter(|result| matches!(result, Err(EngineError::Consistency(_))))
            .count();
        let indexed = [&first, &second]
            .iter()
            .filter(|result| {
                matches!(result, Ok(record) if record.status == DocumentStatus::Indexed)
            })
            .count();
        assert_eq!(busy, 1);
        assert_eq!(indexed, 1);
    }

    #[tokio::test]
    async fn distinct_documents_ingest_concurrently() {
        let store = test_store().await;
        let pipeline = pipeline(
            store,
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(SlowEmbedder {
                inner: HashingEmbedder::default(),
            }),
        );

        let (first, second) = tokio::join!(
            pipeline.ingest(request("d1", "alice", THREE_PARAGRAPHS)),
            pipeline.ingest(request("d2", "alice", THREE_PARAGRAPHS))
        );
        assert_eq!(first.unwrap().status, DocumentStatus::Indexed);
        assert_eq!(second.unwrap().status, DocumentStatus::Indexed);
    }

    #[tokio::test]
    async fn delete_removes_only_the_target_document() {
        let store = test_store().await;
        let index: Arc<MemoryVectorIndex> = Arc::new(MemoryVectorIndex::new());
        let pipeline = pipeline(
            store.clone(),
            index.clone(),
            Arc::new(HashingEmbedder::default()),
        );

        pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        pipeline
            .ingest(request("d2", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();

        pipeline.delete("d1", "alice").await.unwrap();

        assert!(store.get_document("d1").await.unwrap().is_none());
        assert!(store.chunks_for_document("d1").await.unwrap().is_empty());
        let remaining = IndexFilter {
            owner: Some("alice".to_string()),
            document_id: Some("d1".to_string()),
        };
        assert_eq!(index.count(&remaining).await.unwrap(), 0);
        assert_eq!(
            index.count(&IndexFilter::for_owner("alice")).await.unwrap(),
            3
        );
        assert!(store.get_document("d2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_enforces_ownership() {
        let store = test_store().await;
        let pipeline = pipeline(
            store,
            Arc::new(MemoryVectorIndex::new()),
            Arc::new(HashingEmbedder::default()),
        );

        pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert!(matches!(
            pipeline.delete("d1", "bob").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_ingestion_recovers_without_orphans() {
        let store = test_store().await;
        let index: Arc<MemoryVectorIndex> = Arc::new(MemoryVectorIndex::new());
        let embedder = HashingEmbedder::default();

        // Simulate a crash between embedding and completion: the document
        // row is stuck in `processing` with index entries already written.
        store
            .upsert_document("d1", "alice", "d1.txt", DocumentFormat::PlainText)
            .await
            .unwrap();
        store
            .set_status("d1", DocumentStatus::Processing, None)
            .await
            .unwrap();
        index
            .upsert(vec![IndexEntry {
                chunk_id: "orphan".to_string(),
                document_id: "d1".to_string(),
                owner: "alice".to_string(),
                model_version: embedder.model_version().to_string(),
                ordinal: 0,
                ingested_at: Utc::now(),
                vector: vec![1.0, 0.0],
            }])
            .await
            .unwrap();

        let pipeline = pipeline_with_good_embedder(store.clone(), index.clone());
        let recovered = pipeline.recover().await.unwrap();
        assert_eq!(recovered, vec!["d1".to_string()]);

        let record = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 0);

        // Re-ingestion from the recovered state succeeds cleanly.
        let record = pipeline
            .ingest(request("d1", "alice", THREE_PARAGRAPHS))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        assert_eq!(index.count(&IndexFilter::default()).await.unwrap(), 3);
    }
}
