//! Engine facade.
//!
//! Owns the wired components and exposes the operations the surrounding
//! surfaces call: ingestion, deletion, listing, retrieval, grounded
//! generation, service status, and startup recovery. Backends are injected
//! explicitly so the engine runs against test doubles without any live
//! runtime; [`RagEngine::open`] is the production wiring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{EngineConfig, EnginePaths};
use crate::embedding::{Embedder, LlamaServerEmbedder};
use crate::errors::EngineError;
use crate::index::{SqliteVectorIndex, VectorIndex};
use crate::ingest::{IngestRequest, IngestionPipeline};
use crate::llm::{LanguageModel, LlamaServerClient};
use crate::orchestrator::{Answer, AnswerEvent, ConversationTurn, GenerationOrchestrator};
use crate::retriever::{RetrievalResult, Retriever};
use crate::search::{self, WebSearchProvider};
use crate::store::{DocumentRecord, DocumentStore};

/// Reachability of the engine's collaborators, for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub language_model: bool,
    pub web_search_configured: bool,
    pub vector_index: bool,
}

pub struct RagEngine {
    store: DocumentStore,
    index: Arc<dyn VectorIndex>,
    llm: Arc<dyn LanguageModel>,
    web_configured: bool,
    pipeline: IngestionPipeline,
    retriever: Arc<Retriever>,
    orchestrator: GenerationOrchestrator,
}

impl RagEngine {
    /// Wire an engine from explicitly provided backends.
    pub fn new(
        config: EngineConfig,
        store: DocumentStore,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        web: Option<Arc<dyn WebSearchProvider>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let web_configured = web.is_some();
        let pipeline = IngestionPipeline::new(store.clone(), index.clone(), embedder.clone(), &config);
        let retriever = Arc::new(Retriever::new(
            embedder,
            index.clone(),
            store.clone(),
            web,
            config.retrieval.clone(),
        ));
        let orchestrator = GenerationOrchestrator::new(
            retriever.clone(),
            llm.clone(),
            config.generation.clone(),
            config.retrieval.top_k,
        );

        Ok(Self {
            store,
            index,
            llm,
            web_configured,
            pipeline,
            retriever,
            orchestrator,
        })
    }

    /// Production wiring: SQLite storage under `paths`, llama.cpp-style
    /// model and embedding servers, and the configured web search provider.
    pub async fn open(config: EngineConfig, paths: &EnginePaths) -> Result<Self, EngineError> {
        config.validate()?;

        let store = DocumentStore::open(paths.store_db_path.clone()).await?;
        let index: Arc<dyn VectorIndex> =
            Arc::new(SqliteVectorIndex::open(paths.index_db_path.clone()).await?);
        let embedder: Arc<dyn Embedder> = Arc::new(LlamaServerEmbedder::new(
            config.runtime.embedding_base_url.clone(),
            config.runtime.embedding_model.clone(),
            config.runtime.embedding_dimension,
        ));
        let llm: Arc<dyn LanguageModel> =
            Arc::new(LlamaServerClient::new(config.runtime.model_base_url.clone()));
        let web = search::provider_from_config(&config.runtime);

        let engine = Self::new(config, store, index, embedder, llm, web)?;
        engine.recover().await?;
        Ok(engine)
    }

    /// Startup recovery for ingestions interrupted by a crash.
    pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
        self.pipeline.recover().await
    }

    /// Ingest or re-ingest a document; the returned record carries the
    /// terminal status and, on failure, the error detail.
    pub async fn ingest_document(
        &self,
        request: IngestRequest,
    ) -> Result<DocumentRecord, EngineError> {
        self.pipeline.ingest(request).await
    }

    pub async fn delete_document(&self, document_id: &str, owner: &str) -> Result<(), EngineError> {
        self.pipeline.delete(document_id, owner).await
    }

    pub async fn list_documents(&self, owner: &str) -> Result<Vec<DocumentRecord>, EngineError> {
        self.store.list_documents(owner).await
    }

    pub async fn document_status(
        &self,
        document_id: &str,
        owner: &str,
    ) -> Result<DocumentRecord, EngineError> {
        self.store.get_owned_document(document_id, owner).await
    }

    pub async fn retrieve(
        &self,
        query: &str,
        owner: &str,
        top_k: usize,
        web_search_enabled: bool,
    ) -> Result<RetrievalResult, EngineError> {
        self.retriever
            .retrieve(query, owner, top_k, web_search_enabled)
            .await
    }

    pub async fn answer(
        &self,
        query: &str,
        owner: &str,
        history: &[ConversationTurn],
        web_search_enabled: bool,
    ) -> Result<Answer, EngineError> {
        self.orchestrator
            .answer(query, owner, history, web_search_enabled)
            .await
    }

    pub async fn answer_stream(
        &self,
        query: &str,
        owner: &str,
        history: &[ConversationTurn],
        web_search_enabled: bool,
    ) -> Result<mpsc::Receiver<AnswerEvent>, EngineError> {
        self.orchestrator
            .answer_stream(query, owner, history, web_search_enabled)
            .await
    }

    pub async fn service_status(&self) -> ServiceStatus {
        let language_model = self.llm.health_check().await.unwrap_or(false);
        let vector_index = self
            .index
            .count(&crate::index::IndexFilter::default())
            .await
            .is_ok();

        ServiceStatus {
            language_model,
            web_search_configured: self.web_configured,
            vector_index,
        }
    }
}
