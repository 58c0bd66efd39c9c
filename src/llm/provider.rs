use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::CompletionRequest;
use crate::errors::EngineError;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name (e.g. "llama_server").
    fn name(&self) -> &str;

    /// Check if the model runtime is reachable.
    async fn health_check(&self) -> Result<bool, EngineError>;

    /// Completion (non-streaming).
    async fn complete(&self, request: CompletionRequest) -> Result<String, EngineError>;

    /// Streaming completion. Fragments arrive in generation order; the
    /// channel closing without an error is not a completion signal by
    /// itself — the orchestrator layers its own terminal markers on top.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError>;
}
