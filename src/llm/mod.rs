//! Language model capability.
//!
//! The generation orchestrator depends only on the [`LanguageModel`] trait;
//! the llama.cpp server adapter is the shipped implementation.

mod llama_server;
mod provider;
mod types;

pub use llama_server::LlamaServerClient;
pub use provider::LanguageModel;
pub use types::CompletionRequest;
