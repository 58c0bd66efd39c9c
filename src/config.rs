//! Engine configuration.
//!
//! Every tunable the retrieval and generation layers depend on lives here so
//! callers can adjust them without recompiling: chunk geometry, the retrieval
//! relevance floor, the prompt context budget, ingestion retry policy, and
//! the endpoints/bounds of the external runtimes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Filesystem layout for engine data.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub store_db_path: PathBuf,
    pub index_db_path: PathBuf,
}

impl EnginePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let log_dir = data_dir.join("logs");
        let store_db_path = data_dir.join("documents.db");
        let index_db_path = data_dir.join("index.db");

        for dir in [&data_dir, &log_dir] {
            let _ = fs::create_dir_all(dir);
        }

        EnginePaths {
            data_dir,
            log_dir,
            store_db_path,
            index_db_path,
        }
    }
}

/// Top-level engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub max_chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of local chunks to retrieve per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Similarity score below which a local result is considered weak and
    /// ranked behind web snippets.
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f32,
    /// Maximum web snippets merged into a result.
    #[serde(default = "default_web_max_results")]
    pub web_max_results: usize,
    /// Deadline for the web-search sub-call.
    #[serde(default = "default_web_timeout_secs")]
    pub web_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Character budget for retrieved context in the prompt.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Prior conversation turns carried into the prompt.
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// Characters kept per condensed history turn.
    #[serde(default = "default_history_turn_chars")]
    pub history_turn_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Retries for transient embedding/index failures per call site.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Endpoints of the external runtimes the adapters talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,
    #[serde(default = "default_embedding_base_url")]
    pub embedding_base_url: String,
    /// Version tag recorded on every index entry written with the active
    /// embedding model.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    /// Web search provider: "tavily" or "duckduckgo".
    #[serde(default = "default_search_provider")]
    pub search_provider: String,
    #[serde(default)]
    pub search_api_key: String,
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_top_k() -> usize {
    5
}
fn default_relevance_floor() -> f32 {
    0.3
}
fn default_web_max_results() -> usize {
    3
}
fn default_web_timeout_secs() -> u64 {
    10
}
fn default_max_context_chars() -> usize {
    4000
}
fn default_max_history_turns() -> usize {
    6
}
fn default_history_turn_chars() -> usize {
    400
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> i32 {
    1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_model_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_embedding_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_embedding_dimension() -> usize {
    384
}
fn default_search_provider() -> String {
    "duckduckgo".to_string()
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_floor: default_relevance_floor(),
            web_max_results: default_web_max_results(),
            web_timeout_secs: default_web_timeout_secs(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_context_chars: default_max_context_chars(),
            max_history_turns: default_max_history_turns(),
            history_turn_chars: default_history_turn_chars(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_base_url: default_model_base_url(),
            embedding_base_url: default_embedding_base_url(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            search_provider: default_search_provider(),
            search_api_key: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::Validation(format!("cannot read config {:?}: {}", path, e)))?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| EngineError::Validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunking.max_chunk_size == 0 {
            return Err(EngineError::Validation(
                "chunking.max_chunk_size must be positive".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.max_chunk_size {
            return Err(EngineError::Validation(format!(
                "chunking.overlap {} must be smaller than max_chunk_size {}",
                self.chunking.overlap, self.chunking.max_chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(EngineError::Validation(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.generation.max_context_chars == 0 {
            return Err(EngineError::Validation(
                "generation.max_context_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.max_chunk_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig =
            toml::from_str("[chunking]\nmax_chunk_size = 200\noverlap = 20\n").unwrap();
        assert_eq!(config.chunking.max_chunk_size, 200);
        assert_eq!(config.chunking.overlap, 20);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.relevance_floor - 0.3).abs() < 1e-6);
    }

    #[test]
    fn overlap_not_below_chunk_size_is_rejected() {
        let mut config = EngineConfig::default();
        config.chunking.overlap = config.chunking.max_chunk_size;
        assert!(matches!(config.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn load_reads_and_validates_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[retrieval]\ntop_k = 7\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.retrieval.top_k, 7);

        std::fs::write(&path, "[retrieval]\ntop_k = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn paths_derive_from_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = EnginePaths::new(dir.path().join("engine"));
        assert!(paths.data_dir.exists());
        assert!(paths.log_dir.exists());
        assert_eq!(paths.store_db_path.file_name().unwrap(), "documents.db");
        assert_eq!(paths.index_db_path.file_name().unwrap(), "index.db");
    }
}
