use crate::config::GenerationConfig;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: i32,
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 1024,
            stop: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: &GenerationConfig) -> Self {
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self
    }
}
