//! HTTP adapter for a llama.cpp-style completion server.

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use async_trait::async_trait;

use super::provider::LanguageModel;
use super::types::CompletionRequest;
use crate::errors::EngineError;

pub struct LlamaServerClient {
    client: Client,
    base_url: String,
}

impl LlamaServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn request_body(request: &CompletionRequest, stream: bool) -> Value {
        json!({
            "prompt": request.prompt,
            "stream": stream,
            "n_predict": request.max_tokens,
            "temperature": request.temperature,
            "stop": request.stop,
        })
    }
}

#[async_trait]
impl LanguageModel for LlamaServerClient {
    fn name(&self) -> &str {
        "llama_server"
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(res) => Ok(res.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, EngineError> {
        let url = format!("{}/completion", self.base_url);
        let body = Self::request_body(&request, false);

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transient("language model", e))?;

        if !res.status().is_success() {
            return Err(EngineError::transient(
                "language model",
                format!("server returned {}", res.status()),
            ));
        }

        let data: Value = res
            .json()
            .await
            .map_err(|e| EngineError::transient("language model", e))?;
        Ok(data["content"].as_str().unwrap_or("").to_string())
    }

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let url = format!("{}/completion", self.base_url);
        let body = Self::request_body(&request, true);

        let (tx, rx) = mpsc::channel(100);
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut res = match client.post(&url).json(&body).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    let _ = tx
                        .send(Err(EngineError::transient(
                            "language model",
                            format!("server returned {}", r.status()),
                        )))
                        .await;
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(EngineError::transient("language model", e))).await;
                    return;
                }
            };

            while let Some(chunk) = res.chunk().await.ok().flatten() {
                let text = String::from_utf8_lossy(&chunk);
                for line in text.lines() {
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if let Ok(val) = serde_json::from_str::<Value>(payload) {
                        if let Some(content) = val["content"].as_str() {
                            if tx.send(Ok(content.to_string())).await.is_err() {
                                // Receiver dropped: cancel the model call.
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
