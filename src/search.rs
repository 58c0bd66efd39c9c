//! Web search providers.
//!
//! Retrieval enhancement only: the retriever treats every failure here as a
//! soft miss and falls back to local results. Tavily is the keyed provider;
//! DuckDuckGo's instant-answer API is the no-key fallback.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RuntimeConfig;
use crate::errors::EngineError;

/// A web search hit merged into retrieval results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSnippet {
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSnippet>, EngineError>;
}

/// Build the configured provider, if any is usable.
pub fn provider_from_config(runtime: &RuntimeConfig) -> Option<Arc<dyn WebSearchProvider>> {
    match runtime.search_provider.as_str() {
        "tavily" if !runtime.search_api_key.is_empty() => Some(Arc::new(TavilySearch::new(
            runtime.search_api_key.clone(),
        ))),
        "duckduckgo" => Some(Arc::new(DuckDuckGoSearch::new())),
        other => {
            tracing::warn!("unknown search provider {:?}, web search disabled", other);
            None
        }
    }
}

pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
}

impl TavilySearch {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl WebSearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSnippet>, EngineError> {
        let body = json!({
            "api_key": self.api_key,
            "query": query,
            "search_depth": "basic",
            "max_results": max_results,
        });

        let response = self
            .client
            .post("https://api.tavily.com/search")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transient("web search", e))?;

        if !response.status().is_success() {
            return Err(EngineError::transient(
                "web search",
                format!("Tavily returned {}", response.status()),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::transient("web search", e))?;

        let mut results = parse_tavily(&payload);
        results.truncate(max_results);
        Ok(results)
    }
}

fn parse_tavily(payload: &Value) -> Vec<WebSnippet> {
    let mut results = Vec::new();
    if let Some(items) = payload.get("results").and_then(|v| v.as_array()) {
        for item in items {
            let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("");
            let url = item.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let excerpt = item.get("content").and_then(|v| v.as_str()).unwrap_or("");
            if !title.is_empty() && !url.is_empty() {
                results.push(WebSnippet {
                    title: title.to_string(),
                    url: url.to_string(),
                    excerpt: excerpt.to_string(),
                });
            }
        }
    }
    results
}

#[derive(Default)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
}

impl DuckDuckGoSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebSearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSnippet>, EngineError> {
        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_redirect=1&no_html=1",
            urlencoding::encode(query)
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::transient("web search", e))?;

        if !response.status().is_success() {
            return Err(EngineError::transient(
                "web search",
                format!("DuckDuckGo returned {}", response.status()),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::transient("web search", e))?;

        let mut results = Vec::new();

        if let Some(abstract_text) = payload.get("AbstractText").and_then(|v| v.as_str()) {
            if let Some(url) = payload.get("AbstractURL").and_then(|v| v.as_str()) {
                if !abstract_text.is_empty() && !url.is_empty() {
                    results.push(WebSnippet {
                        title: abstract_text
                            .split(" - ")
                            .next()
                            .unwrap_or(abstract_text)
                            .to_string(),
                        url: url.to_string(),
                        excerpt: abstract_text.to_string(),
                    });
                }
            }
        }

        if let Some(items) = payload.get("Results").and_then(|v| v.as_array()) {
            extract_topics(items, &mut results);
        }
        if let Some(items) = payload.get("RelatedTopics").and_then(|v| v.as_array()) {
            extract_topics(items, &mut results);
        }

        results.truncate(max_results);
        Ok(results)
    }
}

fn extract_topics(items: &[Value], results: &mut Vec<WebSnippet>) {
    for item in items {
        if let Some(topics) = item.get("Topics").and_then(|v| v.as_array()) {
            extract_topics(topics, results);
            continue;
        }
        let text = item.get("Text").and_then(|v| v.as_str()).unwrap_or("");
        let url = item.get("FirstURL").and_then(|v| v.as_str()).unwrap_or("");
        if text.is_empty() || url.is_empty() {
            continue;
        }
        results.push(WebSnippet {
            title: text.split(" - ").next().unwrap_or(text).to_string(),
            url: url.to_string(),
            excerpt: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tavily_payload_parses_to_snippets() {
        let payload = json!({
            "results": [
                {"title": "Rust", "url": "https://rust-lang.org", "content": "A language."},
                {"title": "", "url": "https://skipped.example", "content": "no title"},
            ]
        });

        let results = parse_tavily(&payload);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Rust");
        assert_eq!(results[0].excerpt, "A language.");
    }

    #[test]
    fn nested_topics_are_flattened() {
        let items = vec![json!({
            "Topics": [
                {"Text": "Inner - detail", "FirstURL": "https://a.example"},
                {"Text": "Second", "FirstURL": "https://b.example"},
            ]
        })];

        let mut results = Vec::new();
        extract_topics(&items, &mut results);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Inner");
        assert_eq!(results[0].url, "https://a.example");
    }

    #[test]
    fn provider_selection_honors_config() {
        let mut runtime = RuntimeConfig::default();
        assert_eq!(
            provider_from_config(&runtime).map(|p| p.name().to_string()),
            Some("duckduckgo".to_string())
        );

        runtime.search_provider = "tavily".to_string();
        assert!(provider_from_config(&runtime).is_none());

        runtime.search_api_key = "key".to_string();
        assert_eq!(
            provider_from_config(&runtime).map(|p| p.name().to_string()),
            Some("tavily".to_string())
        );
    }
}
