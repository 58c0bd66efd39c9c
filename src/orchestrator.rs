//! Generation orchestration.
//!
//! Assembles a grounded prompt from retrieved context, invokes the language
//! model, and returns (or streams) the answer together with citations for
//! exactly the context that went into the prompt. When retrieval produces
//! nothing, the model is explicitly told to answer from general knowledge
//! and the response is flagged as ungrounded so the caller can show a
//! disclaimer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::GenerationConfig;
use crate::errors::EngineError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::retriever::{RetrievalResult, RetrievedItem, Retriever};

/// Reference to a context item that was included in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Citation {
    Chunk {
        document_id: String,
        chunk_id: String,
        ordinal: i64,
    },
    Web {
        url: String,
        title: String,
    },
}

/// One completed question/answer exchange, retained by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Complete answer with its grounding metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// False when the model was asked to answer from general knowledge
    /// because no usable context was retrieved.
    pub grounded: bool,
}

/// Streaming answer fragment. The stream ends with exactly one terminal
/// event: `Done` on success, `Failed` on a mid-stream model failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Token { text: String },
    Done { citations: Vec<Citation>, grounded: bool },
    Failed { error: String },
}

struct PromptPlan {
    prompt: String,
    citations: Vec<Citation>,
    grounded: bool,
}

pub struct GenerationOrchestrator {
    retriever: Arc<Retriever>,
    llm: Arc<dyn LanguageModel>,
    config: GenerationConfig,
    retrieval_top_k: usize,
}

impl GenerationOrchestrator {
    pub fn new(
        retriever: Arc<Retriever>,
        llm: Arc<dyn LanguageModel>,
        config: GenerationConfig,
        retrieval_top_k: usize,
    ) -> Self {
        Self {
            retriever,
            llm,
            config,
            retrieval_top_k,
        }
    }

    /// Answer a query in one shot.
    pub async fn answer(
        &self,
        query: &str,
        owner: &str,
        history: &[ConversationTurn],
        web_search_enabled: bool,
    ) -> Result<Answer, EngineError> {
        let plan = self.plan(query, owner, history, web_search_enabled).await?;

        let request = CompletionRequest::new(plan.prompt).with_config(&self.config);
        let text = self.llm.complete(request).await?;

        Ok(Answer {
            text,
            citations: plan.citations,
            grounded: plan.grounded,
        })
    }

    /// Answer a query as a token stream.
    ///
    /// Token order follows generation order. Dropping the receiver cancels
    /// the model call.
    pub async fn answer_stream(
        &self,
        query: &str,
        owner: &str,
        history: &[ConversationTurn],
        web_search_enabled: bool,
    ) -> Result<mpsc::Receiver<AnswerEvent>, EngineError> {
        let plan = self.plan(query, owner, history, web_search_enabled).await?;

        let request = CompletionRequest::new(plan.prompt).with_config(&self.config);
        let mut model_stream = self.llm.stream(request).await?;

        let (tx, rx) = mpsc::channel(100);
        let citations = plan.citations;
        let grounded = plan.grounded;

        tokio::spawn(async move {
            while let Some(fragment) = model_stream.recv().await {
                match fragment {
                    Ok(text) => {
                        if tx.send(AnswerEvent::Token { text }).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(AnswerEvent::Failed {
                                error: err.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx.send(AnswerEvent::Done { citations, grounded }).await;
        });

        Ok(rx)
    }

    async fn plan(
        &self,
        query: &str,
        owner: &str,
        history: &[ConversationTurn],
        web_search_enabled: bool,
    ) -> Result<PromptPlan, EngineError> {
        let retrieved = self
            .retriever
            .retrieve(query, owner, self.retrieval_top_k, web_search_enabled)
            .await?;

        let (blocks, citations) = self.select_context(&retrieved);
        let grounded = !blocks.is_empty();
        let prompt = self.build_prompt(query, &blocks, history, grounded);

        Ok(PromptPlan {
            prompt,
            citations,
            grounded,
        })
    }

    /// Take retrieval items in rank order until the context budget is hit;
    /// everything dropped falls off the bottom of the ranking. The citation
    /// list mirrors the included blocks exactly.
    fn select_context(&self, retrieved: &RetrievalResult) -> (Vec<String>, Vec<Citation>) {
        let budget = self.config.max_context_chars;
        let mut used = 0usize;
        let mut blocks = Vec::new();
        let mut citations = Vec::new();

        for item in &retrieved.items {
            let (block, citation) = match item {
                RetrievedItem::Local(local) => (
                    format!(
                        "[{}] (document {}, section {}, relevance {:.2})\n{}",
                        blocks.len() + 1,
                        local.chunk.document_id,
                        local.chunk.ordinal,
                        local.score,
                        local.chunk.text.trim()
                    ),
                    Citation::Chunk {
                        document_id: local.chunk.document_id.clone(),
                        chunk_id: local.chunk.id.clone(),
                        ordinal: local.chunk.ordinal,
                    },
                ),
                RetrievedItem::Web(snippet) => (
                    format!(
                        "[{}] (web: {})\n{}: {}",
                        blocks.len() + 1,
                        snippet.url,
                        snippet.title,
                        snippet.excerpt.trim()
                    ),
                    Citation::Web {
                        url: snippet.url.clone(),
                        title: snippet.title.clone(),
                    },
                ),
            };

            let cost = block.chars().count() + 2;
            if used + cost > budget {
                break;
            }
            used += cost;
            blocks.push(block);
            citations.push(citation);
        }

        (blocks, citations)
    }

    fn build_prompt(
        &self,
        query: &str,
        blocks: &[String],
        history: &[ConversationTurn],
        grounded: bool,
    ) -> String {
        let mut prompt = String::new();

        if grounded {
            prompt.push_str(
                "You are a helpful assistant. Answer the user's question using the \
                 numbered context passages from the user's documents below.\n\n",
            );
            prompt.push_str("Context:\n");
            for block in blocks {
                prompt.push_str(block);
                prompt.push_str("\n\n");
            }
            prompt.push_str(
                "Instructions:\n\
                 - Ground the answer in the context passages and refer to them by number.\n\
                 - If the context does not contain enough information, say so clearly.\n\n",
            );
        } else {
            prompt.push_str(
                "You are a helpful assistant. No relevant documents were found for \
                 this question, so answer from general knowledge and state that the \
                 answer is not based on the user's documents.\n\n",
            );
        }

        let condensed = self.condense_history(history);
        if !condensed.is_empty() {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(&condensed);
            prompt.push('\n');
        }

        prompt.push_str("Question: ");
        prompt.push_str(query);
        prompt.push_str("\n\nAnswer:");
        prompt
    }

    fn condense_history(&self, history: &[ConversationTurn]) -> String {
        if history.is_empty() || self.config.max_history_turns == 0 {
            return String::new();
        }

        let keep = self.config.max_history_turns.min(history.len());
        let mut out = String::new();
        for turn in &history[history.len() - keep..] {
            out.push_str(&format!(
                "User: {}\nAssistant: {}\n",
                truncate_chars(&turn.query, self.config.history_turn_chars),
                truncate_chars(&turn.answer, self.config.history_turn_chars),
            ));
        }
        out
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{}…", kept.trim_end())
}
