//! Capability traits consumed by the Router (§6): `Provider`, `OutcomeStore`,
//! `KnowledgeFabric`, `PromptStore`. Specified as capability sets, not
//! concrete types (§9) — implemented here as `async_trait` trait objects,
//! the dispatch mechanism grounded on the same need in
//! `examples/ul0gic-emergence`, `examples/mofa-org-mofa`, and
//! `examples/cp5337-sx9`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::types::{Lane, RoutingOutcomeRecord};
use crate::backends::BackendClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: String,
    pub duration_ms: u64,
}

/// A single capability: `Chat(req) → resp`. Any provider — cloud, local
/// OpenAI-compatible, or Ollama-native — satisfies this.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Human-readable provider name, used in `RoutingDecision.provider` and
    /// log output.
    fn name(&self) -> &str;
}

/// Adapts the gateway's existing `backends::BackendClient` enum to the
/// `Provider` capability, converting to/from its JSON-based
/// `chat_completions` wire call.
pub struct BackendClientProvider {
    name: String,
    client: BackendClient,
}

impl BackendClientProvider {
    pub fn new(name: impl Into<String>, client: BackendClient) -> Self {
        Self { name: name.into(), client }
    }
}

#[async_trait]
impl Provider for BackendClientProvider {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system_prompt) = &req.system_prompt {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        for m in &req.messages {
            messages.push(json!({"role": m.role, "content": m.content}));
        }

        let body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": false,
        });

        let started = std::time::Instant::now();
        let response = self.client.chat_completions(body).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let content = response
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = response
            .pointer("/choices/0/finish_reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = response
            .pointer("/usage/prompt_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        let completion_tokens = response
            .pointer("/usage/completion_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(ChatResponse {
            content,
            prompt_tokens,
            completion_tokens,
            finish_reason,
            duration_ms,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// `GetModelSuccessRate`/`GetLaneSuccessRate`/`RecordOutcome` (§6). Queries
/// return `Err` only for genuine store failures — the caller downgrades
/// that to "no learning data" per §7, never propagating it as a hard
/// failure.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn get_model_success_rate(
        &self,
        provider: &str,
        model: &str,
        task_type: &str,
    ) -> anyhow::Result<(f64, u32)>;

    async fn get_lane_success_rate(&self, lane: Lane, task_type: &str) -> anyhow::Result<(f64, u32)>;

    async fn record_outcome(&self, record: RoutingOutcomeRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetrievalItem {
    pub content: String,
    pub trust_score: f64,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub items: Vec<RetrievalItem>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: usize,
}

/// `Search(query, opts) → RetrievalResult`. The router wraps this call with
/// a 50ms deadline (§4.5 step 3) — the trait itself carries no deadline.
#[async_trait]
pub trait KnowledgeFabric: Send + Sync {
    async fn search(&self, query: &str, opts: SearchOptions) -> anyhow::Result<RetrievalResult>;
}

/// `Has(taskType) → bool`, `GetTier(taskType, tier) → String`.
pub trait PromptStore: Send + Sync {
    fn has(&self, task_type: &str) -> bool;
    fn get_tier(&self, task_type: &str, tier: PromptTier) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTier {
    Small,
    Large,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        name: String,
        response: String,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.response.clone(),
                ..Default::default()
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn fake_provider_round_trips_through_the_trait_object() {
        let provider: Box<dyn Provider> = Box::new(FakeProvider {
            name: "fake".to_string(),
            response: "hello".to_string(),
        });
        let resp = provider
            .chat(ChatRequest {
                model: "m".to_string(),
                messages: vec![],
                system_prompt: None,
                max_tokens: 100,
                temperature: 0.7,
                stream: false,
            })
            .await
            .unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(provider.name(), "fake");
    }
}
