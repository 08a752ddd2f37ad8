//! Client-facing API (port 8080) — the endpoint ZeroClaw agents talk to.
//!
//! This is intentionally a thin layer: all routing logic lives in [`crate::router`].
//! Handlers translate HTTP concerns (status codes, JSON bodies) into calls
//! to the router and back.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::autollm::types::{Message as AutollmMessage, Request as AutollmRequest, RequestMode};
use crate::router::RouterState;
use crate::traffic::TrafficEntry;

/// Build the client-facing axum router (port 8080)
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/status", get(crate::api::status::status))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// POST /v1/chat/completions — routed through the adaptive two-lane router
/// when `[autollm]` is configured, otherwise through the legacy tier ladder.
pub async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if let Some(router) = state.autollm_router.as_ref() {
        let started = Instant::now();
        return match router.complete(&autollm_request_from_body(&body)).await {
            Ok((decision, resp)) => {
                let mut entry = TrafficEntry::new(
                    decision.lane.to_string(),
                    decision.provider.clone(),
                    started.elapsed().as_millis() as u64,
                    true,
                )
                .with_requested_model(&decision.model)
                .with_lane(&decision.lane.to_string());
                if !matches!(decision.constraint, crate::autollm::types::Constraint::None) {
                    entry = entry.with_constraint(&decision.constraint.to_string());
                }
                if decision.forced {
                    entry = entry.mark_forced();
                }
                state.traffic.push(entry);
                (StatusCode::OK, Json(openai_response_from(&decision, &resp))).into_response()
            }
            Err(e) => {
                let entry = TrafficEntry::new(
                    String::new(),
                    String::new(),
                    started.elapsed().as_millis() as u64,
                    false,
                )
                .with_error(&e.to_string());
                state.traffic.push(entry);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        };
    }

    match crate::router::route(&state, body, None, None, false).await {
        Ok((resp, _entry)) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Translate an OpenAI-shaped chat-completions body into an `autollm` [`AutollmRequest`].
///
/// The trailing user turn becomes `prompt`; everything before it is carried
/// as `messages` context, mirroring `Router::dispatch`'s own reassembly.
fn autollm_request_from_body(body: &Value) -> AutollmRequest {
    let mut messages: Vec<AutollmMessage> = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let role = m.get("role")?.as_str()?.to_string();
                    let content = m.get("content")?.as_str()?.to_string();
                    Some(AutollmMessage { role, content })
                })
                .collect()
        })
        .unwrap_or_default();

    let prompt = match messages.last() {
        Some(m) if m.role == "user" => messages.pop().unwrap().content,
        _ => String::new(),
    };

    let mode = match body.get("model").and_then(Value::as_str) {
        Some("smart") => RequestMode::Smart,
        Some("fast") => RequestMode::Fast,
        _ => RequestMode::Auto,
    };

    AutollmRequest {
        prompt,
        system_prompt: None,
        images: Vec::new(),
        messages,
        estimated_tokens: 0,
        mode,
        local_only: false,
        task_type: body
            .get("task_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn openai_response_from(
    decision: &crate::autollm::types::RoutingDecision,
    resp: &crate::autollm::provider::ChatResponse,
) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "object": "chat.completion",
        "model": decision.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": resp.content },
            "finish_reason": resp.finish_reason,
        }],
        "usage": {
            "prompt_tokens": resp.prompt_tokens,
            "completion_tokens": resp.completion_tokens,
            "total_tokens": resp.prompt_tokens + resp.completion_tokens,
        },
        "claw_router": {
            "lane": decision.lane.to_string(),
            "provider": decision.provider,
            "reason": decision.reason,
        }
    })
}

/// GET /v1/models — returns configured tiers (and, when `[autollm]` is
/// active, fast/smart lane candidates) as model objects
pub async fn list_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let config = state.config();

    let models: Vec<Value> = config
        .tiers
        .iter()
        .map(|t| {
            json!({
                "id": t.name,
                "object": "model",
                "owned_by": t.backend,
            })
        })
        .collect();

    // Also include alias names pointing to their real tier
    let mut alias_models: Vec<Value> = config
        .aliases
        .iter()
        .map(|(alias, target)| {
            json!({
                "id": alias,
                "object": "model",
                "owned_by": "alias",
                "claw_router": { "resolves_to": target }
            })
        })
        .collect();

    let mut all = models;
    all.append(&mut alias_models);

    if let Some(autollm_cfg) = config.autollm.as_ref() {
        for cap in autollm_cfg.fast_lane.iter().chain(autollm_cfg.smart_lane.iter()) {
            all.push(json!({
                "id": cap.model,
                "object": "model",
                "owned_by": cap.provider,
            }));
        }
    }

    Json(json!({ "object": "list", "data": all }))
}
