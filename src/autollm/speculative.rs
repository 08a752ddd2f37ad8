//! C6 — SpeculativeExecutor.
//!
//! Runs a fast and a primary model in parallel, accepting the fast
//! response when it looks high-confidence and falling back to the primary
//! otherwise. Grounded on `router.rs`'s `tokio::join!`/background-task
//! split for dispatching to two backends concurrently, generalized to
//! detached-task plus channel handoff since the fast path must return
//! before the primary settles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::provider::{ChatRequest, ChatResponse, Provider};

const DEFAULT_FAST_TIMEOUT: Duration = Duration::from_secs(2);
const FAST_TEMPERATURE: f32 = 0.3;
const MIN_ACCEPT_LEN: usize = 20;
const MAX_ACCEPT_LEN: usize = 5000;
const JACCARD_THRESHOLD: f64 = 0.30;

const HEDGING_PHRASES: [&str; 10] = [
    "i'm not sure",
    "maybe",
    "perhaps",
    "i don't know",
    "it depends",
    "might be",
    "could be",
    "i think",
    "i believe",
    "not certain",
];

const ERROR_PREFIXES: [&str; 6] = ["error", "failed", "unable to", "cannot process", "invalid", "sorry"];

#[derive(Debug, Default)]
struct Metrics {
    fast_accepted: u64,
    fast_rejected: u64,
    primary_used: u64,
    fast_latency_total_ms: u64,
    fast_latency_count: u64,
    primary_latency_total_ms: u64,
    primary_latency_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpeculativeSnapshot {
    pub fast_accepted: u64,
    pub fast_rejected: u64,
    pub primary_used: u64,
    pub avg_fast_latency_ms: f64,
    pub avg_primary_latency_ms: f64,
}

pub struct SpeculativeExecutor {
    fast_provider: Arc<dyn Provider>,
    fast_model: String,
    primary_provider: Arc<dyn Provider>,
    primary_model: String,
    fast_timeout: Duration,
    metrics: Mutex<Metrics>,
}

impl SpeculativeExecutor {
    pub fn new(
        fast_provider: Arc<dyn Provider>,
        fast_model: impl Into<String>,
        primary_provider: Arc<dyn Provider>,
        primary_model: impl Into<String>,
    ) -> Self {
        Self::with_fast_timeout(fast_provider, fast_model, primary_provider, primary_model, DEFAULT_FAST_TIMEOUT)
    }

    pub fn with_fast_timeout(
        fast_provider: Arc<dyn Provider>,
        fast_model: impl Into<String>,
        primary_provider: Arc<dyn Provider>,
        primary_model: impl Into<String>,
        fast_timeout: Duration,
    ) -> Self {
        Self {
            fast_provider,
            fast_model: fast_model.into(),
            primary_provider,
            primary_model: primary_model.into(),
            fast_timeout,
            metrics: Mutex::new(Metrics::default()),
        }
    }

    pub fn snapshot(&self) -> SpeculativeSnapshot {
        let m = self.metrics.lock().expect("speculative metrics lock poisoned");
        SpeculativeSnapshot {
            fast_accepted: m.fast_accepted,
            fast_rejected: m.fast_rejected,
            primary_used: m.primary_used,
            avg_fast_latency_ms: avg(m.fast_latency_total_ms, m.fast_latency_count),
            avg_primary_latency_ms: avg(m.primary_latency_total_ms, m.primary_latency_count),
        }
    }

    /// `Execute(ctx, req)`. `base_request` supplies messages/system prompt;
    /// model and temperature are overridden per call.
    #[tracing::instrument(skip(self, base_request))]
    pub async fn execute(&self, base_request: &ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut fast_req = base_request.clone();
        fast_req.model = self.fast_model.clone();
        fast_req.temperature = FAST_TEMPERATURE;

        let mut primary_req = base_request.clone();
        primary_req.model = self.primary_model.clone();

        let fast_provider = self.fast_provider.clone();
        let primary_provider = self.primary_provider.clone();

        let fast_started = Instant::now();
        let fast_call = tokio::time::timeout(self.fast_timeout, fast_provider.chat(fast_req));

        let primary_started = Instant::now();
        let primary_handle =
            tokio::spawn(async move { (primary_started, primary_provider.chat(primary_req).await) });

        match fast_call.await {
            Ok(Ok(fast_response)) if is_high_confidence(&fast_response.content) => {
                self.record_fast_latency(fast_started.elapsed());
                self.record_accept();
                self.spawn_divergence_check(fast_response.content.clone(), primary_handle);
                Ok(fast_response)
            }
            Ok(Ok(fast_response)) => {
                self.record_fast_latency(fast_started.elapsed());
                self.record_reject();
                self.await_primary_or_fallback(primary_handle, Some(fast_response)).await
            }
            Ok(Err(e)) => {
                warn!(error = %e, "fast provider call failed, awaiting primary");
                self.record_reject();
                self.await_primary_or_fallback(primary_handle, None).await
            }
            Err(_) => {
                warn!("fast provider timed out after {:?}", self.fast_timeout);
                self.record_reject();
                self.await_primary_or_fallback(primary_handle, None).await
            }
        }
    }

    async fn await_primary_or_fallback(
        &self,
        primary_handle: tokio::task::JoinHandle<(Instant, anyhow::Result<ChatResponse>)>,
        fast_fallback: Option<ChatResponse>,
    ) -> anyhow::Result<ChatResponse> {
        match primary_handle.await {
            Ok((primary_started, Ok(primary_response))) => {
                self.record_primary_latency(primary_started.elapsed());
                self.record_primary_used();
                Ok(primary_response)
            }
            Ok((_, Err(e))) => {
                if let Some(fallback) = fast_fallback {
                    warn!(error = %e, "primary provider failed, falling back to fast response");
                    Ok(fallback)
                } else {
                    Err(e)
                }
            }
            Err(join_err) => {
                if let Some(fallback) = fast_fallback {
                    warn!(error = %join_err, "primary task panicked, falling back to fast response");
                    Ok(fallback)
                } else {
                    Err(anyhow::anyhow!("primary task panicked: {join_err}"))
                }
            }
        }
    }

    fn spawn_divergence_check(
        &self,
        fast_content: String,
        primary_handle: tokio::task::JoinHandle<(Instant, anyhow::Result<ChatResponse>)>,
    ) {
        tokio::spawn(async move {
            if let Ok((_, Ok(primary_response))) = primary_handle.await {
                if !responses_match(&fast_content, &primary_response.content) {
                    warn!(
                        fast = %truncate(&fast_content, 80),
                        primary = %truncate(&primary_response.content, 80),
                        "speculative fast/primary responses diverge"
                    );
                }
            }
        });
    }

    fn record_accept(&self) {
        self.metrics.lock().expect("speculative metrics lock poisoned").fast_accepted += 1;
    }

    fn record_reject(&self) {
        self.metrics.lock().expect("speculative metrics lock poisoned").fast_rejected += 1;
    }

    fn record_primary_used(&self) {
        self.metrics.lock().expect("speculative metrics lock poisoned").primary_used += 1;
    }

    fn record_fast_latency(&self, elapsed: Duration) {
        let mut m = self.metrics.lock().expect("speculative metrics lock poisoned");
        m.fast_latency_total_ms += elapsed.as_millis() as u64;
        m.fast_latency_count += 1;
    }

    fn record_primary_latency(&self, elapsed: Duration) {
        let mut m = self.metrics.lock().expect("speculative metrics lock poisoned");
        m.primary_latency_total_ms += elapsed.as_millis() as u64;
        m.primary_latency_count += 1;
    }
}

fn avg(total_ms: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_ms as f64 / count as f64
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max])
    }
}

fn is_high_confidence(content: &str) -> bool {
    let len = content.len();
    if len < MIN_ACCEPT_LEN || len > MAX_ACCEPT_LEN {
        return false;
    }
    let lower = content.to_lowercase();
    if HEDGING_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    let trimmed = lower.trim_start();
    if ERROR_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return false;
    }
    true
}

/// Lightweight Jaccard similarity over words longer than 3 characters.
fn responses_match(a: &str, b: &str) -> bool {
    let words_a = significant_words(a);
    let words_b = significant_words(b);
    if words_a.is_empty() && words_b.is_empty() {
        return true;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return true;
    }
    (intersection as f64 / union as f64) >= JACCARD_THRESHOLD
}

fn significant_words(s: &str) -> std::collections::HashSet<String> {
    s.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 3)
        .collect()
}
