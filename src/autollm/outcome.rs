//! In-memory `OutcomeStore` implementation. spec.md §6 specifies only the
//! interface; this supplements it with a concrete store so the router is
//! runnable without an external dependency, following the ring-buffer
//! aggregation idiom of `traffic.rs::TrafficLog`.

use std::collections::VecDeque;
use std::sync::RwLock;

use async_trait::async_trait;

use super::provider::OutcomeStore;
use super::types::{aggregate_key, Lane, OutcomeAggregate, RoutingOutcomeRecord, ScoreMap};

const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

struct Inner {
    history: VecDeque<RoutingOutcomeRecord>,
    by_model: ScoreMap,
    by_lane: std::collections::HashMap<(Lane, String), OutcomeAggregate>,
}

/// Aggregates outcomes in memory, keyed by `(provider, model, taskType)` and
/// by `(lane, taskType)`. Not persisted — restarting the process discards
/// learning history, matching spec.md's "all routing state is in memory"
/// (§6, "Persisted state").
pub struct InMemoryOutcomeStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(capacity.min(1024)),
                by_model: ScoreMap::default(),
                by_lane: std::collections::HashMap::new(),
            }),
        }
    }

    pub fn record_count(&self) -> usize {
        self.inner.read().expect("outcome store lock poisoned").history.len()
    }
}

impl Default for InMemoryOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn get_model_success_rate(
        &self,
        provider: &str,
        model: &str,
        task_type: &str,
    ) -> anyhow::Result<(f64, u32)> {
        let inner = self.inner.read().expect("outcome store lock poisoned");
        let key = aggregate_key(provider, model, task_type);
        let agg = inner.by_model.get(&key).cloned().unwrap_or_default();
        Ok((agg.success_rate(), agg.total))
    }

    async fn get_lane_success_rate(&self, lane: Lane, task_type: &str) -> anyhow::Result<(f64, u32)> {
        let inner = self.inner.read().expect("outcome store lock poisoned");
        let agg = inner
            .by_lane
            .get(&(lane, task_type.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok((agg.success_rate(), agg.total))
    }

    async fn record_outcome(&self, record: RoutingOutcomeRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("outcome store lock poisoned");

        let model_key = aggregate_key(&record.provider, &record.model, &record.task_type);
        let model_agg = inner.by_model.entry(model_key).or_default();
        model_agg.total += 1;
        if record.success {
            model_agg.successes += 1;
        }

        let lane_key = (record.lane, record.task_type.clone());
        let lane_agg = inner.by_lane.entry(lane_key).or_default();
        lane_agg.total += 1;
        if record.success {
            lane_agg.successes += 1;
        }

        if inner.history.len() >= self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(provider: &str, model: &str, task_type: &str, lane: Lane, success: bool) -> RoutingOutcomeRecord {
        RoutingOutcomeRecord {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            lane,
            task_type: task_type.to_string(),
            success,
            score: if success { 1.0 } else { 0.0 },
            latency_ms: 100,
            was_escalated: false,
        }
    }

    #[tokio::test]
    async fn records_and_aggregates_per_model() {
        let store = InMemoryOutcomeStore::new();
        store
            .record_outcome(record("ollama", "qwen2.5:7b", "coding", Lane::Fast, true))
            .await
            .unwrap();
        store
            .record_outcome(record("ollama", "qwen2.5:7b", "coding", Lane::Fast, false))
            .await
            .unwrap();

        let (rate, count) = store
            .get_model_success_rate("ollama", "qwen2.5:7b", "coding")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_key_returns_zero_rate_and_count() {
        let store = InMemoryOutcomeStore::new();
        let (rate, count) = store.get_model_success_rate("x", "y", "z").await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(rate, 0.0);
    }

    #[tokio::test]
    async fn lane_aggregation_is_independent_of_model_aggregation() {
        let store = InMemoryOutcomeStore::new();
        store
            .record_outcome(record("ollama", "llama3:8b", "coding", Lane::Fast, true))
            .await
            .unwrap();
        store
            .record_outcome(record("anthropic", "claude-3-5-sonnet-20241022", "coding", Lane::Smart, true))
            .await
            .unwrap();

        let (fast_rate, fast_count) = store.get_lane_success_rate(Lane::Fast, "coding").await.unwrap();
        let (smart_rate, smart_count) = store.get_lane_success_rate(Lane::Smart, "coding").await.unwrap();
        assert_eq!(fast_count, 1);
        assert_eq!(smart_count, 1);
        assert_eq!(fast_rate, 1.0);
        assert_eq!(smart_rate, 1.0);
    }

    #[tokio::test]
    async fn history_respects_capacity() {
        let store = InMemoryOutcomeStore::with_capacity(2);
        for i in 0..5 {
            store
                .record_outcome(record("ollama", "m", "t", Lane::Fast, i % 2 == 0))
                .await
                .unwrap();
        }
        assert_eq!(store.record_count(), 2);
    }
}
