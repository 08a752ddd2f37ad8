//! Core data model for the adaptive two-lane model router.
//!
//! These types are shared by every component in `autollm` (C1–C6). They
//! carry no I/O and no locking — all mutability lives in the components
//! that own a snapshot of them ([`crate::autollm::availability::AvailabilityCache`]
//! being the main example).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Routing tier: local/cheap/fast vs. frontier-quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Fast,
    Smart,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Smart => "smart",
        })
    }
}

/// Which local inference backend a model lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Mlx,
    Ollama,
    Dnet,
    None,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Mlx => "mlx",
            Self::Ollama => "ollama",
            Self::Dnet => "dnet",
            Self::None => "none",
        })
    }
}

/// Ordinal capability bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
    Xl,
    Frontier,
}

/// Resource bucket by on-disk/in-memory size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightClass {
    /// < 4 GB
    Light,
    /// 4–12 GB
    Medium,
    /// > 12 GB
    Heavy,
}

impl WeightClass {
    pub fn from_size_gb(size_gb: f64) -> Self {
        if size_gb < 4.0 {
            Self::Light
        } else if size_gb <= 12.0 {
            Self::Medium
        } else {
            Self::Heavy
        }
    }
}

/// Which structured capabilities a model supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub vision: bool,
    pub function_calling: bool,
    pub json_mode: bool,
    pub streaming: bool,
    pub system_prompt: bool,
}

/// Integer 0–100 score components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelScore {
    pub overall: u8,
    pub reasoning: u8,
    pub coding: u8,
    pub instruction: u8,
    pub speed: u8,
}

/// Per-model record describing what a model can do and how good it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapability {
    pub provider: String,
    pub model: String,
    pub tier: ModelTier,
    pub context_window: u32,
    pub capabilities: Capabilities,
    pub score: ModelScore,
}

/// Selection-time record produced by the [`crate::autollm::selector::ModelSelector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub name: String,
    pub provider: BackendType,
    pub tier: ModelTier,
    pub size_gb: f64,
    pub weight: WeightClass,
    pub speed_score: u32,
    pub qual_score: u32,
    pub combined_score: f64,
    pub available: bool,
    pub reason: String,
}

/// Liveness/inventory snapshot for one local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub endpoint: String,
    pub available: bool,
    pub response_ms: u64,
    pub models: Vec<String>,
    pub error: Option<String>,
}

impl BackendInfo {
    pub fn unavailable(backend_type: BackendType, endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            backend_type,
            endpoint: endpoint.into(),
            available: false,
            response_ms: 0,
            models: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Human-friendly one-line summary, as described in spec.md §3.
    pub fn summary(&self) -> String {
        if self.available {
            format!(
                "{} @ {} — {} model(s), {}ms",
                self.backend_type,
                self.endpoint,
                self.models.len(),
                self.response_ms
            )
        } else {
            format!(
                "{} @ {} — unavailable ({})",
                self.backend_type,
                self.endpoint,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }

    /// Exact or base-name match (strip `:tag`, strip `owner/` path prefix).
    pub fn has_model(&self, name: &str) -> bool {
        self.models.iter().any(|m| model_names_match(m, name))
    }
}

/// True if two model name strings refer to the same model under the
/// matching rules in spec.md §3/§4.3: exact match, base-name match
/// (`llama3` ~ `llama3:8b`), or last-path-component match
/// (`Llama-3.2-3B-4bit` ~ `mlx-community/Llama-3.2-3B-4bit`).
pub fn model_names_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    base_name(a) == base_name(b) || last_path_component(a) == last_path_component(b)
}

/// Strip a trailing `:tag` (Ollama-style).
pub fn base_name(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

/// Strip a leading `owner/` path prefix (MLX/HF-style), after stripping any tag.
pub fn last_path_component(name: &str) -> &str {
    base_name(name).rsplit('/').next().unwrap_or(name)
}

/// Per-provider cloud availability, derived from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudProviders {
    pub openai: bool,
    pub anthropic: bool,
    pub google: bool,
    pub mistral: bool,
    pub groq: bool,
    pub claude_max: bool,
}

/// Immutable snapshot of backend/model availability, as produced by
/// [`crate::autollm::availability::AvailabilityCache::refresh`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    pub mlx_online: bool,
    pub mlx_models: Vec<String>,
    pub ollama_online: bool,
    pub ollama_models: Vec<String>,
    pub dnet_online: bool,
    pub dnet_models: Vec<String>,
    pub primary_local_backend: BackendType,
    pub cloud_providers: CloudProviders,
    pub last_refresh: DateTime<Utc>,
}

impl AvailabilitySnapshot {
    pub fn empty() -> Self {
        Self {
            mlx_online: false,
            mlx_models: Vec::new(),
            ollama_online: false,
            ollama_models: Vec::new(),
            dnet_online: false,
            dnet_models: Vec::new(),
            primary_local_backend: BackendType::None,
            cloud_providers: CloudProviders::default(),
            last_refresh: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn models_for(&self, backend: BackendType) -> &[String] {
        match backend {
            BackendType::Mlx => &self.mlx_models,
            BackendType::Ollama => &self.ollama_models,
            BackendType::Dnet => &self.dnet_models,
            BackendType::None => &[],
        }
    }

    pub fn is_online(&self, backend: BackendType) -> bool {
        match backend {
            BackendType::Mlx => self.mlx_online,
            BackendType::Ollama => self.ollama_online,
            BackendType::Dnet => self.dnet_online,
            BackendType::None => false,
        }
    }
}

/// A chat-style message as carried through a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Input to the [`crate::autollm::router::Router`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub estimated_tokens: u32,
    #[serde(default)]
    pub mode: RequestMode,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub task_type: String,
}

/// User-supplied routing hint. `""` (the default) means "let the router decide".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    #[default]
    Auto,
    Fast,
    Smart,
}

/// Typed reason a routing decision was forced or left empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    None,
    Vision,
    ContextOverflow,
    NoLocalModels,
    NoFastModels,
    NoModels,
    ModelNotFound,
}

impl Default for Constraint {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "",
            Self::Vision => "vision",
            Self::ContextOverflow => "context_overflow",
            Self::NoLocalModels => "no_local_models",
            Self::NoFastModels => "no_fast_models",
            Self::NoModels => "no_models",
            Self::ModelNotFound => "model_not_found",
        })
    }
}

/// Output of [`crate::autollm::router::Router::route`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: String,
    pub lane: Lane,
    pub provider: String,
    pub reason: String,
    pub forced: bool,
    pub constraint: Constraint,
    pub learned_confidence: Option<f64>,
    pub model_capability: Option<ModelCapability>,
}

impl RoutingDecision {
    /// The only constructor for an empty decision — upholds the invariant
    /// `model == "" ⟺ constraint ∈ {no_local_models, no_fast_models, no_models}`.
    pub fn empty(lane: Lane, constraint: Constraint, reason: impl Into<String>) -> Self {
        debug_assert!(matches!(
            constraint,
            Constraint::NoLocalModels | Constraint::NoFastModels | Constraint::NoModels
        ));
        Self {
            model: String::new(),
            lane,
            provider: String::new(),
            reason: reason.into(),
            forced: false,
            constraint,
            learned_confidence: None,
            model_capability: None,
        }
    }

    pub fn chosen(
        model: impl Into<String>,
        lane: Lane,
        provider: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            lane,
            provider: provider.into(),
            reason: reason.into(),
            forced: false,
            constraint: Constraint::None,
            learned_confidence: None,
            model_capability: None,
        }
    }

    pub fn forced(mut self, constraint: Constraint) -> Self {
        self.forced = true;
        self.constraint = constraint;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.learned_confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_capability(mut self, capability: ModelCapability) -> Self {
        self.model_capability = Some(capability);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_empty()
    }
}

/// Learned-routing arithmetic: base confidence adjusted by historical
/// success rate, bounded to `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingConfidence {
    pub base_confidence: f64,
    pub learned_confidence: f64,
    pub sample_count: u32,
    pub adjusted_confidence: f64,
}

/// Tunables for Phase 2.5 learned confidence (spec.md §3, §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LearnedRoutingConfig {
    pub min_samples: u32,
    pub boost_threshold: f64,
    pub penalty_threshold: f64,
    pub max_adjustment: f64,
    pub decay_factor: f64,
}

impl Default for LearnedRoutingConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            boost_threshold: 0.85,
            penalty_threshold: 0.40,
            max_adjustment: 0.30,
            decay_factor: 0.95,
        }
    }
}

/// A single recorded outcome, fed to the [`crate::autollm::router::OutcomeStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub lane: Lane,
    pub task_type: String,
    pub success: bool,
    pub score: f64,
    pub latency_ms: u64,
    pub was_escalated: bool,
}

/// Aggregate counts kept per (provider, model, task_type) key by the
/// in-memory [`crate::autollm::outcome::InMemoryOutcomeStore`].
#[derive(Debug, Clone, Default)]
pub struct OutcomeAggregate {
    pub successes: u32,
    pub total: u32,
}

impl OutcomeAggregate {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

pub type AggregateKey = (String, String, String);

/// Helper for building an aggregate map key from parts, used by both the
/// in-memory outcome store and its tests.
pub fn aggregate_key(provider: &str, model: &str, task_type: &str) -> AggregateKey {
    (provider.to_string(), model.to_string(), task_type.to_string())
}

pub type ScoreMap = HashMap<AggregateKey, OutcomeAggregate>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_tag() {
        assert_eq!(base_name("llama3:8b"), "llama3");
        assert_eq!(base_name("llama3"), "llama3");
    }

    #[test]
    fn last_path_component_strips_owner_and_tag() {
        assert_eq!(
            last_path_component("mlx-community/Llama-3.2-3B-4bit"),
            "Llama-3.2-3B-4bit"
        );
        assert_eq!(last_path_component("llama3:8b"), "llama3");
    }

    #[test]
    fn model_names_match_exact() {
        assert!(model_names_match("llama3:8b", "llama3:8b"));
    }

    #[test]
    fn model_names_match_base_name_rule() {
        assert!(model_names_match("llama3", "llama3:8b"));
        assert!(model_names_match("llama3:8b", "llama3"));
    }

    #[test]
    fn model_names_match_last_path_component_rule() {
        assert!(model_names_match(
            "Llama-3.2-3B-4bit",
            "mlx-community/Llama-3.2-3B-4bit"
        ));
    }

    #[test]
    fn model_names_do_not_match_unrelated_names() {
        assert!(!model_names_match("llama3", "mistral"));
    }

    #[test]
    fn weight_class_from_size() {
        assert_eq!(WeightClass::from_size_gb(2.0), WeightClass::Light);
        assert_eq!(WeightClass::from_size_gb(4.0), WeightClass::Medium);
        assert_eq!(WeightClass::from_size_gb(12.0), WeightClass::Medium);
        assert_eq!(WeightClass::from_size_gb(12.1), WeightClass::Heavy);
    }

    #[test]
    fn routing_decision_empty_upholds_model_constraint_invariant() {
        let d = RoutingDecision::empty(Lane::Fast, Constraint::NoLocalModels, "no local models");
        assert!(d.is_empty());
        assert_eq!(d.constraint, Constraint::NoLocalModels);
    }

    #[test]
    fn with_confidence_clamps_to_unit_interval() {
        let d = RoutingDecision::chosen("m", Lane::Fast, "ollama", "r").with_confidence(1.5);
        assert_eq!(d.learned_confidence, Some(1.0));
        let d = RoutingDecision::chosen("m", Lane::Fast, "ollama", "r").with_confidence(-0.5);
        assert_eq!(d.learned_confidence, Some(0.0));
    }
}
