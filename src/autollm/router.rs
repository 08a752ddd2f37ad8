//! C5 — Router. The four-phase adaptive routing algorithm (§4.5) plus
//! `Complete`, the post-routing prompt assembly and dispatch step.
//!
//! `#[tracing::instrument]` on the entry points and the phased-decision
//! control flow are grounded on `router.rs::route`'s own instrumentation
//! and its `dispatch`/`escalate` phase split, generalized from a two-tier
//! ladder to the four-phase algorithm this spec requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::availability::AvailabilityCache;
use super::error::RouterError;
use super::provider::{
    ChatMessage, ChatRequest, ChatResponse, KnowledgeFabric, OutcomeStore, Provider, PromptStore,
    PromptTier, SearchOptions,
};
use super::types::{
    BackendType, Constraint, Lane, LearnedRoutingConfig, ModelCapability, Request, RequestMode,
    RoutingDecision,
};

const PASSIVE_RETRIEVAL_DEADLINE: Duration = Duration::from_millis(50);
const PASSIVE_RETRIEVAL_PLACEHOLDER: &str = "{{PASSIVE_RETRIEVAL}}";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Static routing configuration: the ordered Fast/Smart lane lists and the
/// learned-confidence tunables. Effectively immutable after construction
/// (§5), matching the teacher's "config is effectively immutable" note for
/// `Router`.
pub struct RouterConfig {
    pub fast_lane: Vec<ModelCapability>,
    pub smart_lane: Vec<ModelCapability>,
    pub default_smart_model: Option<ModelCapability>,
    pub learned: LearnedRoutingConfig,
}

#[derive(Default)]
pub struct RouterCounters {
    pub fast_lane_count: AtomicU64,
    pub smart_lane_count: AtomicU64,
}

/// Per-request routing. Stateless aside from the append-only atomic
/// counters — safe for concurrent calls (§5).
pub struct Router {
    availability: Arc<AvailabilityCache>,
    config: RouterConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
    outcome_store: Option<Arc<dyn OutcomeStore>>,
    knowledge_fabric: Option<Arc<dyn KnowledgeFabric>>,
    prompt_store: Option<Arc<dyn PromptStore>>,
    counters: RouterCounters,
}

impl Router {
    pub fn new(
        availability: Arc<AvailabilityCache>,
        config: RouterConfig,
        providers: HashMap<String, Arc<dyn Provider>>,
    ) -> Self {
        Self {
            availability,
            config,
            providers,
            outcome_store: None,
            knowledge_fabric: None,
            prompt_store: None,
            counters: RouterCounters::default(),
        }
    }

    pub fn with_outcome_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.outcome_store = Some(store);
        self
    }

    pub fn with_knowledge_fabric(mut self, fabric: Arc<dyn KnowledgeFabric>) -> Self {
        self.knowledge_fabric = Some(fabric);
        self
    }

    pub fn with_prompt_store(mut self, store: Arc<dyn PromptStore>) -> Self {
        self.prompt_store = Some(store);
        self
    }

    pub fn counters(&self) -> &RouterCounters {
        &self.counters
    }

    fn is_local_provider(provider: &str) -> bool {
        matches!(provider, "mlx" | "ollama" | "dnet")
    }

    fn model_available(&self, cap: &ModelCapability) -> bool {
        self.availability.is_available(&cap.model, &cap.provider)
    }

    fn needs_vision(req: &Request) -> bool {
        !req.images.is_empty()
    }

    /// available, local-only gate, vision gate, context-window gate.
    fn satisfies_base_gates(&self, cap: &ModelCapability, req: &Request) -> bool {
        if !self.model_available(cap) {
            return false;
        }
        if req.local_only && !Self::is_local_provider(&cap.provider) {
            return false;
        }
        if Self::needs_vision(req) && !cap.capabilities.vision {
            return false;
        }
        if req.estimated_tokens > 0 && cap.context_window < req.estimated_tokens {
            return false;
        }
        true
    }

    fn best_available_local_fast(&self, req: &Request) -> Option<&ModelCapability> {
        self.config.fast_lane.iter().find(|cap| {
            self.model_available(cap)
                && Self::is_local_provider(&cap.provider)
                && (!Self::needs_vision(req) || cap.capabilities.vision)
        })
    }

    /// The router never guesses which backend holds a local model when the
    /// cache has data: MLX → Dnet → Ollama lookup order. Falls back to
    /// family-name heuristics only when the cache is empty or the model is
    /// unknown to every backend.
    fn resolve_provider(&self, cap: &ModelCapability) -> String {
        if cap.provider != "local" {
            return cap.provider.clone();
        }
        if let Some(backend) = self.availability.find_local_backend_for_model(&cap.model) {
            return backend.to_string();
        }
        let lower = cap.model.to_lowercase();
        if lower.starts_with("qwen") || lower.starts_with("llama") || lower.starts_with("mistral")
            || lower.contains(':')
        {
            let primary = self.availability.get_primary_local_backend();
            if primary != BackendType::None {
                return primary.to_string();
            }
        }
        BackendType::None.to_string()
    }

    fn chosen_from(&self, cap: &ModelCapability, lane: Lane, reason: impl Into<String>) -> RoutingDecision {
        match lane {
            Lane::Fast => self.counters.fast_lane_count.fetch_add(1, Ordering::Relaxed),
            Lane::Smart => self.counters.smart_lane_count.fetch_add(1, Ordering::Relaxed),
        };
        RoutingDecision::chosen(cap.model.clone(), lane, self.resolve_provider(cap), reason)
            .with_capability(cap.clone())
    }

    /// Iterate the Smart lane (then `defaultSmartModel`) applying the same
    /// gates as the Fast lane. `incoming_constraint`/`forced` are retained
    /// on success (they annotate *why* Smart was chosen); on total failure
    /// the constraint is overridden to `no_local_models`/`no_models` to
    /// uphold the `model == "" ⟺ constraint ∈ {no_*}` invariant.
    fn select_smart(
        &self,
        req: &Request,
        incoming_constraint: Constraint,
        forced: bool,
        reason: impl Into<String>,
    ) -> RoutingDecision {
        let reason = reason.into();
        let survivor = self
            .config
            .smart_lane
            .iter()
            .find(|cap| self.satisfies_base_gates(cap, req))
            .or_else(|| {
                self.config
                    .default_smart_model
                    .as_ref()
                    .filter(|cap| self.satisfies_base_gates(cap, req))
            });

        match survivor {
            Some(cap) => {
                let mut decision = self.chosen_from(cap, Lane::Smart, reason);
                if forced {
                    decision = decision.forced(incoming_constraint);
                } else if incoming_constraint != Constraint::None {
                    decision.constraint = incoming_constraint;
                }
                decision
            }
            None => {
                self.counters.smart_lane_count.fetch_add(1, Ordering::Relaxed);
                if req.local_only {
                    RoutingDecision::empty(Lane::Smart, Constraint::NoLocalModels, reason)
                } else {
                    RoutingDecision::empty(Lane::Smart, Constraint::NoModels, reason)
                }
            }
        }
    }

    /// `Route(ctx, req) → RoutingDecision` — the four phases execute
    /// strictly in order; the first phase that yields a decision wins.
    #[tracing::instrument(skip(self, req), fields(mode = ?req.mode, local_only = req.local_only))]
    pub async fn route(&self, req: &Request) -> RoutingDecision {
        // Phase 1.1 — vision.
        if Self::needs_vision(req) {
            let fast_has_vision = self.config.fast_lane.iter().any(|cap| {
                self.model_available(cap)
                    && cap.capabilities.vision
                    && (!req.local_only || Self::is_local_provider(&cap.provider))
            });
            if !fast_has_vision {
                return self.select_smart(
                    req,
                    Constraint::Vision,
                    true,
                    "no available Fast model supports vision",
                );
            }
        }

        // Phase 1.2 — context overflow.
        if req.estimated_tokens > 0 {
            let fast_handles = self.config.fast_lane.iter().any(|cap| self.satisfies_base_gates(cap, req));
            if !fast_handles {
                if req.local_only {
                    if let Some(cap) = self.best_available_local_fast(req) {
                        return self.chosen_from(
                            cap,
                            Lane::Fast,
                            format!(
                                "context window {} insufficient for estimated {} tokens, \
                                 but local_only forces Fast lane anyway",
                                cap.context_window, req.estimated_tokens
                            ),
                        );
                    }
                    self.counters.fast_lane_count.fetch_add(1, Ordering::Relaxed);
                    return RoutingDecision::empty(
                        Lane::Fast,
                        Constraint::NoLocalModels,
                        "no local Fast model available under context overflow",
                    );
                }
                return self.select_smart(
                    req,
                    Constraint::ContextOverflow,
                    true,
                    "no Fast model can handle the estimated token count",
                );
            }
        }

        // Phase 2 — user intent.
        if req.mode == RequestMode::Smart {
            return self.select_smart(req, Constraint::None, false, "user requested Smart lane");
        }

        // Phase 2.5 — learned confidence.
        if let Some(outcome) = self.outcome_store.as_ref() {
            if !req.task_type.is_empty() {
                if let Some(decision) = self.learned_confidence_phase(req, outcome.as_ref()).await {
                    return decision;
                }
            }
        }

        // Phase 3 — default Fast lane.
        self.default_fast_lane(req)
    }

    async fn learned_confidence_phase(
        &self,
        req: &Request,
        outcome: &dyn OutcomeStore,
    ) -> Option<RoutingDecision> {
        let learned = &self.config.learned;

        let (fast_rate, fast_count) = outcome
            .get_lane_success_rate(Lane::Fast, &req.task_type)
            .await
            .unwrap_or((0.0, 0));
        let (smart_rate, smart_count) = outcome
            .get_lane_success_rate(Lane::Smart, &req.task_type)
            .await
            .unwrap_or((0.0, 0));

        if fast_count >= learned.min_samples
            && smart_count >= learned.min_samples
            && smart_rate - fast_rate > learned.max_adjustment / 2.0
            && !req.local_only
        {
            return Some(self.select_smart(
                req,
                Constraint::None,
                true,
                format!(
                    "lane escalation: fast success {fast_rate:.2} (n={fast_count}), \
                     smart success {smart_rate:.2} (n={smart_count})"
                ),
            ));
        }

        let prefer_threshold = 0.5 + learned.max_adjustment / 2.0;
        let avoid_threshold = 0.5 - learned.max_adjustment / 2.0;

        for cap in &self.config.fast_lane {
            if !self.satisfies_base_gates(cap, req) {
                continue;
            }
            let (rate, count) = outcome
                .get_model_success_rate(&cap.provider, &cap.model, &req.task_type)
                .await
                .unwrap_or((0.0, 0));
            let confidence = calculate_learned_confidence(0.5, rate, count, learned);

            if confidence > prefer_threshold {
                let mut decision = self.chosen_from(
                    cap,
                    Lane::Fast,
                    format!("learned confidence {confidence:.2} prefers this model (n={count})"),
                );
                decision = decision.with_confidence(confidence);
                return Some(decision);
            } else if confidence < avoid_threshold {
                continue;
            } else {
                break;
            }
        }

        None
    }

    fn default_fast_lane(&self, req: &Request) -> RoutingDecision {
        let survivor = self.config.fast_lane.iter().find(|cap| self.satisfies_base_gates(cap, req));
        match survivor {
            Some(cap) => self.chosen_from(cap, Lane::Fast, "default Fast lane selection"),
            None => {
                if req.local_only {
                    self.counters.fast_lane_count.fetch_add(1, Ordering::Relaxed);
                    RoutingDecision::empty(Lane::Fast, Constraint::NoLocalModels, "no Fast lane model available")
                } else {
                    self.select_smart(
                        req,
                        Constraint::NoFastModels,
                        false,
                        "Fast lane exhausted, falling through to Smart lane",
                    )
                }
            }
        }
    }

    /// Post-routing prompt assembly and dispatch (§4.5 "Completion").
    #[tracing::instrument(skip(self, req))]
    pub async fn complete(&self, req: &Request) -> Result<(RoutingDecision, ChatResponse), RouterError> {
        let decision = self.route(req).await;
        if decision.is_empty() {
            return Err(RouterError::OutOfConstraint(decision.constraint));
        }

        let system_prompt = self.build_system_prompt(req, &decision).await;
        let response = self.dispatch(req, &decision, &system_prompt).await?;
        Ok((decision, response))
    }

    async fn build_system_prompt(&self, req: &Request, decision: &RoutingDecision) -> String {
        let mut prompt = req
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        if !req.task_type.is_empty() {
            if let Some(store) = self.prompt_store.as_ref() {
                if store.has(&req.task_type) {
                    let tier = match decision
                        .model_capability
                        .as_ref()
                        .map(|c| c.tier)
                        .unwrap_or(super::types::ModelTier::Medium)
                    {
                        super::types::ModelTier::Small | super::types::ModelTier::Medium => PromptTier::Small,
                        _ => PromptTier::Large,
                    };
                    if let Some(tiered) = store.get_tier(&req.task_type, tier) {
                        prompt = tiered;
                    }
                }
            }
        }

        if decision.lane == Lane::Fast {
            if let Some(fabric) = self.knowledge_fabric.as_ref() {
                match tokio::time::timeout(
                    PASSIVE_RETRIEVAL_DEADLINE,
                    fabric.search(&req.prompt, SearchOptions { max_results: 3 }),
                )
                .await
                {
                    Ok(Ok(result)) if !result.items.is_empty() => {
                        let joined = result
                            .items
                            .iter()
                            .map(|i| format!("- {} ({})", i.content, i.title))
                            .collect::<Vec<_>>()
                            .join("\n");
                        prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, &joined);
                    }
                    Ok(Ok(_)) => {
                        prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, "");
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "passive retrieval failed, stripping placeholder");
                        prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, "");
                    }
                    Err(_) => {
                        debug!("passive retrieval exceeded 50ms deadline, stripping placeholder");
                        prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, "");
                    }
                }
            } else {
                prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, "");
            }
        } else {
            prompt = prompt.replace(PASSIVE_RETRIEVAL_PLACEHOLDER, "");
        }

        prompt
    }

    async fn dispatch(
        &self,
        req: &Request,
        decision: &RoutingDecision,
        system_prompt: &str,
    ) -> Result<ChatResponse, RouterError> {
        let provider = self
            .providers
            .get(&decision.provider)
            .ok_or_else(|| RouterError::Unavailable(decision.provider.clone()))?;

        let mut messages: Vec<ChatMessage> = req
            .messages
            .iter()
            .map(|m| ChatMessage { role: m.role.clone(), content: m.content.clone() })
            .collect();
        messages.push(ChatMessage { role: "user".to_string(), content: req.prompt.clone() });

        let chat_req = ChatRequest {
            model: decision.model.clone(),
            messages,
            system_prompt: Some(system_prompt.to_string()),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            stream: false,
        };

        match provider.chat(chat_req).await {
            Ok(response) => Ok(response),
            Err(e) if decision.lane == Lane::Fast && looks_like_model_not_found(&e) => {
                warn!(model = %decision.model, "model not found, retrying on Smart lane");
                let retry_decision = self.select_smart(
                    req,
                    Constraint::ModelNotFound,
                    true,
                    "retry after model_not_found on Fast lane",
                );
                if retry_decision.is_empty() {
                    return Err(RouterError::ModelNotFound(decision.model.clone()));
                }
                let retry_provider = self
                    .providers
                    .get(&retry_decision.provider)
                    .ok_or_else(|| RouterError::Unavailable(retry_decision.provider.clone()))?;
                let retry_req = ChatRequest {
                    model: retry_decision.model.clone(),
                    messages: vec![ChatMessage { role: "user".to_string(), content: req.prompt.clone() }],
                    system_prompt: Some(system_prompt.to_string()),
                    max_tokens: DEFAULT_MAX_TOKENS,
                    temperature: DEFAULT_TEMPERATURE,
                    stream: false,
                };
                retry_provider
                    .chat(retry_req)
                    .await
                    .map_err(|e| RouterError::ModelNotFound(format!("{} (retry also failed: {e})", decision.model)))
            }
            Err(e) => Err(RouterError::Unavailable(e.to_string())),
        }
    }
}

fn looks_like_model_not_found(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("404") && (msg.contains("model") || msg.contains("not found"))
}

/// `CalculateLearnedConfidence(baseConfidence, provider, model, taskType)`.
/// Pure function so it can be property-tested independent of the store.
pub fn calculate_learned_confidence(
    base_confidence: f64,
    success_rate: f64,
    sample_count: u32,
    config: &LearnedRoutingConfig,
) -> f64 {
    if sample_count < config.min_samples {
        return base_confidence.clamp(0.0, 1.0);
    }

    let adjustment = if success_rate > config.boost_threshold {
        ((success_rate - config.boost_threshold) / (1.0 - config.boost_threshold)) * config.max_adjustment
    } else if success_rate < config.penalty_threshold {
        -((config.penalty_threshold - success_rate) / config.penalty_threshold) * config.max_adjustment
    } else {
        0.0
    };

    (base_confidence + adjustment).clamp(0.0, 1.0)
}
