//! C4 — ModelSelector.
//!
//! One-shot startup selection: scores and classifies discovered models,
//! picks a primary local model plus an ordered cloud fallback chain. Pure
//! logic, no network or process I/O — callers feed it the discovered model
//! names per backend.

use super::types::{BackendType, ModelCandidate, ModelTier, WeightClass};

const MIN_QUALITY_FOR_AGENTIC: u32 = 50;
const FALLBACK_MAX_MODEL_GB: f64 = 5.0;

/// Fixed-priority cloud fallback chain: Grok → Anthropic → OpenAI.
pub const CLOUD_FALLBACK_CHAIN: [(&str, &str); 3] = [
    ("groq", "llama-3.3-70b-versatile"),
    ("anthropic", "claude-3-5-sonnet-20241022"),
    ("openai", "gpt-4o-mini"),
];

const EMBEDDING_MARKERS: [&str; 6] = ["embed", "nomic", "mxbai", "bge-", "e5-", "gte-"];
const VISION_MARKERS: [&str; 5] = ["-vl", "-vision", "llava", "moondream", "minicpm-v"];

pub struct ModelSelector {
    /// Platform RAM probe result (§4.4 "system probe; fallback 5GB"), or the
    /// `AUTOLLM_MAX_MODEL_GB` override.
    system_max_model_gb: f64,
}

impl ModelSelector {
    pub fn new() -> Self {
        Self {
            system_max_model_gb: probe_system_max_model_gb(),
        }
    }

    pub fn with_system_max_model_gb(system_max_model_gb: f64) -> Self {
        Self { system_max_model_gb }
    }

    /// Classify and score every discovered model, filtered and sorted by
    /// `combinedScore` descending. `sizes_bytes` supplies exact Ollama sizes
    /// (in bytes) when known; MLX models fall back to the name-token
    /// heuristic regardless.
    pub fn select(
        &self,
        backend: BackendType,
        models: &[String],
        sizes_bytes: &std::collections::HashMap<String, u64>,
    ) -> Vec<ModelCandidate> {
        let mut candidates: Vec<ModelCandidate> = models
            .iter()
            .filter(|m| !is_embedding_only(m) && !is_vision_only(m))
            .map(|m| self.score_one(backend, m, sizes_bytes.get(m).copied()))
            .collect();

        candidates.sort_by(|a, b| b.combined_score.partial_cmp(&a.combined_score).unwrap());
        candidates
    }

    /// Pick the first `available` candidate as the primary local model.
    pub fn pick_primary<'a>(&self, candidates: &'a [ModelCandidate]) -> Option<&'a ModelCandidate> {
        candidates.iter().find(|c| c.available)
    }

    fn score_one(&self, backend: BackendType, name: &str, size_bytes: Option<u64>) -> ModelCandidate {
        let size_gb = match (backend, size_bytes) {
            (BackendType::Ollama, Some(bytes)) => bytes as f64 / 1_000_000_000.0,
            _ => estimate_mlx_size_gb(name),
        };
        let tier = classify_tier(name);
        let weight = WeightClass::from_size_gb(size_gb);

        let speed_score = speed_score_for(size_gb, backend);
        let qual_score = qual_score_for(name, tier);
        let mut combined = 0.6 * qual_score as f64 + 0.4 * speed_score as f64;
        combined += match weight {
            WeightClass::Medium => 15.0,
            WeightClass::Heavy => -20.0,
            WeightClass::Light => 0.0,
        };
        if backend == BackendType::Mlx && weight == WeightClass::Medium {
            combined += 20.0;
        }

        let mut reason = String::new();
        let mut available = true;
        if qual_score < MIN_QUALITY_FOR_AGENTIC {
            available = false;
            reason = "too small for reliable tool use".to_string();
        } else if size_gb > self.system_max_model_gb {
            available = false;
            reason = format!(
                "model size {size_gb:.1}GB exceeds system limit {:.1}GB",
                self.system_max_model_gb
            );
        }

        if backend == BackendType::Mlx && has_non_4bit_marker(name) {
            let note = "MLX size estimate may be unreliable for non-4-bit quantization";
            reason = if reason.is_empty() {
                note.to_string()
            } else {
                format!("{reason}; {note}")
            };
        }

        ModelCandidate {
            name: name.to_string(),
            provider: backend,
            tier,
            size_gb,
            weight,
            speed_score,
            qual_score,
            combined_score: combined,
            available,
            reason,
        }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_embedding_only(name: &str) -> bool {
    let lower = name.to_lowercase();
    EMBEDDING_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_vision_only(name: &str) -> bool {
    let lower = name.to_lowercase();
    VISION_MARKERS.iter().any(|m| lower.contains(m))
}

fn has_non_4bit_marker(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["8bit", "fp16", "bf16"].iter().any(|m| lower.contains(m))
}

/// Matches `token` (e.g. `"3b"`) in `lower` only at a size-number boundary —
/// the byte before the match, if any, must not be a digit. Without this,
/// `"3b"` matches inside `"13b"` and `"1b"` matches inside `"11b"`.
fn contains_size_token(lower: &str, token: &str) -> bool {
    lower
        .match_indices(token)
        .any(|(i, _)| i == 0 || !lower.as_bytes()[i - 1].is_ascii_digit())
}

/// MLX models' sizes are estimated from name tokens — heuristic, can be off
/// by 2x on non-4-bit quantizations (spec.md §4.4, §9 open question).
fn estimate_mlx_size_gb(name: &str) -> f64 {
    let lower = name.to_lowercase();
    if contains_size_token(&lower, "70b") {
        40.0
    } else if contains_size_token(&lower, "32b") {
        18.0
    } else if contains_size_token(&lower, "13b") || contains_size_token(&lower, "14b") {
        8.0
    } else if contains_size_token(&lower, "7b") || contains_size_token(&lower, "8b") {
        4.5
    } else if contains_size_token(&lower, "3b") {
        2.0
    } else if contains_size_token(&lower, "1b") {
        1.0
    } else {
        4.0
    }
}

fn classify_tier(name: &str) -> ModelTier {
    let lower = name.to_lowercase();
    if contains_size_token(&lower, "70b") || contains_size_token(&lower, "72b") {
        ModelTier::Frontier
    } else if contains_size_token(&lower, "32b") || contains_size_token(&lower, "34b") {
        ModelTier::Xl
    } else if contains_size_token(&lower, "13b") || contains_size_token(&lower, "14b") {
        ModelTier::Large
    } else if contains_size_token(&lower, "7b") || contains_size_token(&lower, "8b") {
        ModelTier::Medium
    } else {
        ModelTier::Small
    }
}

fn speed_score_for(size_gb: f64, backend: BackendType) -> u32 {
    let base: u32 = if size_gb < 2.0 {
        100
    } else if size_gb < 5.0 {
        85
    } else if size_gb < 8.0 {
        70
    } else if size_gb < 15.0 {
        50
    } else if size_gb < 30.0 {
        30
    } else {
        15
    };
    if backend == BackendType::Mlx {
        base + 30
    } else {
        base
    }
}

fn qual_score_for(name: &str, tier: ModelTier) -> u32 {
    let lower = name.to_lowercase();
    let mut score: i32 = match tier {
        ModelTier::Small => 30,
        ModelTier::Medium => 55,
        ModelTier::Large => 75,
        ModelTier::Xl => 90,
        ModelTier::Frontier => 100,
    };

    if lower.contains("coder") || lower.contains("code") {
        score += 15;
    }
    if lower.contains("qwen") {
        score += 20;
    }
    if lower.contains("instruct") {
        score += 10;
    }
    if lower.contains("mistral") {
        score += 10;
    }
    if lower.contains("llama") {
        score += 15;
    }

    if lower.contains("thinking") || lower.contains("reasoning") || lower.contains("r1") {
        score -= 50;
    }
    if lower.contains("qwen3") {
        score -= 25;
    }

    score.clamp(0, 100) as u32
}

fn probe_system_max_model_gb() -> f64 {
    if let Ok(v) = std::env::var("AUTOLLM_MAX_MODEL_GB") {
        if let Ok(parsed) = v.parse::<f64>() {
            return parsed;
        }
    }

    #[cfg(unix)]
    {
        // SAFETY: sysconf with these names is a simple read of kernel-reported
        // constants, no allocation or aliasing involved.
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if pages > 0 && page_size > 0 {
            let total_bytes = pages as f64 * page_size as f64;
            // Leave headroom: a model is "usable" up to roughly half of
            // physical RAM.
            return (total_bytes / 1_000_000_000.0 / 2.0).max(FALLBACK_MAX_MODEL_GB);
        }
    }

    FALLBACK_MAX_MODEL_GB
}
