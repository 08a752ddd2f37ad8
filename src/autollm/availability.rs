//! C3 — AvailabilityCache.
//!
//! Periodically refreshes model availability across local backends and
//! cloud providers, and answers "is X usable now?" from an atomically
//! consistent in-memory snapshot. The single-`RwLock`, write-lock-only-on-
//! final-assignment pattern mirrors `RouterState::config`/`replace_config`
//! in `router.rs`.

use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::prober::BackendProber;
use super::types::{AvailabilitySnapshot, BackendType, CloudProviders, model_names_match};

/// Endpoints probed by a refresh.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendEndpoints {
    pub mlx: String,
    pub ollama: String,
    pub dnet: String,
}

impl Default for BackendEndpoints {
    fn default() -> Self {
        Self {
            mlx: "http://127.0.0.1:8081".to_string(),
            ollama: "http://127.0.0.1:11434".to_string(),
            dnet: "http://127.0.0.1:9080".to_string(),
        }
    }
}

/// Priority order MLX > Dnet > Ollama, used both for `primaryLocalBackend`
/// and for the backend search order in `IsAvailable`.
const LOCAL_PRIORITY: [BackendType; 3] = [BackendType::Mlx, BackendType::Dnet, BackendType::Ollama];

const DEFAULT_TTL: Duration = Duration::from_secs(30);

pub struct AvailabilityCache {
    prober: BackendProber,
    endpoints: BackendEndpoints,
    ttl: Duration,
    snapshot: RwLock<AvailabilitySnapshot>,
}

impl AvailabilityCache {
    pub fn new(endpoints: BackendEndpoints) -> Self {
        Self::with_ttl(endpoints, DEFAULT_TTL)
    }

    pub fn with_ttl(endpoints: BackendEndpoints, ttl: Duration) -> Self {
        Self {
            prober: BackendProber::default(),
            endpoints,
            ttl,
            snapshot: RwLock::new(AvailabilitySnapshot::empty()),
        }
    }

    /// Probe all three local backends in parallel; compute `primaryLocalBackend`
    /// only after all three complete, then commit under one write-lock
    /// acquisition.
    pub async fn refresh(&self) {
        let (mlx, ollama, dnet) = tokio::join!(
            self.prober.probe(BackendType::Mlx, &self.endpoints.mlx),
            self.prober.probe(BackendType::Ollama, &self.endpoints.ollama),
            self.prober.probe(BackendType::Dnet, &self.endpoints.dnet),
        );

        let mlx_online = mlx.available;
        let ollama_online = ollama.available;
        let dnet_online = dnet.available;

        let online = |b: BackendType| match b {
            BackendType::Mlx => mlx_online && !mlx.models.is_empty(),
            BackendType::Dnet => dnet_online && !dnet.models.is_empty(),
            BackendType::Ollama => ollama_online && !ollama.models.is_empty(),
            BackendType::None => false,
        };
        let primary_local_backend = LOCAL_PRIORITY
            .into_iter()
            .find(|&b| online(b))
            .unwrap_or(BackendType::None);

        let snapshot = AvailabilitySnapshot {
            mlx_online,
            mlx_models: mlx.models,
            ollama_online,
            ollama_models: ollama.models,
            dnet_online,
            dnet_models: dnet.models,
            primary_local_backend,
            cloud_providers: probe_cloud_providers(),
            last_refresh: Utc::now(),
        };

        debug!(?primary_local_backend, "availability cache refreshed");
        *self.snapshot.write().expect("availability lock poisoned") = snapshot;
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        self.snapshot.read().expect("availability lock poisoned").clone()
    }

    pub fn get_primary_local_backend(&self) -> BackendType {
        self.snapshot().primary_local_backend
    }

    pub fn is_cache_stale(&self) -> bool {
        let snapshot = self.snapshot();
        if snapshot.last_refresh == chrono::DateTime::<Utc>::UNIX_EPOCH {
            return true;
        }
        Utc::now().signed_duration_since(snapshot.last_refresh)
            > chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30))
    }

    /// `provider == "local"` is satisfied by any local backend that holds
    /// the model, searched in priority order MLX → Dnet → Ollama. Claude
    /// Max ("claude_max") is a synthetic provider satisfied purely by the
    /// cloud-provider env-var probe (the CLI liveness check happens in the
    /// selector/provider layer, not here — this cache holds no process
    /// state).
    pub fn is_available(&self, model: &str, provider: &str) -> bool {
        let snapshot = self.snapshot();
        match provider {
            "local" => LOCAL_PRIORITY
                .into_iter()
                .any(|b| snapshot.models_for(b).iter().any(|m| model_names_match(m, model))),
            "mlx" => snapshot.mlx_models.iter().any(|m| model_names_match(m, model)),
            "ollama" => snapshot.ollama_models.iter().any(|m| model_names_match(m, model)),
            "dnet" => snapshot.dnet_models.iter().any(|m| model_names_match(m, model)),
            "claude_max" => snapshot.cloud_providers.claude_max,
            "openai" => snapshot.cloud_providers.openai,
            "anthropic" => snapshot.cloud_providers.anthropic,
            "google" => snapshot.cloud_providers.google,
            "mistral" => snapshot.cloud_providers.mistral,
            "groq" => snapshot.cloud_providers.groq,
            _ => false,
        }
    }

    /// Which backend currently holds `model`, searched MLX → Dnet → Ollama.
    /// `None` if the cache has no data for it.
    pub fn find_local_backend_for_model(&self, model: &str) -> Option<BackendType> {
        let snapshot = self.snapshot();
        LOCAL_PRIORITY
            .into_iter()
            .find(|&b| snapshot.models_for(b).iter().any(|m| model_names_match(m, model)))
    }

    /// Injects a snapshot directly, bypassing network probes. Used by
    /// router tests that need a fixed availability picture without
    /// standing up a mock server per backend.
    #[cfg(test)]
    pub(crate) fn set_snapshot_for_test(&self, snapshot: AvailabilitySnapshot) {
        *self.snapshot.write().expect("availability lock poisoned") = snapshot;
    }
}

fn env_nonempty(var: &str) -> bool {
    std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false)
}

fn probe_cloud_providers() -> CloudProviders {
    CloudProviders {
        openai: env_nonempty("OPENAI_API_KEY"),
        anthropic: env_nonempty("ANTHROPIC_API_KEY"),
        google: env_nonempty("GOOGLE_API_KEY") || env_nonempty("GEMINI_API_KEY"),
        mistral: env_nonempty("MISTRAL_API_KEY"),
        groq: env_nonempty("GROQ_API_KEY"),
        claude_max: claude_cli_on_path(),
    }
}

fn claude_cli_on_path() -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join("claude").is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mlx_server_with_models(models: &[&str]) -> MockServer {
        let server = MockServer::start().await;
        let data: Vec<_> = models.iter().map(|m| json!({"id": m})).collect();
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn refresh_computes_primary_local_backend_by_priority() {
        let mlx = mlx_server_with_models(&["Llama-3.2-3B-4bit"]).await;
        let cache = AvailabilityCache::new(BackendEndpoints {
            mlx: mlx.uri(),
            ollama: "http://127.0.0.1:1".to_string(),
            dnet: "http://127.0.0.1:1".to_string(),
        });
        cache.refresh().await;
        assert_eq!(cache.get_primary_local_backend(), BackendType::Mlx);
    }

    #[tokio::test]
    async fn refresh_is_idempotent_modulo_last_refresh() {
        let mlx = mlx_server_with_models(&["Llama-3.2-3B-4bit"]).await;
        let cache = AvailabilityCache::new(BackendEndpoints {
            mlx: mlx.uri(),
            ollama: "http://127.0.0.1:1".to_string(),
            dnet: "http://127.0.0.1:1".to_string(),
        });
        cache.refresh().await;
        let first = cache.snapshot();
        cache.refresh().await;
        let second = cache.snapshot();

        assert_eq!(first.mlx_models, second.mlx_models);
        assert_eq!(first.primary_local_backend, second.primary_local_backend);
    }

    #[tokio::test]
    async fn is_available_matches_by_last_path_component() {
        let mlx = mlx_server_with_models(&["mlx-community/Llama-3.2-3B-4bit"]).await;
        let cache = AvailabilityCache::new(BackendEndpoints {
            mlx: mlx.uri(),
            ollama: "http://127.0.0.1:1".to_string(),
            dnet: "http://127.0.0.1:1".to_string(),
        });
        cache.refresh().await;
        assert!(cache.is_available("Llama-3.2-3B-4bit", "local"));
        assert!(cache.is_available("mlx-community/Llama-3.2-3B-4bit", "mlx"));
    }

    #[test]
    fn is_cache_stale_is_true_before_first_refresh() {
        let cache = AvailabilityCache::new(BackendEndpoints::default());
        assert!(cache.is_cache_stale());
    }
}
