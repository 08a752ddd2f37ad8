//! C1 — BackendProber.
//!
//! Issues one GET to a candidate local backend endpoint with a short
//! deadline and converts whatever happens (timeout, non-200, bad JSON) into
//! a [`BackendInfo`] rather than letting an error escape — mirroring
//! `backends/openai.rs::health_check`'s "probe and report" style, but
//! returning a result value instead of `anyhow::Result<()>` since callers
//! need the model inventory, not just a yes/no.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;

use super::types::{BackendInfo, BackendType};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes MLX/Dnet (`GET /v1/models`) and Ollama (`GET /api/tags`).
pub struct BackendProber {
    client: Client,
}

impl Default for BackendProber {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl BackendProber {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    /// Probe one backend. Never returns an `Err` — every failure mode
    /// (dial error, timeout, non-200, decode error) becomes an
    /// `available: false` `BackendInfo` with an `error` string.
    pub async fn probe(&self, backend_type: BackendType, endpoint: &str) -> BackendInfo {
        let started = Instant::now();
        let result = match backend_type {
            BackendType::Mlx | BackendType::Dnet => self.probe_openai_compatible(endpoint).await,
            BackendType::Ollama => self.probe_ollama(endpoint).await,
            BackendType::None => Ok(Vec::new()),
        };
        let response_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(models) if !models.is_empty() => BackendInfo {
                backend_type,
                endpoint: endpoint.to_string(),
                available: true,
                response_ms,
                models,
                error: None,
            },
            Ok(_) => BackendInfo::unavailable(
                backend_type,
                endpoint,
                "backend responded but reported zero models",
            ),
            Err(e) => BackendInfo::unavailable(backend_type, endpoint, e.to_string()),
        }
    }

    async fn probe_openai_compatible(&self, endpoint: &str) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let url = format!("{}/v1/models", endpoint.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "HTTP {}", response.status());

        let parsed: ModelsResponse = response.json().await?;
        let mut models = Vec::with_capacity(parsed.data.len() * 2);
        for entry in parsed.data {
            let last_component = super::types::last_path_component(&entry.id).to_string();
            if last_component != entry.id {
                models.push(last_component);
            }
            models.push(entry.id);
        }
        Ok(models)
    }

    async fn probe_ollama(&self, endpoint: &str) -> anyhow::Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }

        let url = format!("{}/api/tags", endpoint.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(response.status().is_success(), "HTTP {}", response.status());

        let parsed: TagsResponse = response.json().await?;
        let mut models = Vec::with_capacity(parsed.models.len() * 2);
        for entry in parsed.models {
            let base = super::types::base_name(&entry.name).to_string();
            if base != entry.name {
                models.push(base);
            }
            models.push(entry.name);
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probes_mlx_style_backend_and_stores_full_and_base_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "mlx-community/Llama-3.2-3B-4bit"}]
            })))
            .mount(&server)
            .await;

        let prober = BackendProber::default();
        let info = prober.probe(BackendType::Mlx, &server.uri()).await;

        assert!(info.available);
        assert!(info.has_model("mlx-community/Llama-3.2-3B-4bit"));
        assert!(info.has_model("Llama-3.2-3B-4bit"));
    }

    #[tokio::test]
    async fn probes_ollama_and_stores_full_and_base_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3:8b", "size": 4_600_000_000_u64}]
            })))
            .mount(&server)
            .await;

        let prober = BackendProber::default();
        let info = prober.probe(BackendType::Ollama, &server.uri()).await;

        assert!(info.available);
        assert!(info.has_model("llama3:8b"));
        assert!(info.has_model("llama3"));
    }

    #[tokio::test]
    async fn ollama_with_zero_models_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .mount(&server)
            .await;

        let prober = BackendProber::default();
        let info = prober.probe(BackendType::Ollama, &server.uri()).await;

        assert!(!info.available);
        assert!(info.error.is_some());
    }

    #[tokio::test]
    async fn non_200_is_unavailable_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = BackendProber::default();
        let info = prober.probe(BackendType::Mlx, &server.uri()).await;

        assert!(!info.available);
        assert!(info.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn decode_error_is_unavailable_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let prober = BackendProber::default();
        let info = prober.probe(BackendType::Mlx, &server.uri()).await;

        assert!(!info.available);
        assert!(info.error.is_some());
    }

    #[tokio::test]
    async fn dial_error_on_unreachable_endpoint_is_unavailable() {
        let prober = BackendProber::new(Duration::from_millis(200));
        let info = prober.probe(BackendType::Mlx, "http://127.0.0.1:1").await;
        assert!(!info.available);
        assert!(info.error.is_some());
    }
}
