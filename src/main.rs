use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{debug, info, warn};

mod api;
mod autollm;
mod backends;
mod config;
mod error;
mod router;
mod traffic;

pub use config::Config;
pub use error::AppError;
pub use traffic::TrafficLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lm_gateway=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("LMG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/lm-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        "lm-gateway starting"
    );

    let traffic_log = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));
    let config = Arc::new(config);

    // Build router state, attaching the adaptive two-lane router when
    // `[autollm]` is configured.
    let mut state = router::RouterState::new(
        Arc::clone(&config),
        config_path.clone(),
        Arc::clone(&traffic_log),
    );
    if let Some(autollm_cfg) = config.autollm.clone() {
        // Startup data flow per the adaptive router's design: C2 (launch a
        // local backend if needed) runs before C1/C3 (probe + cache the
        // inventory), which in turn must complete before C4 (one-shot model
        // selection) has anything to select over.
        ensure_local_backend(autollm_cfg.clone()).await;

        let (autollm_router, autollm_availability) = build_autollm_stack(&autollm_cfg, &config);
        autollm_availability.refresh().await;
        log_startup_model_selection(&autollm_availability);

        tokio::spawn(availability_refresh_loop(
            Arc::clone(&autollm_availability),
            Duration::from_secs(autollm_cfg.availability_ttl_secs),
        ));
        state = state.with_autollm(autollm_router, autollm_availability);
    }
    let state = Arc::new(state);

    // Spawn hot-reload watcher — polls the config file every 5 seconds
    tokio::spawn(config_watcher(Arc::clone(&state)));

    // Bind client API (agent-facing)
    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.client_port).parse()?;

    // Bind admin API
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.admin_port).parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    // Attach request tracing middleware to both servers
    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::client_auth::client_auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            api::admin_auth::admin_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `lm-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LMG_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection — no inotify/kqueue dependencies.
/// Parse failures are logged and ignored; the running config is unchanged.
async fn config_watcher(state: Arc<router::RouterState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}

/// Build the adaptive router's availability cache, provider map and
/// [`autollm::Router`] from `[autollm]` at startup.
fn build_autollm_stack(
    autollm_cfg: &config::AutollmConfig,
    config: &Config,
) -> (Arc<autollm::Router>, Arc<autollm::AvailabilityCache>) {
    let availability = Arc::new(autollm::AvailabilityCache::with_ttl(
        autollm_cfg.local_backends.clone(),
        Duration::from_secs(autollm_cfg.availability_ttl_secs),
    ));

    let providers = build_autollm_providers(autollm_cfg, config);

    let router_config = autollm::RouterConfig {
        fast_lane: autollm_cfg.fast_lane.clone(),
        smart_lane: autollm_cfg.smart_lane.clone(),
        default_smart_model: autollm_cfg.default_smart_model.clone(),
        learned: autollm_cfg.learned,
    };

    let outcome_store: Arc<dyn autollm::provider::OutcomeStore> =
        Arc::new(autollm::InMemoryOutcomeStore::new());

    let router = Arc::new(
        autollm::Router::new(Arc::clone(&availability), router_config, providers)
            .with_outcome_store(outcome_store),
    );

    (router, availability)
}

/// Wrap each reachable backend in a [`autollm::provider::BackendClientProvider`].
///
/// Local backends (mlx/dnet/ollama) default to `autollm_cfg.local_backends`
/// when not already named under `[backends]`; every other `[backends]` entry
/// is exposed under its config name so cloud `ModelCapability.provider`
/// values (`"anthropic"`, `"openai"`, `"groq"`, ...) resolve directly.
fn build_autollm_providers(
    autollm_cfg: &config::AutollmConfig,
    config: &Config,
) -> std::collections::HashMap<String, Arc<dyn autollm::provider::Provider>> {
    use crate::backends::BackendClient;
    use crate::config::{BackendConfig, Provider as WireProvider};
    use autollm::provider::BackendClientProvider;

    let mut providers: std::collections::HashMap<String, Arc<dyn autollm::provider::Provider>> =
        std::collections::HashMap::new();

    let local = [
        ("mlx", autollm_cfg.local_backends.mlx.clone(), WireProvider::OpenAI),
        ("dnet", autollm_cfg.local_backends.dnet.clone(), WireProvider::OpenAI),
        ("ollama", autollm_cfg.local_backends.ollama.clone(), WireProvider::Ollama),
    ];
    for (name, base_url, wire_provider) in local {
        let backend_cfg = config.backends.get(name).cloned().unwrap_or(BackendConfig {
            base_url,
            api_key_env: None,
            timeout_ms: 30_000,
            provider: wire_provider,
        });
        match BackendClient::new(&backend_cfg) {
            Ok(client) => {
                providers.insert(name.to_string(), Arc::new(BackendClientProvider::new(name, client)));
            }
            Err(e) => warn!(backend = name, error = %e, "autollm: local provider unavailable"),
        }
    }

    for (name, backend_cfg) in &config.backends {
        if providers.contains_key(name) {
            continue;
        }
        match BackendClient::new(backend_cfg) {
            Ok(client) => {
                providers.insert(
                    name.clone(),
                    Arc::new(BackendClientProvider::new(name.clone(), client)),
                );
            }
            Err(e) => warn!(backend = %name, error = %e, "autollm: cloud provider unavailable"),
        }
    }

    providers
}

/// Background task: refreshes the availability cache on a fixed interval.
///
/// The caller is expected to have already run one `refresh()` synchronously
/// at startup (for C4's one-shot selection); this loop only maintains it
/// from then on.
async fn availability_refresh_loop(cache: Arc<autollm::AvailabilityCache>, ttl: Duration) {
    let mut interval = tokio::time::interval(ttl);
    interval.tick().await; // consume the immediate first tick — we just refreshed at startup
    loop {
        interval.tick().await;
        cache.refresh().await;
    }
}

/// C4 — one-shot model selection over the freshly refreshed inventory.
///
/// Scores and ranks each local backend's discovered models, logs the
/// primary candidate that would be picked for the fast lane, and logs the
/// fixed cloud fallback chain for operator visibility. `[autollm.fast_lane]`
/// / `[autollm.smart_lane]` remain the authoritative, explicitly configured
/// routing lanes — this selection is advisory, surfaced so operators can see
/// what the scorer would have picked before hand-tuning lane config.
fn log_startup_model_selection(availability: &autollm::AvailabilityCache) {
    let selector = autollm::ModelSelector::new();
    let snapshot = availability.snapshot();

    for backend in [
        autollm::types::BackendType::Mlx,
        autollm::types::BackendType::Ollama,
        autollm::types::BackendType::Dnet,
    ] {
        let models = snapshot.models_for(backend).to_vec();
        if models.is_empty() {
            continue;
        }
        let sizes_bytes = std::collections::HashMap::new();
        let candidates = selector.select(backend, &models, &sizes_bytes);
        match selector.pick_primary(&candidates) {
            Some(primary) => info!(
                %backend,
                model = %primary.name,
                score = primary.combined_score,
                tier = ?primary.tier,
                "autollm: startup model selection picked a primary candidate"
            ),
            None => debug!(%backend, "autollm: startup model selection found no available candidate"),
        }
    }

    debug!(
        chain = ?autollm::selector::CLOUD_FALLBACK_CHAIN,
        "autollm: fixed cloud fallback chain"
    );
}

/// Best-effort startup step (C2): auto-launches a local backend if the
/// configured fast-lane candidates need one and none is already running.
/// Awaited directly (not spawned) so the C1/C3 probe that follows sees it.
/// Failures are logged, not fatal — cloud-only fast-lane entries or an
/// already-running backend make this a no-op.
async fn ensure_local_backend(autollm_cfg: config::AutollmConfig) {
    let install_dir = PathBuf::from(&autollm_cfg.install_dir);
    let configs = vec![
        autollm::launcher::BackendLaunchConfig {
            backend_type: autollm::types::BackendType::Mlx,
            endpoint: autollm_cfg.local_backends.mlx.clone(),
            install_dir: install_dir.clone(),
            default_model: None,
        },
        autollm::launcher::BackendLaunchConfig {
            backend_type: autollm::types::BackendType::Ollama,
            endpoint: autollm_cfg.local_backends.ollama.clone(),
            install_dir: install_dir.clone(),
            default_model: None,
        },
        autollm::launcher::BackendLaunchConfig {
            backend_type: autollm::types::BackendType::Dnet,
            endpoint: autollm_cfg.local_backends.dnet.clone(),
            install_dir,
            default_model: None,
        },
    ];
    let launcher = autollm::BackendLauncher::with_timeout(
        configs,
        Duration::from_secs(autollm_cfg.startup_timeout_secs),
    );
    match launcher.ensure_backend_running().await {
        Ok(backend) => info!(%backend, "autollm: local backend ready"),
        Err(e) => warn!(error = %e, "autollm: no local backend available, fast lane limited to cloud candidates"),
    }
}
