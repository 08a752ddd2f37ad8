//! C2 — BackendLauncher.
//!
//! Detects installed local backends and auto-starts the best one if none is
//! running, polling its health endpoint until it answers or a timeout
//! elapses. Process spawn/supervise idiom (`kill_on_drop`, redirected
//! stdio, PID file, graceful-SIGTERM-then-SIGKILL) is grounded on the
//! `aiOS` runtime's `ModelManager` (`load_model`/`unload_model`).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::Client;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::BackendType;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// Priority order for both "already running" detection and auto-start attempts.
const STARTUP_PRIORITY: [BackendType; 3] = [BackendType::Mlx, BackendType::Ollama, BackendType::Dnet];

/// Per-backend launch parameters.
#[derive(Debug, Clone)]
pub struct BackendLaunchConfig {
    pub backend_type: BackendType,
    pub endpoint: String,
    pub install_dir: PathBuf,
    pub default_model: Option<String>,
}

impl BackendLaunchConfig {
    fn binary_and_args(&self, port: &str) -> Result<(String, Vec<String>)> {
        match self.backend_type {
            BackendType::Mlx => {
                let model = self
                    .default_model
                    .as_deref()
                    .context("MLX launch requires a default_model")?;
                Ok((
                    "mlx_lm.server".to_string(),
                    vec![
                        "--model".to_string(),
                        model.to_string(),
                        "--port".to_string(),
                        port.to_string(),
                    ],
                ))
            }
            BackendType::Ollama => Ok(("ollama".to_string(), vec!["serve".to_string()])),
            BackendType::Dnet => Ok((
                "dnet-api".to_string(),
                vec!["--http-port".to_string(), port.to_string()],
            )),
            BackendType::None => bail!("cannot launch BackendType::None"),
        }
    }

    fn fallback_binary(&self) -> Option<&'static str> {
        match self.backend_type {
            BackendType::Dnet => Some("dnet"),
            _ => None,
        }
    }

    fn log_file_name(&self) -> String {
        format!("{}_server.log", self.backend_type)
    }

    fn pid_file(&self) -> PathBuf {
        self.install_dir.join(format!("{}.pid", self.backend_type))
    }

    fn port(&self) -> String {
        self.endpoint
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

struct OwnedChild {
    backend_type: BackendType,
    child: Child,
    pid_file: PathBuf,
}

/// Serializes all start/stop calls behind one mutex, as the spec's
/// concurrency model requires (§5: "one Mutex serializes start/stop").
pub struct BackendLauncher {
    configs: Vec<BackendLaunchConfig>,
    health_client: Client,
    startup_timeout: Duration,
    owned: Mutex<Option<OwnedChild>>,
}

impl BackendLauncher {
    pub fn new(configs: Vec<BackendLaunchConfig>) -> Self {
        Self::with_timeout(configs, DEFAULT_STARTUP_TIMEOUT)
    }

    pub fn with_timeout(configs: Vec<BackendLaunchConfig>, startup_timeout: Duration) -> Self {
        let health_client = Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .expect("failed to build reqwest client");
        Self {
            configs,
            health_client,
            startup_timeout,
            owned: Mutex::new(None),
        }
    }

    fn config_for(&self, backend_type: BackendType) -> Option<&BackendLaunchConfig> {
        self.configs.iter().find(|c| c.backend_type == backend_type)
    }

    /// Probe `PATH` for each backend's launcher binary; for MLX, also check
    /// a fixed list of common install paths for the Python-based server.
    pub fn detect_installed(&self) -> Vec<BackendType> {
        self.configs
            .iter()
            .filter(|c| self.is_installed(c))
            .map(|c| c.backend_type)
            .collect()
    }

    fn is_installed(&self, cfg: &BackendLaunchConfig) -> bool {
        let (binary, _) = match cfg.binary_and_args("0") {
            Ok(v) => v,
            Err(_) => return false,
        };
        if binary_on_path(&binary) {
            return true;
        }
        if let Some(fallback) = cfg.fallback_binary() {
            if binary_on_path(fallback) {
                return true;
            }
        }
        if cfg.backend_type == BackendType::Mlx {
            return mlx_well_known_paths().iter().any(|p| p.exists());
        }
        false
    }

    /// Ensure at least one local backend is healthy and running.
    ///
    /// 1. If any backend is already healthy, return it (priority for
    ///    "already running" is MLX > Ollama > Dnet).
    /// 2. Else attempt to start in priority order MLX → Ollama → Dnet.
    /// 3. If none start, fail with "no LLM backend available".
    pub async fn ensure_backend_running(&self) -> Result<BackendType> {
        for backend_type in STARTUP_PRIORITY {
            if let Some(cfg) = self.config_for(backend_type) {
                if self.poll_health_once(cfg).await {
                    info!(%backend_type, "backend already healthy");
                    return Ok(backend_type);
                }
            }
        }

        for backend_type in STARTUP_PRIORITY {
            let Some(cfg) = self.config_for(backend_type) else {
                continue;
            };
            match self.start_and_wait(cfg).await {
                Ok(()) => {
                    info!(%backend_type, "backend started");
                    return Ok(backend_type);
                }
                Err(e) => {
                    warn!(%backend_type, error = %e, "backend failed to start, trying next candidate");
                }
            }
        }

        bail!("no LLM backend available")
    }

    async fn poll_health_once(&self, cfg: &BackendLaunchConfig) -> bool {
        let url = health_url(cfg);
        matches!(self.health_client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn start_and_wait(&self, cfg: &BackendLaunchConfig) -> Result<()> {
        let mut guard = self.owned.lock().await;
        if guard.is_some() {
            bail!("launcher already owns a running child process");
        }

        let port = cfg.port();
        let (binary, args) = cfg.binary_and_args(&port)?;
        let binary = if binary_on_path(&binary) {
            binary
        } else if let Some(fallback) = cfg.fallback_binary().filter(|f| binary_on_path(f)) {
            fallback.to_string()
        } else {
            bail!("{binary} not found on PATH");
        };

        let log_path = cfg.install_dir.join(cfg.log_file_name());
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening log file {}", log_path.display()))?;
        let stderr_file = log_file.try_clone().context("cloning log file handle")?;

        debug!(binary = %binary, ?args, log = %log_path.display(), "spawning backend process");
        let mut child = Command::new(&binary)
            .args(&args)
            .current_dir(&cfg.install_dir)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(stderr_file))
            .spawn()
            .with_context(|| format!("failed to spawn {binary}"))?;

        let pid_file = cfg.pid_file();
        if let Some(pid) = child.id() {
            let _ = std::fs::write(&pid_file, pid.to_string());
        }

        let deadline = Instant::now() + self.startup_timeout;
        let mut healthy = false;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                bail!("{} exited early with status {status}", cfg.backend_type);
            }
            if self.poll_health_once(cfg).await {
                healthy = true;
                break;
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        if !healthy {
            warn!(backend_type = %cfg.backend_type, "startup timed out, killing child");
            let _ = child.kill().await;
            let _ = std::fs::remove_file(&pid_file);
            bail!(
                "{} did not become healthy within {:?}",
                cfg.backend_type,
                self.startup_timeout
            );
        }

        *guard = Some(OwnedChild {
            backend_type: cfg.backend_type,
            child,
            pid_file,
        });
        Ok(())
    }

    /// Stop the child this launcher owns, if any. Processes not started by
    /// this launcher are never touched here.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.owned.lock().await;
        let Some(mut owned) = guard.take() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            if let Some(pid) = owned.child.id() {
                // SAFETY: `pid` is a valid process id obtained from `Child::id`.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                debug!(backend_type = %owned.backend_type, pid, "sent SIGTERM");
            }

            let deadline = Instant::now() + GRACEFUL_SHUTDOWN_WAIT;
            loop {
                match owned.child.try_wait() {
                    Ok(Some(status)) => {
                        info!(backend_type = %owned.backend_type, %status, "backend exited");
                        break;
                    }
                    Ok(None) => {
                        if Instant::now() >= deadline {
                            warn!(backend_type = %owned.backend_type, "graceful shutdown timed out, sending SIGKILL");
                            let _ = owned.child.kill().await;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    Err(e) => {
                        warn!(backend_type = %owned.backend_type, error = %e, "error waiting for child, killing");
                        let _ = owned.child.kill().await;
                        break;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = owned.child.kill().await;
        }

        let _ = std::fs::remove_file(&owned.pid_file);
        Ok(())
    }
}

fn health_url(cfg: &BackendLaunchConfig) -> String {
    let base = cfg.endpoint.trim_end_matches('/');
    match cfg.backend_type {
        BackendType::Mlx | BackendType::Dnet => format!("{base}/v1/models"),
        BackendType::Ollama => format!("{base}/api/tags"),
        BackendType::None => base.to_string(),
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

fn mlx_well_known_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin/mlx_lm.server"),
        PathBuf::from("/opt/homebrew/bin/mlx_lm.server"),
        PathBuf::from(format!(
            "{}/.local/bin/mlx_lm.server",
            std::env::var("HOME").unwrap_or_default()
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(backend_type: BackendType, endpoint: &str) -> BackendLaunchConfig {
        BackendLaunchConfig {
            backend_type,
            endpoint: endpoint.to_string(),
            install_dir: std::env::temp_dir(),
            default_model: Some("test-model".to_string()),
        }
    }

    #[test]
    fn health_url_uses_openai_compatible_path_for_mlx_and_dnet() {
        assert_eq!(
            health_url(&cfg(BackendType::Mlx, "http://127.0.0.1:8081")),
            "http://127.0.0.1:8081/v1/models"
        );
        assert_eq!(
            health_url(&cfg(BackendType::Dnet, "http://127.0.0.1:9080")),
            "http://127.0.0.1:9080/v1/models"
        );
    }

    #[test]
    fn health_url_uses_native_path_for_ollama() {
        assert_eq!(
            health_url(&cfg(BackendType::Ollama, "http://127.0.0.1:11434")),
            "http://127.0.0.1:11434/api/tags"
        );
    }

    #[test]
    fn pid_file_is_named_after_backend() {
        let c = cfg(BackendType::Ollama, "http://127.0.0.1:11434");
        assert!(c.pid_file().ends_with("ollama.pid"));
    }

    #[tokio::test]
    async fn ensure_backend_running_fails_when_nothing_installed_or_reachable() {
        let launcher = BackendLauncher::with_timeout(
            vec![
                cfg(BackendType::Mlx, "http://127.0.0.1:1"),
                cfg(BackendType::Ollama, "http://127.0.0.1:1"),
                cfg(BackendType::Dnet, "http://127.0.0.1:1"),
            ],
            Duration::from_millis(50),
        );
        let result = launcher.ensure_backend_running().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_nothing_owned() {
        let launcher = BackendLauncher::new(vec![]);
        assert!(launcher.stop().await.is_ok());
    }
}
