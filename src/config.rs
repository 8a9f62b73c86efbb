use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use clap::Args;
use plugin_sdk::{LogLevel, SupervisorConfig};
use tracing::{debug, info};

/// Settings shared by the master and its workers.
///
/// Every field can also come from the environment; `load_env_file` runs
/// first so a `.env` next to the binary behaves like exported variables.
/// The master forwards the parsed values to its workers on the command line
/// (see [`HostConfig::worker_args`]), so both sides always agree.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Number of worker processes (defaults to available parallelism)
    #[arg(long, env = "PLUGIN_WORKERS")]
    pub workers: Option<usize>,

    /// Port every worker listens on
    #[arg(long, env = "PLUGIN_PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "PLUGIN_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// error, warn, info, debug, trace or critical
    #[arg(long, env = "PLUGIN_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Write daily rolling log files here instead of stderr
    #[arg(long, env = "PLUGIN_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Base URL of the platform control API
    #[arg(long, env = "PLUGIN_PLATFORM_URL", default_value = "http://127.0.0.1:8000")]
    pub platform_url: String,

    #[arg(long, env = "PLUGIN_PLATFORM_TIMEOUT_MS", default_value_t = 10_000)]
    pub platform_timeout_ms: u64,

    /// Base lifetime of a cached instance context (jittered up to +10%)
    #[arg(long, env = "PLUGIN_CONTEXT_TTL_MS", default_value_t = 60_000)]
    pub context_ttl_ms: u64,

    /// Do not push the current credentials and log level to newly spawned
    /// workers; they stay empty until the next change is broadcast
    #[arg(long, env = "PLUGIN_NO_SYNC_ON_SPAWN")]
    pub no_sync_on_spawn: bool,

    /// Delay before retrying a worker that failed to spawn
    #[arg(long, env = "PLUGIN_RESPAWN_BACKOFF_MS", default_value_t = 1_000)]
    pub respawn_backoff_ms: u64,
}

impl HostConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_millis(self.platform_timeout_ms)
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_millis(self.context_ttl_ms)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            workers: self.worker_count(),
            sync_on_spawn: !self.no_sync_on_spawn,
            respawn_backoff: Duration::from_millis(self.respawn_backoff_ms),
            ..SupervisorConfig::default()
        }
    }

    /// Flags that reproduce this config on a worker's command line.
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.port.to_string(),
            "--bind".to_string(),
            self.bind.to_string(),
            "--log-level".to_string(),
            self.log_level.to_string(),
            "--platform-url".to_string(),
            self.platform_url.clone(),
            "--platform-timeout-ms".to_string(),
            self.platform_timeout_ms.to_string(),
            "--context-ttl-ms".to_string(),
            self.context_ttl_ms.to_string(),
        ];
        if let Some(dir) = &self.log_dir {
            args.push("--log-dir".to_string());
            args.push(dir.display().to_string());
        }
        args
    }
}

/// Load `env_file` into the process environment if it exists. Variables that
/// are already set win.
pub fn load_env_file(env_file: &Path) -> bool {
    if !env_file.exists() {
        debug!("no env file at {}", env_file.display());
        return false;
    }
    match dotenvy::from_path(env_file) {
        Ok(()) => {
            info!("Loaded .env from {}", env_file.display());
            true
        }
        Err(err) => {
            eprintln!("could not load {}: {err}", env_file.display());
            false
        }
    }
}
