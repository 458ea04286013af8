//! Worker configuration — env/CLI over built-in defaults, the same layering
//! `DaemonConfig::new` uses in the teacher: CLI/env beats TOML beats
//! built-in default.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_STALE_JOB_THRESHOLD_MS: u64 = 60_000;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 8;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_SESSION_RETENTION_DAYS: u32 = 30;

/// Per-capability configuration profile, e.g. `[capability.claude-review]`
/// in the worker's TOML config file (`{log_dir}/config.toml`).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct CapabilityProfile {
    pub timeout_sec: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub idle_timeout_sec: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TomlConfig {
    log: Option<String>,
    max_concurrent_jobs: Option<usize>,
    capability: Option<std::collections::HashMap<String, CapabilityProfile>>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse worker config.toml — using defaults");
            None
        }
    }
}

/// Validated, resolved worker configuration (spec §6.5).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval: Duration,
    pub stale_job_threshold: Duration,
    pub database_url: String,
    pub capabilities: std::collections::HashMap<String, CapabilityProfile>,
    /// Canonical roots a session/execution working directory must resolve
    /// under (spec §4.1 `validateWorkingDir`). Colon-separated in
    /// `WORKER_ALLOWED_DIRS`; falls back to the process cwd.
    pub allowed_working_dirs: Vec<PathBuf>,
    /// Days an `ended` session is kept before `prune_old_sessions` deletes
    /// it (SPEC_FULL.md supplemented feature #2). `0` disables pruning.
    pub session_retention_days: u32,
}

impl WorkerConfig {
    /// Build from explicit CLI overrides, falling back to environment
    /// variables, a `config.toml` inside `log_dir`, then built-in defaults.
    pub fn new(
        worker_id: Option<String>,
        log_dir: Option<PathBuf>,
        log_level: Option<String>,
        max_concurrent_jobs: Option<usize>,
        database_url: Option<String>,
    ) -> anyhow::Result<Self> {
        let log_dir = log_dir
            .or_else(|| std::env::var("LOG_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let toml_cfg = load_toml(&log_dir.join("config.toml")).unwrap_or_default();

        let worker_id = worker_id
            .or_else(|| std::env::var("WORKER_ID").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let log_level = log_level
            .or_else(|| std::env::var("WORKER_LOG").ok())
            .or(toml_cfg.log)
            .unwrap_or_else(|| "info".to_string());

        let max_concurrent_jobs = max_concurrent_jobs
            .or_else(|| {
                std::env::var("WORKER_MAX_CONCURRENT_JOBS")
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .or(toml_cfg.max_concurrent_jobs)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);

        let heartbeat_interval = std::env::var("HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));

        let stale_job_threshold = std::env::var("STALE_JOB_THRESHOLD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_STALE_JOB_THRESHOLD_MS));

        let database_url = database_url
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;

        let allowed_working_dirs = std::env::var("WORKER_ALLOWED_DIRS")
            .ok()
            .map(|v| v.split(':').map(PathBuf::from).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))]);

        let session_retention_days = std::env::var("SESSION_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SESSION_RETENTION_DAYS);

        Ok(Self {
            worker_id,
            log_dir,
            log_level,
            max_concurrent_jobs,
            heartbeat_interval,
            stale_job_threshold,
            database_url,
            capabilities: toml_cfg.capability.unwrap_or_default(),
            allowed_working_dirs,
            session_retention_days,
        })
    }

    pub fn capability_profile(&self, name: &str) -> Option<&CapabilityProfile> {
        self.capabilities.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env_or_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WorkerConfig::new(
            Some("w1".into()),
            Some(dir.path().to_path_buf()),
            None,
            None,
            Some("postgres://localhost/test".into()),
        )
        .unwrap();
        assert_eq!(cfg.worker_id, "w1");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
        assert_eq!(
            cfg.heartbeat_interval,
            Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)
        );
    }

    #[test]
    fn missing_database_url_errors() {
        std::env::remove_var("DATABASE_URL");
        let dir = tempfile::tempdir().unwrap();
        let result = WorkerConfig::new(None, Some(dir.path().to_path_buf()), None, None, None);
        assert!(result.is_err());
    }

    #[test]
    fn toml_capability_profile_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[capability.claude-review]\ntimeout_sec = 120\n",
        )
        .unwrap();
        let cfg = WorkerConfig::new(
            None,
            Some(dir.path().to_path_buf()),
            None,
            None,
            Some("postgres://localhost/test".into()),
        )
        .unwrap();
        let profile = cfg.capability_profile("claude-review").unwrap();
        assert_eq!(profile.timeout_sec, Some(120));
    }
}
