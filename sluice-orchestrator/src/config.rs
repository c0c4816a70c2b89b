//! Module configuration
//!
//! Node identity, where definitions live, and the timeouts of the reload
//! and shutdown procedures.

use std::path::PathBuf;
use std::time::Duration;

/// Lock domain shared by all singleton pipelines
pub const DEFAULT_LOCK_DOMAIN: &str = "pipeline_transient_tasks_singleton";

/// Pipeline module configuration
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Identity of this process when holding singleton locks
    pub node_id: String,

    /// JSON file with the pipeline definitions
    pub pipelines_path: PathBuf,

    /// How often the definitions file is checked for changes
    pub watch_interval: Duration,

    /// Upper bound for stopping changed pipelines during a reload
    pub reload_timeout: Duration,

    /// Upper bound for stopping every pipeline on shutdown
    pub shutdown_timeout: Duration,

    pub lock_domain: String,
}

impl ModuleConfig {
    /// Creates a new configuration with defaults
    pub fn new(node_id: String, pipelines_path: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            pipelines_path: pipelines_path.into(),
            watch_interval: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(300), // 5 minutes
            lock_domain: DEFAULT_LOCK_DOMAIN.to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SLUICE_NODE_ID (optional, default: random uuid)
    /// - SLUICE_PIPELINES (optional, default: pipelines.json)
    /// - SLUICE_WATCH_INTERVAL (optional, seconds, default: 5)
    /// - SLUICE_RELOAD_TIMEOUT (optional, seconds, default: 60)
    /// - SLUICE_SHUTDOWN_TIMEOUT (optional, seconds, default: 300)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("SLUICE_NODE_ID") {
            config.node_id = node_id;
        }

        if let Ok(path) = std::env::var("SLUICE_PIPELINES") {
            config.pipelines_path = PathBuf::from(path);
        }

        if let Some(interval) = secs_from_env("SLUICE_WATCH_INTERVAL")? {
            config.watch_interval = interval;
        }

        if let Some(timeout) = secs_from_env("SLUICE_RELOAD_TIMEOUT")? {
            config.reload_timeout = timeout;
        }

        if let Some(timeout) = secs_from_env("SLUICE_SHUTDOWN_TIMEOUT")? {
            config.shutdown_timeout = timeout;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }

        if self.pipelines_path.as_os_str().is_empty() {
            anyhow::bail!("pipelines_path cannot be empty");
        }

        if self.watch_interval.is_zero() {
            anyhow::bail!("watch_interval must be greater than 0");
        }

        if self.reload_timeout.is_zero() {
            anyhow::bail!("reload_timeout must be greater than 0");
        }

        if self.shutdown_timeout.is_zero() {
            anyhow::bail!("shutdown_timeout must be greater than 0");
        }

        if self.lock_domain.is_empty() {
            anyhow::bail!("lock_domain cannot be empty");
        }

        Ok(())
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), "pipelines.json")
    }
}

fn secs_from_env(key: &str) -> anyhow::Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(value) => {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("{} must be a number of seconds: {}", key, e))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
