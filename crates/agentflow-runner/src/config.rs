//! Environment-derived configuration for the runner service (§6.1).
//!
//! Resolution order, per setting: explicit constructor argument (the
//! `with_*` builder methods) → environment variable → config file in a
//! well-known location → built-in default. A config file at
//! `./agentflow.env` or `/etc/agentflow/agentflow.env` (first one found) is
//! loaded with `dotenvy::from_path`, which only sets variables not already
//! present in the process environment, so a real environment variable
//! always wins over the file.

use std::time::Duration;

use uuid::Uuid;

const DEFAULT_MAX_CONCURRENT: usize = 10;
const DEFAULT_POLL_MIN_MS: u64 = 100;
const DEFAULT_POLL_MAX_MS: u64 = 5_000;
const DEFAULT_HEARTBEAT_MS: u64 = 5_000;
const DEFAULT_TASK_STALE_MS: u64 = 60_000;
const DEFAULT_SERVER_STALE_MS: u64 = 15_000;
const DEFAULT_LOCK_DURATION_MS: u64 = 30_000;

const CONFIG_FILE_CANDIDATES: &[&str] = &["./agentflow.env", "/etc/agentflow/agentflow.env"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("AGENTFLOW_DATABASE_URL is not set and no database_url was provided")]
    MissingDatabaseUrl,

    #[error("invalid value for {field}: {value:?} ({source})")]
    InvalidValue {
        field: &'static str,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Resolved configuration for one `agentflow-runner` process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub database_url: String,
    pub runner_id: String,
    pub worker_group: String,
    pub topics: Vec<String>,
    pub max_concurrent: usize,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub heartbeat_interval: Duration,
    pub task_stale_threshold: Duration,
    pub server_stale_threshold: Duration,
    pub lock_duration: Duration,
}

impl RunnerConfig {
    /// Resolve configuration from the environment, loading the first
    /// config file found among [`CONFIG_FILE_CANDIDATES`] first so its
    /// values fill in anything the real environment doesn't already set.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_config_file();

        let database_url = std::env::var("AGENTFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let runner_id = std::env::var("AGENTFLOW_RUNNER_ID")
            .unwrap_or_else(|_| format!("runner-{}", Uuid::now_v7()));

        let topics = std::env::var("AGENTFLOW_TOPICS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_concurrent = parse_env("AGENTFLOW_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT)?;
        let poll_min_ms = parse_env("AGENTFLOW_POLL_MIN_MS", DEFAULT_POLL_MIN_MS)?;
        let poll_max_ms = parse_env("AGENTFLOW_POLL_MAX_MS", DEFAULT_POLL_MAX_MS)?;
        let heartbeat_ms = parse_env("AGENTFLOW_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS)?;
        let task_stale_ms = parse_env("AGENTFLOW_TASK_STALE_MS", DEFAULT_TASK_STALE_MS)?;
        let server_stale_ms = parse_env("AGENTFLOW_SERVER_STALE_MS", DEFAULT_SERVER_STALE_MS)?;
        let lock_duration_ms = parse_env("AGENTFLOW_LOCK_DURATION_MS", DEFAULT_LOCK_DURATION_MS)?;

        Ok(Self {
            database_url,
            runner_id,
            worker_group: "default".to_string(),
            topics,
            max_concurrent,
            poll_min: Duration::from_millis(poll_min_ms),
            poll_max: Duration::from_millis(poll_max_ms),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            task_stale_threshold: Duration::from_millis(task_stale_ms),
            server_stale_threshold: Duration::from_millis(server_stale_ms),
            lock_duration: Duration::from_millis(lock_duration_ms),
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_runner_id(mut self, id: impl Into<String>) -> Self {
        self.runner_id = id.into();
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

fn load_config_file() {
    for candidate in CONFIG_FILE_CANDIDATES {
        let path = std::path::Path::new(candidate);
        if path.is_file() {
            if let Err(e) = dotenvy::from_path(path) {
                tracing::warn!(path = %candidate, error = %e, "failed to load config file");
            } else {
                tracing::debug!(path = %candidate, "loaded config file");
            }
            return;
        }
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            field: key,
            value: raw,
            source: Box::new(e),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `std::env::set_var` is process-global; serialize tests that touch it
    // so they don't clobber each other under the test harness's thread pool.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_missing_database_url_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AGENTFLOW_DATABASE_URL");
        assert!(matches!(
            RunnerConfig::from_env(),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AGENTFLOW_DATABASE_URL", "postgres://localhost/test");
        std::env::remove_var("AGENTFLOW_MAX_CONCURRENT");
        std::env::remove_var("AGENTFLOW_TOPICS");
        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert!(config.topics.is_empty());
        assert_eq!(config.poll_min, Duration::from_millis(DEFAULT_POLL_MIN_MS));
        std::env::remove_var("AGENTFLOW_DATABASE_URL");
    }

    #[test]
    fn test_env_overrides_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AGENTFLOW_DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("AGENTFLOW_MAX_CONCURRENT", "42");
        std::env::set_var("AGENTFLOW_TOPICS", "Review, Summarize ,Translate");
        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.max_concurrent, 42);
        assert_eq!(
            config.topics,
            vec!["Review".to_string(), "Summarize".to_string(), "Translate".to_string()]
        );
        std::env::remove_var("AGENTFLOW_DATABASE_URL");
        std::env::remove_var("AGENTFLOW_MAX_CONCURRENT");
        std::env::remove_var("AGENTFLOW_TOPICS");
    }

    #[test]
    fn test_builder_overrides_resolved_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AGENTFLOW_DATABASE_URL", "postgres://localhost/test");
        let config = RunnerConfig::from_env()
            .unwrap()
            .with_max_concurrent(1)
            .with_runner_id("fixed-id");
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.runner_id, "fixed-id");
        std::env::remove_var("AGENTFLOW_DATABASE_URL");
    }
}
