//! Environment-driven runtime configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the worker loop, pipeline, and API facade.
///
/// Every field has a default; `from_env` applies environment overrides on
/// top. Absent provider API keys force the heuristic strategy/analysis
/// paths regardless of the `USE_AGENT_*` toggles.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long the worker sleeps when the queue is empty.
    pub poll_interval: Duration,
    /// Suppresses persistence of selected items (papers, analyses,
    /// findings). Notifications are still enqueued.
    pub dry_run: bool,
    /// Stable worker identity recorded on queue entries and the heartbeat.
    pub worker_id: String,
    /// Retargets all outbound notifications, for staging environments.
    pub test_user_override: Option<String>,
    /// Use the LLM strategy agent (on by default).
    pub use_agent_strategy: bool,
    /// Use the LLM analysis agent (off by default).
    pub use_agent_analyze: bool,
    /// Semaphore width for parallel analysis calls.
    pub max_concurrent_analysis: usize,
    /// SQLite database location.
    pub database_path: PathBuf,
    /// Per-(query, source) retrieval page size.
    pub per_query_limit: usize,
    /// GitHub token for the repository search adapter.
    pub github_token: Option<String>,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            dry_run: false,
            worker_id: "worker-1".to_string(),
            test_user_override: None,
            use_agent_strategy: true,
            use_agent_analyze: false,
            max_concurrent_analysis: 5,
            database_path: Self::default_database_path(),
            per_query_limit: 50,
            github_token: None,
            api_host: "127.0.0.1".to_string(),
            api_port: 8080,
        }
    }
}

impl RuntimeConfig {
    /// Default database path: `$XDG_DATA_HOME/scout/scout.db`.
    pub fn default_database_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("scout").join("scout.db")
    }

    /// Build a configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secs) = env::var("POLL_SECONDS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.poll_interval = Duration::from_secs(secs);
            } else {
                tracing::warn!("Ignoring unparseable POLL_SECONDS: {}", secs);
            }
        }
        if let Ok(v) = env::var("DRY_RUN") {
            config.dry_run = parse_bool(&v);
        }
        if let Ok(id) = env::var("WORKER_ID") {
            if !id.trim().is_empty() {
                config.worker_id = id;
            }
        }
        if let Ok(target) = env::var("TEST_USER_OVERRIDE") {
            if !target.trim().is_empty() {
                config.test_user_override = Some(target);
            }
        }
        if let Ok(v) = env::var("USE_AGENT_STRATEGY") {
            config.use_agent_strategy = parse_bool(&v);
        }
        if let Ok(v) = env::var("USE_AGENT_ANALYZE") {
            config.use_agent_analyze = parse_bool(&v);
        }
        if let Ok(v) = env::var("MAX_CONCURRENT_ANALYSIS") {
            if let Ok(n) = v.parse::<usize>() {
                config.max_concurrent_analysis = n.max(1);
            }
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(token) = env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                config.github_token = Some(token);
            }
        }
        if let Ok(host) = env::var("API_HOST") {
            config.api_host = host;
        }
        if let Ok(port) = env::var("API_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.api_port = port;
            }
        }

        config
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(!config.dry_run);
        assert!(config.use_agent_strategy);
        assert!(!config.use_agent_analyze);
        assert_eq!(config.max_concurrent_analysis, 5);
        assert_eq!(config.per_query_limit, 50);
    }

    #[test]
    fn bool_parsing_accepts_common_truthy_forms() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_bool(v), "{v} should parse as true");
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(v), "{v} should parse as false");
        }
    }
}
