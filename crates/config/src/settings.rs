//! Process-level settings

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Graph database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSettings {
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    /// Transient-failure retries in the query layer
    #[serde(default = "default_graph_retries")]
    pub max_retries: u32,
    /// Initial backoff, doubled per retry
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_graph_uri() -> String {
    std::env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string())
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_graph_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            user: default_graph_user(),
            password: String::new(),
            database: default_graph_database(),
            max_retries: default_graph_retries(),
            initial_backoff_ms: default_backoff_ms(),
        }
    }
}

impl GraphSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Scribe (intent-extraction LLM) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScribeSettings {
    #[serde(default = "default_scribe_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_scribe_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_scribe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scribe_retries")]
    pub max_retries: u32,
    #[serde(default = "default_scribe_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub temperature: f32,
}

fn default_scribe_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_scribe_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_scribe_timeout() -> u64 {
    20
}

fn default_scribe_retries() -> u32 {
    2
}

fn default_scribe_max_tokens() -> usize {
    768
}

impl Default for ScribeSettings {
    fn default() -> Self {
        Self {
            endpoint: default_scribe_endpoint(),
            model: default_scribe_model(),
            api_key: None,
            timeout_secs: default_scribe_timeout(),
            max_retries: default_scribe_retries(),
            max_tokens: default_scribe_max_tokens(),
            temperature: 0.0,
        }
    }
}

impl ScribeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Idle eviction threshold (default 2 h)
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: i64,
    /// Sweep interval for the background cleanup task
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// How long a turn waits on the per-session lock before rejecting
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Turns of history handed to the Scribe prompt
    #[serde(default = "default_recent_turns")]
    pub recent_turns: usize,
}

fn default_session_ttl_ms() -> i64 {
    7_200_000
}

fn default_cleanup_interval() -> u64 {
    900
}

fn default_lock_wait_ms() -> u64 {
    5_000
}

fn default_recent_turns() -> usize {
    6
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_session_ttl_ms(),
            cleanup_interval_secs: default_cleanup_interval(),
            lock_wait_ms: default_lock_wait_ms(),
            recent_turns: default_recent_turns(),
        }
    }
}

/// Judge fan-out settings (external scoring models)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSettings {
    /// Per-call timeout (default 300 s per the concurrency model)
    #[serde(default = "default_judge_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_judge_parallel")]
    pub max_parallel: usize,
}

fn default_judge_timeout() -> u64 {
    300
}

fn default_judge_parallel() -> usize {
    3
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_judge_timeout(),
            max_parallel: default_judge_parallel(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,
    #[serde(default)]
    pub graph: GraphSettings,
    #[serde(default)]
    pub scribe: ScribeSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub judge: JudgeSettings,
    /// Path to the tenant configuration file
    #[serde(default = "default_tenant_config_path")]
    pub tenant_config_path: String,
}

fn default_tenant_config_path() -> String {
    "config/tenants/hvac_filtration/config.yaml".to_string()
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graph.uri.is_empty() {
            return Err(ConfigError::MissingField("graph.uri".into()));
        }
        if self.session.ttl_ms <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.ttl_ms".into(),
                message: "must be positive".into(),
            });
        }
        if self.scribe.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scribe.timeout_secs".into(),
                message: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Load settings from an optional file plus `CPQ_`-prefixed env overrides
///
/// e.g. `CPQ_GRAPH__URI=bolt://host:7687` overrides `graph.uri`.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(File::from(path));
    }

    let cfg = builder
        .add_source(Environment::with_prefix("CPQ").separator("__"))
        .build()?;

    let settings: Settings = cfg.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.session.ttl_ms, 7_200_000);
        assert_eq!(settings.judge.timeout_secs, 300);
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        let mut settings = Settings::default();
        settings.session.ttl_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        use std::io::Write;
        let mut f = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            f,
            "environment: production\nsession:\n  ttl_ms: 600000\n"
        )
        .unwrap();
        let settings = load_settings(Some(f.path())).unwrap();
        assert!(settings.environment.is_production());
        assert_eq!(settings.session.ttl_ms, 600_000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_settings(Some(Path::new("/nonexistent/settings.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
