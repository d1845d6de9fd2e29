//! Configuration management for the CPQ engine
//!
//! Two layers:
//! - `Settings`: process-level settings (graph connection, scribe endpoint,
//!   session TTLs) loaded from YAML/TOML files plus `CPQ_`-prefixed
//!   environment variables.
//! - `TenantConfig`: per-tenant domain configuration parsed from
//!   `config/tenants/{tenant}/config.yaml`: material hierarchy, dimension
//!   tables, derivation rules, fallback keyword tables, prompt templates.
//!
//! Tenant config is validated at load time; a malformed file refuses to load
//! rather than serving defaulted behavior. The parsed config is cached
//! process-wide (the only sanctioned global).

pub mod settings;
pub mod tenant;

pub use settings::{
    load_settings, GraphSettings, JudgeSettings, RuntimeEnvironment, ScribeSettings,
    SessionSettings, Settings,
};
pub use tenant::{
    cached_tenant, init_tenant_cache, AccessoryHint, LengthRule, MaterialEntry, ProductHint,
    PromptTemplates, TenantConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for cpq_core::Error {
    fn from(err: ConfigError) -> Self {
        cpq_core::Error::Config(err.to_string())
    }
}
