//! Runtime configuration from environment variables
//!
//! `.env` is loaded first (if present) through `dotenvy`; real environment
//! variables win over it.

use std::path::PathBuf;
use std::time::Duration;

use crate::generation::GenerationConfig;
use crate::sandbox::SandboxConfig;

pub const ENV_API_KEY: &str = "XAI_API_KEY";
pub const ENV_API_URL: &str = "POLYFLOW_API_URL";
pub const ENV_MODEL: &str = "POLYFLOW_MODEL";
pub const ENV_INTERPRETER: &str = "POLYFLOW_INTERPRETER";
pub const ENV_HELPERS_DIR: &str = "POLYFLOW_HELPERS_DIR";
pub const ENV_EXEC_TIMEOUT: &str = "POLYFLOW_EXEC_TIMEOUT_SECS";
pub const ENV_STREAM_TIMEOUT: &str = "POLYFLOW_STREAM_TIMEOUT_SECS";
pub const ENV_SESSION_DIR: &str = "POLYFLOW_SESSION_DIR";
pub const ENV_LOG_JSON: &str = "POLYFLOW_LOG_JSON";
pub const ENV_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Error type for configuration loading
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => {
                write!(f, "invalid value for {}: '{}'", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub generation: GenerationConfig,
    pub sandbox: SandboxConfig,
    /// Where `/save` writes sessions (None = ~/.polyflow/sessions)
    pub session_dir: Option<PathBuf>,
    /// Emit JSON log lines instead of the human format
    pub json_logs: bool,
    /// OTLP collector endpoint (used with the `otel` feature)
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Load `.env`, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(key) = get(ENV_API_KEY) {
            config.generation.api_key = key;
        }
        if let Some(url) = get(ENV_API_URL) {
            config.generation.api_url = url;
        }
        if let Some(model) = get(ENV_MODEL) {
            config.generation.model = model;
        }
        if let Some(interpreter) = get(ENV_INTERPRETER) {
            config.sandbox.interpreter = interpreter;
        }
        if let Some(dir) = get(ENV_HELPERS_DIR) {
            config.sandbox.working_dir = PathBuf::from(dir);
        }
        if let Some(value) = get(ENV_EXEC_TIMEOUT) {
            config.sandbox.buffered_timeout = parse_secs(ENV_EXEC_TIMEOUT, &value)?;
        }
        if let Some(value) = get(ENV_STREAM_TIMEOUT) {
            config.sandbox.stream_timeout = parse_secs(ENV_STREAM_TIMEOUT, &value)?;
        }
        config.session_dir = get(ENV_SESSION_DIR).map(PathBuf::from);
        if let Some(value) = get(ENV_LOG_JSON) {
            config.json_logs = parse_flag(ENV_LOG_JSON, &value)?;
        }
        config.otlp_endpoint = get(ENV_OTLP_ENDPOINT);

        Ok(config)
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}
