//! Environment-keyed stream endpoint configuration.
//!
//! The active environment is chosen once per process. Resolution is a plain
//! table lookup: an unknown environment name yields a configuration without
//! an endpoint rather than an error, and the failure surfaces later when a
//! client is built from it.

use std::ffi::OsStr;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::debug;

/// Local development websocket endpoint.
pub const DEVELOPMENT_WS_URL: &str = "ws://localhost:8765";
/// Production websocket endpoint.
pub const PRODUCTION_WS_URL: &str = "wss://stream.dudo.tech";
/// Process variable holding the environment indicator.
pub const ENVIRONMENT_VAR: &str = "ANTALLA_ENV";
/// Indicator used when [`ENVIRONMENT_VAR`] is unset.
pub const DEFAULT_ENVIRONMENT: &str = "development";

static PROCESS_CONFIG: OnceLock<StreamConfig> = OnceLock::new();

/// Named deployment environments with a fixed endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Returns the indicator string for this environment.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    /// Returns the websocket endpoint bound to this environment.
    pub fn ws_url(self) -> &'static str {
        match self {
            Self::Development => DEVELOPMENT_WS_URL,
            Self::Production => PRODUCTION_WS_URL,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Errors produced when a caller needs a fully resolved configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicator does not name a known environment.
    #[error("unknown environment: {0:?}")]
    UnknownEnvironment(String),

    /// Configuration was resolved without a websocket endpoint.
    #[error("no websocket endpoint configured for environment {0:?}")]
    MissingEndpoint(String),
}

/// Resolved stream configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamConfig {
    indicator: String,
    ws_url: Option<String>,
}

impl StreamConfig {
    /// Looks up the configuration for an environment indicator.
    ///
    /// Unknown indicators produce a configuration whose endpoint is absent.
    pub fn resolve(indicator: &str) -> Self {
        let ws_url = indicator
            .parse::<Environment>()
            .ok()
            .map(|env| env.ws_url().to_string());
        debug!(
            event = "stream_config_resolved",
            indicator,
            resolved = ws_url.is_some()
        );
        Self {
            indicator: indicator.to_string(),
            ws_url,
        }
    }

    /// Returns the configuration for a known environment.
    pub fn for_environment(env: Environment) -> Self {
        Self {
            indicator: env.as_str().to_string(),
            ws_url: Some(env.ws_url().to_string()),
        }
    }

    /// Resolves from [`ENVIRONMENT_VAR`], falling back to
    /// [`DEFAULT_ENVIRONMENT`] when the variable is unset.
    ///
    /// A value that is not valid UTF-8 is resolved lossily, so it ends up as
    /// an unknown indicator rather than the default.
    pub fn from_env() -> Self {
        Self::from_indicator_value(std::env::var_os(ENVIRONMENT_VAR).as_deref())
    }

    fn from_indicator_value(value: Option<&OsStr>) -> Self {
        match value {
            Some(value) => Self::resolve(&value.to_string_lossy()),
            None => Self::resolve(DEFAULT_ENVIRONMENT),
        }
    }

    /// Returns the indicator this configuration was resolved from.
    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    /// Returns the websocket endpoint, if the indicator was recognised.
    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }

    /// Returns the websocket endpoint or a [`ConfigError::MissingEndpoint`].
    pub fn require_ws_url(&self) -> Result<&str, ConfigError> {
        self.ws_url()
            .ok_or_else(|| ConfigError::MissingEndpoint(self.indicator.clone()))
    }
}

/// Returns the process-wide configuration.
///
/// Resolved from the process environment on first call; later changes to
/// [`ENVIRONMENT_VAR`] are not observed.
pub fn process_config() -> &'static StreamConfig {
    PROCESS_CONFIG.get_or_init(StreamConfig::from_env)
}
