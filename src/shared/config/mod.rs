//! Application configuration module
//!
//! Provides the configuration types for the realtime client: where the REST
//! backend and the broker live, and how aggressively to reconnect.
//!
//! Configuration is layered: compiled defaults, then an optional TOML file,
//! then environment variables (`CAMPUS_BACKEND_URL`, `CAMPUS_WS_URL`).
//!
//! ```toml
//! backend_url = "https://campus.example.edu/api"
//! settle_delay_ms = 100
//!
//! [reconnect]
//! max_attempts = 10
//! base_delay_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default REST base URL
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080/api";

/// Raw WebSocket transport of the broker's SockJS endpoint `/ws`
pub const DEFAULT_SESSION_PATH: &str = "/ws/websocket";

/// Broadcast destination prefix for project conversations
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/project/";

const ENV_BACKEND_URL: &str = "CAMPUS_BACKEND_URL";
const ENV_WS_URL: &str = "CAMPUS_WS_URL";

/// Reconnection tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected session loss
    pub auto_reconnect: bool,
    /// Attempts before giving up with a terminal error
    pub max_attempts: u32,
    /// Delay of the first retry
    pub base_delay_ms: u64,
    /// Upper bound of the exponential part
    pub max_delay_ms: u64,
    /// Jitter is drawn uniformly from `[0, max_jitter_ms)`
    pub max_jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 1000,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// REST base URL, e.g. `http://localhost:8080/api`
    pub backend_url: String,
    /// Explicit broker URL; derived from `backend_url` when absent
    pub ws_url: Option<String>,
    /// Path of the session endpoint appended to the derived broker URL
    pub session_path: String,
    /// Topic prefix; a conversation's topic is `prefix + id`
    pub topic_prefix: String,
    /// Pause between subscription replay and the connected notification
    pub settle_delay_ms: u64,
    /// Heart-beat we offer to send
    pub heartbeat_outgoing_ms: u64,
    /// Heart-beat we ask the broker to send
    pub heartbeat_incoming_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            ws_url: None,
            session_path: DEFAULT_SESSION_PATH.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            settle_delay_ms: 100,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// `<config dir>/campus-chat/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("campus-chat").join("config.toml"))
    }

    /// Defaults, overlaid by the default file if it exists, then by the environment
    pub fn load_layered() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!("[CONFIG] Loading {}", path.display());
                Self::load(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override URLs from `CAMPUS_BACKEND_URL` / `CAMPUS_WS_URL`
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_BACKEND_URL) {
            if !url.trim().is_empty() {
                self.backend_url = url;
            }
        }
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            if !url.trim().is_empty() {
                self.ws_url = Some(url);
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.backend_url, e)))?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "backend_url must be http or https: {}",
                self.backend_url
            )));
        }
        if let Some(ws_url) = &self.ws_url {
            let ws = Url::parse(ws_url)
                .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", ws_url, e)))?;
            if !matches!(ws.scheme(), "ws" | "wss") {
                return Err(ConfigError::InvalidUrl(format!(
                    "ws_url must be ws or wss: {}",
                    ws_url
                )));
            }
        }
        if !self.session_path.starts_with('/') {
            return Err(ConfigError::invalid("session_path", "must start with '/'"));
        }
        if self.topic_prefix.is_empty() {
            return Err(ConfigError::MissingValue("topic_prefix"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Broker URL: the explicit override, or `backend_url` without its `/api`
    /// suffix, with `http→ws` / `https→wss` and the session path appended
    pub fn broker_url(&self) -> Result<String, ConfigError> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }

        let base = self.backend_url.trim_end_matches('/');
        let base = base.strip_suffix("/api").unwrap_or(base);

        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(ConfigError::InvalidUrl(self.backend_url.clone()));
        };

        Ok(format!("{}{}", base, self.session_path))
    }

    /// Full URL of a REST endpoint
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.backend_url.trim_end_matches('/'), path)
    }

    /// Host part of the broker URL, used for the STOMP `host` header
    pub fn broker_host(&self) -> String {
        self.broker_url()
            .ok()
            .and_then(|url| Url::parse(&url).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    /// Set the REST base URL
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into();
        self
    }

    /// Set an explicit broker URL
    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.config.ws_url = Some(url.into());
        self
    }

    pub fn session_path(mut self, path: impl Into<String>) -> Self {
        self.config.session_path = path.into();
        self
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.topic_prefix = prefix.into();
        self
    }

    pub fn settle_delay_ms(mut self, millis: u64) -> Self {
        self.config.settle_delay_ms = millis;
        self
    }

    /// Heart-beat offer, `0` disables a direction
    pub fn heartbeat_ms(mut self, outgoing: u64, incoming: u64) -> Self {
        self.config.heartbeat_outgoing_ms = outgoing;
        self.config.heartbeat_incoming_ms = incoming;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.auto_reconnect = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: &'static str },
    #[error("could not read config: {0}")]
    Io(String),
    #[error("could not parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &'static str, message: &'static str) -> Self {
        Self::Invalid { field, message }
    }
}
