//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML file at
//! `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8080"
//! request_timeout_ms = 30000
//!
//! [auth]
//! bootstrap_paths = ["/api/v1/auths/signin", "/api/v1/auths/signup"]
//! refresh_path = "/api/v1/auths/refresh"
//! api_key_header = "X-API-Key"
//!
//! [streaming]
//! default_idle_timeout_ms = 30000
//! channel_capacity = 256
//!
//! [daemon]
//! socket_path = "/run/user/1000/relay/relay.sock"
//! max_connections = 64
//!
//! [credentials]
//! path = "/home/user/.local/share/relay/credentials.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::{AuthEndpoints, DEFAULT_API_KEY_HEADER};
use crate::streaming::StreamSettings;
use crate::transport::unix_socket::default_socket_path;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from (highest-priority layer applied)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Base URL of the remote API
    pub base_url: Option<String>,
    /// Timeout for non-streaming requests in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// User-Agent sent upstream
    pub user_agent: Option<String>,
}

/// `[auth]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthToml {
    /// Login/token endpoints that never carry credentials
    pub bootstrap_paths: Option<Vec<String>>,
    /// Token refresh endpoint
    pub refresh_path: Option<String>,
    /// Header carrying static API keys
    pub api_key_header: Option<String>,
}

/// `[streaming]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Idle timeout when a stream request carries none
    pub default_idle_timeout_ms: Option<u64>,
    /// Per-session event channel capacity
    pub channel_capacity: Option<usize>,
}

/// `[daemon]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Unix socket path for surfaces
    pub socket_path: Option<String>,
    /// Maximum simultaneously connected surfaces
    pub max_connections: Option<usize>,
}

/// `[credentials]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsToml {
    /// Credential file; omit to keep credentials in memory only
    pub path: Option<String>,
    /// Keep credentials in memory even if a path is configured
    pub in_memory: Option<bool>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Remote API
    pub server: ServerToml,
    /// Auth endpoints
    pub auth: AuthToml,
    /// Stream sessions
    pub streaming: StreamingToml,
    /// Daemon process
    pub daemon: DaemonToml,
    /// Credential persistence
    pub credentials: CredentialsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Base URL of the remote API
    pub base_url: String,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
    /// User-Agent sent upstream
    pub user_agent: String,
    /// Login/token endpoints that never carry credentials
    pub bootstrap_paths: Vec<String>,
    /// Token refresh endpoint
    pub refresh_path: String,
    /// Header carrying static API keys
    pub api_key_header: String,
    /// Idle timeout when a stream request carries none
    pub default_idle_timeout: Duration,
    /// Per-session event channel capacity
    pub channel_capacity: usize,
    /// Unix socket path for surfaces
    pub socket_path: PathBuf,
    /// Maximum simultaneously connected surfaces
    pub max_connections: usize,
    /// Credential file (`None` keeps credentials in memory)
    pub credentials_path: Option<PathBuf>,
    /// Config file that was loaded, if any
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("relay/{}", env!("CARGO_PKG_VERSION")),
            bootstrap_paths: vec![
                "/api/v1/auths/signin".to_string(),
                "/api/v1/auths/signup".to_string(),
            ],
            refresh_path: "/api/v1/auths/refresh".to_string(),
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            default_idle_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            socket_path: default_socket_path(),
            max_connections: 64,
            credentials_path: default_credentials_path(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the configuration source
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would otherwise fail later at runtime
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must start with http:// or https://, got {:?}",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_idle_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "default_idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !self.refresh_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "refresh_path must start with '/', got {:?}",
                self.refresh_path
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        self.api_key_header_name()?;
        Ok(())
    }

    fn api_key_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.api_key_header.as_bytes()).map_err(|_| {
            ConfigError::ValidationError(format!(
                "api_key_header is not a valid header name: {:?}",
                self.api_key_header
            ))
        })
    }

    /// Auth endpoint policy derived from this configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an invalid API-key header.
    pub fn auth_endpoints(&self) -> Result<AuthEndpoints, ConfigError> {
        Ok(AuthEndpoints::new(
            self.bootstrap_paths.iter().cloned(),
            self.refresh_path.clone(),
            self.api_key_header_name()?,
        ))
    }

    /// Stream settings derived from this configuration
    #[must_use]
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            default_idle_timeout: self.default_idle_timeout,
            channel_capacity: self.channel_capacity,
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Get the default credential file path
#[must_use]
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("relay").join("credentials.json"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path.as_deref(), |key| std::env::var(key).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed.
pub fn load_config_with_env(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);

    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(ref url) = toml.server.base_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(ms) = toml.server.request_timeout_ms {
        config.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ref agent) = toml.server.user_agent {
        config.user_agent = agent.clone();
    }

    if let Some(ref paths) = toml.auth.bootstrap_paths {
        config.bootstrap_paths = paths.clone();
    }
    if let Some(ref path) = toml.auth.refresh_path {
        config.refresh_path = path.clone();
    }
    if let Some(ref header) = toml.auth.api_key_header {
        config.api_key_header = header.clone();
    }

    if let Some(ms) = toml.streaming.default_idle_timeout_ms {
        config.default_idle_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.streaming.channel_capacity {
        config.channel_capacity = capacity;
    }

    if let Some(ref path) = toml.daemon.socket_path {
        config.socket_path = PathBuf::from(path);
    }
    if let Some(max) = toml.daemon.max_connections {
        config.max_connections = max;
    }

    if let Some(ref path) = toml.credentials.path {
        config.credentials_path = Some(PathBuf::from(path));
    }
    if toml.credentials.in_memory == Some(true) {
        config.credentials_path = None;
    }
}

fn apply_env_config(config: &mut RelayConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(url) = env("RELAY_BASE_URL") {
        config.base_url = url.trim_end_matches('/').to_string();
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("RELAY_REQUEST_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.request_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(path) = env("RELAY_REFRESH_PATH") {
        config.refresh_path = path;
        config.source = ConfigSource::Env;
    }
    if let Some(header) = env("RELAY_API_KEY_HEADER") {
        config.api_key_header = header;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("RELAY_STREAM_IDLE_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.default_idle_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(path) = env("RELAY_SOCKET") {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env("RELAY_MAX_CONNECTIONS") {
        if let Ok(n) = max.parse::<usize>() {
            config.max_connections = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(path) = env("RELAY_CREDENTIALS_PATH") {
        config.credentials_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Credential file override
    pub credentials_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set credential file override
    #[must_use]
    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = Some(path);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.socket_path.is_some() || self.base_url.is_some() || self.credentials_path.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(ref url) = self.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ref path) = self.credentials_path {
            config.credentials_path = Some(path.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
