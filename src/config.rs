use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{RelayError, RelayResult};

// Default configuration values
const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 9000;
const DEFAULT_UPSTREAM_ENDPOINT: &str = "wss://chat.example.com";
const DEFAULT_UPSTREAM_PATH: &str = "/socket.io/";
const DEFAULT_HISTORY_CAPACITY: usize = 100;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONFIG_FILE: &str = "roomrelay.json";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Relay HTTP server
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream chat endpoint
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Defaults applied to every session
    #[serde(default)]
    pub session: SessionDefaults,
    /// Play extraction and storage
    #[serde(default)]
    pub plays: PlayConfig,
}

/// Relay HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Whether to enable permissive CORS for browser viewers
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
    /// Number of relay log lines kept for `/api/logs`
    #[serde(default = "default_log_book_size")]
    pub log_book_size: usize,
}

/// Upstream endpoint and the header profile presented to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base `wss://` (or `ws://`) URL of the chat service
    #[serde(default = "default_upstream_endpoint")]
    pub endpoint: String,
    /// Socket.IO mount path
    #[serde(default = "default_upstream_path")]
    pub path: String,
    /// Extra handshake headers (Origin, User-Agent, ...)
    #[serde(default = "default_upstream_headers")]
    pub headers: BTreeMap<String, String>,
    /// Optional Socket.IO auth payload sent with the namespace connect
    #[serde(default)]
    pub auth: Option<Value>,
}

/// Defaults for new sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Display name; random when unset
    #[serde(default = "default_display_name")]
    pub display_name: Option<String>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Per-event debug logging and relay log frames
    #[serde(default = "default_logging_enabled")]
    pub logging_enabled: bool,
    #[serde(default)]
    pub timings: SessionTimings,
}

/// Protocol timings, all in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTimings {
    /// Wait after the transport opens before joining
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wait before the alternate join probes
    #[serde(default = "default_fallback_delay_ms")]
    pub join_fallback_delay_ms: u64,
    /// Wait before the alternate history probes
    #[serde(default = "default_fallback_delay_ms")]
    pub history_fallback_delay_ms: u64,
    /// Connect watchdog
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
}

/// Play extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayConfig {
    /// Whether chat messages are scanned for plays
    #[serde(default = "default_plays_enabled")]
    pub enabled: bool,
    /// Regex with one capture group for the code
    #[serde(default = "default_play_pattern")]
    pub pattern: String,
    /// JSON file to persist plays to; in-memory only when unset
    #[serde(default = "default_play_store_path")]
    pub store_path: Option<PathBuf>,
}

/// Fully resolved configuration of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub room_id: String,
    pub display_name: String,
    pub history_capacity: usize,
    pub max_reconnect_attempts: u32,
    pub logging_enabled: bool,
    pub timings: SessionTimings,
    pub upstream: UpstreamConfig,
}

// Default functions
fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(fallback)
}

fn default_http_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| DEFAULT_HTTP_HOST.to_string())
}

fn default_http_port() -> u16 {
    env_or("RELAY_PORT", DEFAULT_HTTP_PORT)
}

fn default_cors_enabled() -> bool {
    env_or("RELAY_CORS_ENABLED", true)
}

fn default_log_book_size() -> usize {
    env_or("RELAY_LOG_BOOK_SIZE", 500)
}

fn default_upstream_endpoint() -> String {
    std::env::var("RELAY_UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_ENDPOINT.to_string())
}

fn default_upstream_path() -> String {
    std::env::var("RELAY_UPSTREAM_PATH").unwrap_or_else(|_| DEFAULT_UPSTREAM_PATH.to_string())
}

fn default_upstream_headers() -> BTreeMap<String, String> {
    let origin = std::env::var("RELAY_UPSTREAM_ORIGIN").unwrap_or_else(|_| {
        default_upstream_endpoint()
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1)
    });

    let mut headers = BTreeMap::new();
    headers.insert("Origin".to_string(), origin);
    headers.insert(
        "User-Agent".to_string(),
        std::env::var("RELAY_UPSTREAM_USER_AGENT").unwrap_or_else(|_| BROWSER_USER_AGENT.to_string()),
    );
    headers.insert("Accept".to_string(), "*/*".to_string());
    headers.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());
    headers.insert("Cache-Control".to_string(), "no-cache".to_string());
    headers.insert("Pragma".to_string(), "no-cache".to_string());
    headers
}

fn default_display_name() -> Option<String> {
    std::env::var("RELAY_DISPLAY_NAME").ok()
}

fn default_history_capacity() -> usize {
    env_or("RELAY_HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY)
}

fn default_max_reconnect_attempts() -> u32 {
    env_or("RELAY_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS)
}

fn default_logging_enabled() -> bool {
    env_or("RELAY_LOGGING_ENABLED", true)
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_fallback_delay_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    16_000
}

fn default_plays_enabled() -> bool {
    env_or("RELAY_PLAYS_ENABLED", true)
}

fn default_play_pattern() -> String {
    std::env::var("RELAY_PLAY_PATTERN")
        .unwrap_or_else(|_| crate::plays::DEFAULT_PLAY_PATTERN.to_string())
}

fn default_play_store_path() -> Option<PathBuf> {
    std::env::var("RELAY_PLAY_STORE").ok().map(PathBuf::from)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            cors_enabled: default_cors_enabled(),
            log_book_size: default_log_book_size(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upstream_endpoint(),
            path: default_upstream_path(),
            headers: default_upstream_headers(),
            auth: None,
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            history_capacity: default_history_capacity(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            logging_enabled: default_logging_enabled(),
            timings: SessionTimings::default(),
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            join_fallback_delay_ms: default_fallback_delay_ms(),
            history_fallback_delay_ms: default_fallback_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
        }
    }
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            enabled: default_plays_enabled(),
            pattern: default_play_pattern(),
            store_path: default_play_store_path(),
        }
    }
}

impl SessionTimings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn join_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.join_fallback_delay_ms)
    }

    pub fn history_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.history_fallback_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl UpstreamConfig {
    /// Full Engine.IO websocket URL
    pub fn socket_url(&self) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let path = if path.ends_with('/') { path } else { format!("{}/", path) };
        format!("{}{}?EIO=4&transport=websocket", base, path)
    }
}

impl SessionConfig {
    /// Build a session config for a room from the shared defaults
    pub fn for_room(room_id: impl Into<String>, defaults: &SessionDefaults, upstream: &UpstreamConfig) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: defaults
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(random_display_name),
            history_capacity: defaults.history_capacity,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            logging_enabled: defaults.logging_enabled,
            timings: defaults.timings,
            upstream: upstream.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> RelayResult<()> {
        if self.room_id.trim().is_empty() {
            return Err(RelayError::config_invalid("room_id", "room id cannot be empty"));
        }
        if self.history_capacity == 0 {
            return Err(RelayError::config_invalid(
                "history_capacity",
                "history capacity must be greater than zero",
            ));
        }
        if self.timings.reconnect_base_ms == 0 {
            return Err(RelayError::config_invalid(
                "reconnect_base_ms",
                "reconnect base delay must be greater than zero",
            ));
        }
        if !(self.upstream.endpoint.starts_with("ws://") || self.upstream.endpoint.starts_with("wss://")) {
            return Err(RelayError::config_invalid(
                "upstream.endpoint",
                format!("'{}' is not a ws:// or wss:// URL", self.upstream.endpoint),
            ));
        }
        Ok(())
    }
}

/// Random guest name used when no display name is configured
pub fn random_display_name() -> String {
    format!("Guest{}", fastrand::u32(1000..10000))
}

/// Load the application configuration
pub async fn load_config() -> Result<AppConfig> {
    let path = get_config_path();
    load_or_create_config(&path).await
}

/// Get the path to the configuration file
fn get_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load configuration from file or create default
pub async fn load_or_create_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let default_config = AppConfig::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: AppConfig = serde_json::from_str(&config_str)?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved configuration to {}", path.display());

    Ok(())
}
