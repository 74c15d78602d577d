// =============================================================================
// Runtime Configuration - gateway settings with atomic save
// =============================================================================
//
// Every tunable the data plane consumes lives here: upstream endpoint and
// credentials, request/keepalive/reconnect timing, downstream listen address,
// and cache capacities.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Environment variables (and a
// `.env` file, loaded in `main`) override whatever the file says.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_endpoint() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

fn default_app_id() -> String {
    "1089".to_string()
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_client_buffer() -> usize {
    256
}

fn default_max_ticks_per_asset() -> usize {
    1_000
}

fn default_max_candles_per_asset() -> usize {
    500
}

fn default_timeframes() -> Vec<u32> {
    vec![60, 300]
}

fn default_assets() -> Vec<String> {
    vec!["R_100".to_string()]
}

// =============================================================================
// UpstreamConfig
// =============================================================================

/// Connection settings for the upstream streaming API.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Application identifier appended to the endpoint as `?app_id=`.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Optional API token. When present the client authorizes after every
    /// (re)connect.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Interval between `{ping: 1}` keepalives.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Deadline for every request/response exchange.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts after an unexpected close before giving up.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

impl UpstreamConfig {
    /// Full WebSocket URL including the app id.
    pub fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.endpoint, sep, self.app_id)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            app_id: default_app_id(),
            api_token: None,
            keepalive_secs: default_keepalive_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

// The token must never reach the logs.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("keepalive_secs", &self.keepalive_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("reconnect_base_delay_ms", &self.reconnect_base_delay_ms)
            .field("reconnect_max_delay_ms", &self.reconnect_max_delay_ms)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .finish()
    }
}

// =============================================================================
// DownstreamConfig
// =============================================================================

/// Listen address and per-client limits for the downstream WebSocket server.
#[derive(Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Frames queued per client before new frames for that client are
    /// dropped.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,

    /// Shared secret expected as `?token=` on the upgrade request.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl DownstreamConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_buffer: default_client_buffer(),
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for DownstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_buffer", &self.client_buffer)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// CacheConfig
// =============================================================================

/// Capacities and timeframes for the market-data cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_ticks_per_asset")]
    pub max_ticks_per_asset: usize,

    #[serde(default = "default_max_candles_per_asset")]
    pub max_candles_per_asset: usize,

    /// Candle widths in seconds tracked for every asset.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<u32>,

    /// When set, evicted candles and ticks are appended to this JSONL file.
    #[serde(default)]
    pub persistence_path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_ticks_per_asset: default_max_ticks_per_asset(),
            max_candles_per_asset: default_max_candles_per_asset(),
            timeframes: default_timeframes(),
            persistence_path: None,
        }
    }
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Top-level configuration for the gateway process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub downstream: DownstreamConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Assets followed as soon as the upstream connection is ready.
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gateway config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse gateway config from {}", path.display()))?;

        info!(
            path = %path.display(),
            endpoint = %config.upstream.endpoint,
            assets = ?config.assets,
            "gateway config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise gateway config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "gateway config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Split out so tests don't
    /// have to mutate the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("GATEWAY_UPSTREAM_URL") {
            self.upstream.endpoint = url;
        }
        if let Some(app_id) = non_empty("DERIV_APP_ID") {
            self.upstream.app_id = app_id;
        }
        if let Some(token) = non_empty("DERIV_API_TOKEN") {
            self.upstream.api_token = Some(token);
        }
        if let Some(host) = non_empty("GATEWAY_HOST") {
            self.downstream.host = host;
        }
        if let Some(port) = non_empty("GATEWAY_PORT") {
            match port.trim().parse() {
                Ok(p) => self.downstream.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid GATEWAY_PORT"),
            }
        }
        if let Some(token) = non_empty("GATEWAY_AUTH_TOKEN") {
            self.downstream.auth_token = Some(token);
        }
        if let Some(assets) = non_empty("GATEWAY_ASSETS") {
            self.assets = assets
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}
