//! Server configuration.
//!
//! Loaded from the YAML file named by `LANTERN_CONFIG`, falling back to
//! defaults for anything missing. `LISTEN` overrides the plain HTTP
//! listen address.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::http::connection::ConnectionConfig;
use crate::websocket::WebSocketConfig;

pub const CONFIG_PATH_ENV: &str = "LANTERN_CONFIG";
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub static_files: StaticFilesConfig,
    pub compression: CompressionConfig,
    pub websocket: WebSocketSettings,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Sockets beyond this many concurrently active get a 503.
    pub max_connections: usize,
    pub keep_alive_timeout_secs: u64,
    pub max_request_size: usize,
    /// Handler pool size. Zero means one per available core.
    pub worker_threads: usize,
    /// Per-request access log.
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_connections: 1000,
            keep_alive_timeout_secs: 30,
            max_request_size: 1024 * 1024,
            worker_threads: 0,
            enable_logging: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA bundle used to verify client certificates.
    pub ca_file: Option<PathBuf>,
    /// Reject clients that present no certificate.
    pub verify_client: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:8443".to_string(),
            cert_file: PathBuf::from("server.crt"),
            key_file: PathBuf::from("server.key"),
            ca_file: None,
            verify_client: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StaticFilesConfig {
    pub enabled: bool,
    pub document_root: PathBuf,
    pub index_files: Vec<String>,
}

impl Default for StaticFilesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            document_root: PathBuf::from("./public"),
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Bodies smaller than this are sent as is.
    pub min_size: usize,
    /// gzip level, 0 through 9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: crate::http::compression::DEFAULT_MIN_SIZE,
            level: crate::http::compression::DEFAULT_LEVEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            idle_timeout_secs: 60,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    #[default]
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    /// Served by the token bucket.
    LeakyBucket,
}

/// Which part of a request identifies the client being limited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExtractor {
    #[default]
    IpAddress,
    UserId,
    ApiKey,
    IpAndUserAgent,
    EndpointPath,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub strategy: RateLimitStrategy,
    pub max_requests: u64,
    pub window_secs: u64,
    /// Token bucket capacity.
    pub burst_capacity: u64,
    pub key_extractor: KeyExtractor,
    pub cleanup_interval_secs: u64,
    /// Keys untouched for this long are forgotten by the cleanup sweep.
    pub idle_expiry_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::TokenBucket,
            max_requests: 100,
            window_secs: 60,
            burst_capacity: 10,
            key_extractor: KeyExtractor::IpAddress,
            cleanup_interval_secs: 300,
            idle_expiry_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

impl Config {
    /// Loads the file named by `LANTERN_CONFIG` (defaults when unset), then
    /// applies the `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            cfg.server.listen_addr = listen;
        }
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.compression.level <= 9,
            "compression.level must be between 0 and 9, got {}",
            self.compression.level
        );
        anyhow::ensure!(self.server.max_connections > 0, "server.max_connections must be positive");
        anyhow::ensure!(self.server.max_request_size > 0, "server.max_request_size must be positive");
        anyhow::ensure!(
            self.websocket.ping_interval_secs > 0,
            "websocket.ping_interval_secs must be positive"
        );
        anyhow::ensure!(
            !self.tls.verify_client || self.tls.ca_file.is_some(),
            "tls.verify_client requires tls.ca_file"
        );
        Ok(())
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.server.keep_alive_timeout_secs)
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            ping_interval: Duration::from_secs(self.websocket.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.websocket.idle_timeout_secs),
            max_message_size: self.websocket.max_message_size,
            ..WebSocketConfig::default()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_timeout: self.keep_alive_timeout(),
            max_request_size: self.server.max_request_size,
            log_requests: self.server.enable_logging,
            websocket: self.websocket_config(),
        }
    }

    /// Worker pool size, resolving zero to the core count.
    pub fn worker_threads(&self) -> usize {
        match self.server.worker_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        }
    }
}
