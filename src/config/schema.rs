//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS, timeouts).
    pub listener: ListenerConfig,

    /// API namespace, allow-list and static assets.
    pub api: ApiConfig,

    /// Filter chain stage descriptors.
    pub filters: Vec<StageConfig>,

    /// Hidden-service relay settings.
    pub relay: RelayConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            api: ApiConfig::default(),
            filters: vec![StageConfig::Rewrite(RewriteConfig::default())],
            relay: RelayConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Cipher suites excluded by default. A configured `excluded_cipher_suites`
/// list replaces this one.
pub const DEFAULT_EXCLUDED_CIPHER_SUITES: &[&str] = &[
    "SSL_RSA_WITH_DES_CBC_SHA",
    "SSL_DHE_RSA_WITH_DES_CBC_SHA",
    "SSL_DHE_DSS_WITH_DES_CBC_SHA",
    "SSL_RSA_EXPORT_WITH_RC4_40_MD5",
    "SSL_RSA_EXPORT_WITH_DES40_CBC_SHA",
    "SSL_DHE_RSA_EXPORT_WITH_DES40_CBC_SHA",
    "SSL_DHE_DSS_EXPORT_WITH_DES40_CBC_SHA",
];

/// Protocol versions excluded by default, replaced the same way.
pub const DEFAULT_EXCLUDED_PROTOCOLS: &[&str] = &["SSLv3"];

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host name or address to bind.
    pub host: String,

    /// Port to bind (1-65535).
    pub port: u16,

    /// Terminate TLS on this listener.
    pub tls_enabled: bool,

    /// PEM bundle holding the certificate chain and private key.
    pub tls_keystore_path: String,

    /// Keystore password. PEM keystores must hold an unencrypted key.
    pub tls_keystore_password: String,

    /// Cipher suite names removed from the TLS context.
    pub excluded_cipher_suites: BTreeSet<String>,

    /// Protocol version names removed from the TLS context.
    pub excluded_protocols: BTreeSet<String>,

    /// Idle connection timeout in milliseconds (0 disables).
    pub idle_timeout_millis: u64,

    /// Set SO_REUSEADDR before binding.
    pub reuse_address: bool,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long in-flight connections may drain on shutdown.
    pub shutdown_grace_millis: u64,
}

impl ListenerConfig {
    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_millis > 0).then(|| Duration::from_millis(self.idle_timeout_millis))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8125,
            tls_enabled: false,
            tls_keystore_path: String::new(),
            tls_keystore_password: String::new(),
            excluded_cipher_suites: DEFAULT_EXCLUDED_CIPHER_SUITES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_protocols: DEFAULT_EXCLUDED_PROTOCOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            idle_timeout_millis: 30_000,
            reuse_address: true,
            max_connections: 10_000,
            shutdown_grace_millis: 5_000,
        }
    }
}

/// API namespace configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Mount the API and diagnostic routes.
    pub enabled: bool,

    /// API namespace prefix.
    pub path: String,

    /// Diagnostic variant of the API namespace.
    pub test_path: String,

    /// Addresses, subnets or host names allowed to call the API. `*` allows everyone.
    pub allowed_hosts: Vec<String>,

    /// Static asset root. No static files are served when unset.
    pub ui_dir: Option<PathBuf>,

    /// File served for directory requests.
    pub welcome_file: String,
}

impl ApiConfig {
    /// Path prefixes reserved for the API namespace.
    pub fn reserved_prefixes(&self) -> Vec<String> {
        vec![self.path.clone(), self.test_path.clone()]
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/burst".to_string(),
            test_path: "/test".to_string(),
            allowed_hosts: vec![
                "127.0.0.1".to_string(),
                "localhost".to_string(),
                "[0:0:0:0:0:0:0:1]".to_string(),
            ],
            ui_dir: None,
            welcome_file: "index.html".to_string(),
        }
    }
}

/// Kind of a filter chain stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Rewrite,
    RateLimit,
    Gzip,
}

impl StageKind {
    /// Position of the stage in the chain; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            StageKind::Rewrite => 0,
            StageKind::RateLimit => 1,
            StageKind::Gzip => 2,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Rewrite => "rewrite",
            StageKind::RateLimit => "rate_limit",
            StageKind::Gzip => "gzip",
        };
        f.write_str(name)
    }
}

/// A filter chain stage descriptor.
///
/// ```toml
/// [[filters]]
/// kind = "rate_limit"
/// max_requests_per_second = 25
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Rewrite(RewriteConfig),
    RateLimit(RateLimitConfig),
    Gzip(GzipConfig),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Rewrite(_) => StageKind::Rewrite,
            StageConfig::RateLimit(_) => StageKind::RateLimit,
            StageConfig::Gzip(_) => StageKind::Gzip,
        }
    }
}

/// Single-page-app fallback rewrite.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Prefixes never rewritten. Empty means the API and diagnostic prefixes.
    pub reserved_prefixes: Vec<String>,
}

/// Rate limiting (denial-of-service filter) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second admitted per client before throttling.
    pub max_requests_per_second: u32,

    /// Over-limit requests that may wait at the same time.
    pub throttled_request_queue_depth: usize,

    /// Delay between admission retries; negative rejects over-limit requests at once.
    pub delay_millis: i64,

    /// Total wait after which a throttled request is rejected.
    pub max_wait_millis: u64,

    /// Requests running longer than this are aborted (0 disables).
    pub max_request_duration_millis: u64,

    /// Clients that bypass throttling entirely.
    pub ip_allow_list: Vec<String>,

    /// Identify clients by session cookie rather than address.
    pub track_sessions: bool,

    /// Cookie carrying the session identity.
    pub session_cookie: String,

    /// Include the client port in its identity.
    pub remote_port: bool,

    /// Annotate delayed responses with `x-ratelimit-delayed-ms`.
    pub insert_headers: bool,

    /// Trackers unused for this long are evicted.
    pub max_idle_tracker_millis: u64,

    /// Only throttle the API namespace.
    pub api_only: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 25,
            throttled_request_queue_depth: 5,
            delay_millis: 100,
            max_wait_millis: 1_000,
            max_request_duration_millis: 30_000,
            ip_allow_list: Vec::new(),
            track_sessions: false,
            session_cookie: "session".to_string(),
            remote_port: false,
            insert_headers: true,
            max_idle_tracker_millis: 30_000,
            api_only: true,
        }
    }
}

/// Response compression configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GzipConfig {
    /// Request methods whose responses may be compressed.
    pub methods: Vec<String>,

    /// Responses smaller than this are sent as-is.
    pub min_size_bytes: u16,

    /// Upper bound on inflated request bodies (0 disables request inflation).
    pub inflate_buffer_bytes: usize,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            methods: vec!["GET".to_string(), "POST".to_string()],
            min_size_bytes: 1024,
            inflate_buffer_bytes: 0,
        }
    }
}

/// Overlay implementation backing the hidden relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    /// Spawn a `tor` process publishing a hidden service.
    Tor,
    /// Bind the hidden listener on loopback without any overlay.
    Loopback,
}

/// Hidden-service relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bootstrap the overlay and run the relay.
    pub enabled: bool,

    pub overlay: OverlayKind,

    /// Overlay working directory.
    pub data_dir: PathBuf,

    /// Overlay binary (tor only).
    pub tor_binary: PathBuf,

    /// Hidden service identifier (directory name under `data_dir`).
    pub service_id: String,

    /// Local port the overlay delivers hidden-service connections to.
    pub listen_port: u16,

    /// Port advertised on the hidden service. Defaults to the gateway port.
    pub hidden_port: Option<u16>,

    /// Concurrent session cap.
    pub max_sessions: usize,

    /// Sessions without traffic for this long are closed (0 disables).
    pub idle_timeout_millis: u64,

    /// Client-to-gateway pump buffer.
    pub upload_buffer_bytes: usize,

    /// Gateway-to-client pump buffer.
    pub download_buffer_bytes: usize,

    /// How long sessions may drain on shutdown before being closed.
    pub drain_grace_millis: u64,
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_millis > 0).then(|| Duration::from_millis(self.idle_timeout_millis))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_millis)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            overlay: OverlayKind::Tor,
            data_dir: PathBuf::from("tor"),
            tor_binary: PathBuf::from("tor"),
            service_id: "burst".to_string(),
            listen_port: 8126,
            hidden_port: None,
            max_sessions: 256,
            idle_timeout_millis: 300_000,
            upload_buffer_bytes: 1024,
            download_buffer_bytes: 4096,
            drain_grace_millis: 5_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
