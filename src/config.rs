//! Gateway configuration
//!
//! One app-level file describes the whole gateway; it may reference optional
//! frontend and backend files which are merged over the corresponding
//! sections. The format is chosen by extension (`.json` or `.toml`).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Core proxy engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyEngineConfig {
    /// Response flush interval in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Copy buffer size in bytes
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    /// Transport selection: "standard" (pooled) or "fast" (single-shot)
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_max_conns_per_host")]
    pub max_conns_per_host: usize,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: u64,
}

fn default_flush_interval() -> u64 {
    100
}
fn default_buf_size() -> usize {
    32 * 1024
}
fn default_transport() -> String {
    "standard".to_string()
}
fn default_max_conns_per_host() -> usize {
    50
}
fn default_max_idle_per_host() -> usize {
    20
}
fn default_idle_conn_timeout() -> u64 {
    90
}

impl Default for ProxyEngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            buf_size: default_buf_size(),
            transport: default_transport(),
            max_conns_per_host: default_max_conns_per_host(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_conn_timeout: default_idle_conn_timeout(),
        }
    }
}

/// One listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_http2: bool,
    /// "http" or "https"
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum request body in bytes; 0 disables the check
    #[serde(default = "default_max_request_body")]
    pub max_request_body: u64,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_read_header_timeout")]
    pub read_header_timeout: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_protocol() -> String {
    "http".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_request_body() -> u64 {
    32 * 1024 * 1024
}
fn default_read_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_read_header_timeout() -> u64 {
    10
}
fn default_max_header_bytes() -> usize {
    5 << 20
}

/// TLS files for a listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsFileConfig {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub auto_tls: bool,
    /// Named certificate groups for SNI selection
    #[serde(default)]
    pub cert_map: HashMap<String, CertConfig>,
}

/// One certificate group: the cert pair serves every listed domain.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CertConfig {
    pub domains: Vec<String>,
    pub cert_file: String,
    pub key_file: String,
}

/// Domain binding for a listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DomainConfig {
    pub domains: Vec<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub auto_redirect: bool,
    /// HSTS max-age in seconds, 0 = no HSTS header on redirects
    #[serde(default)]
    pub hsts_max_age: u64,
    #[serde(default)]
    pub hsts_subdomains: bool,
    #[serde(default)]
    pub hsts_preload: bool,
}

// ── middleware ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub sanitizer: ToggleConfig,
    #[serde(default)]
    pub domain_check: ToggleConfig,
    #[serde(default)]
    pub image_protect: ToggleConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToggleConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: Vec<String>,
    #[serde(default)]
    pub origin: Vec<String>,
    #[serde(default)]
    pub header: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_trace_header")]
    pub trace_id: String,
}

fn default_trace_header() -> String {
    "X-Trace-Id".to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_id: default_trace_header(),
        }
    }
}

// ── features ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub http3: Http3Config,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gzip: GzipConfig,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub secure_header: bool,
    #[serde(default)]
    pub auto_cert: AutoCertConfig,
    #[serde(default)]
    pub grpc_proxy: GrpcProxyConfig,
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    #[serde(rename = "break", default)]
    pub breaker: BreakConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Http3Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub keep_alive: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebSocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub pong_timeout: u64,
    #[serde(default)]
    pub max_message_size: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub strategy: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GzipConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gzip_level")]
    pub level: u32,
    /// MIME main types eligible for compression
    #[serde(default = "default_gzip_types")]
    pub types: Vec<String>,
    /// Minimum payload size in bytes before compression kicks in
    #[serde(default = "default_gzip_threshold")]
    pub threshold: usize,
    /// Payloads above this go to the async worker pool
    #[serde(default = "default_gzip_async_threshold")]
    pub async_threshold: usize,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    /// Compression cache TTL in seconds
    #[serde(default = "default_gzip_cache_ttl")]
    pub cache_ttl: u64,
}

fn default_gzip_level() -> u32 {
    6
}
fn default_gzip_types() -> Vec<String> {
    ["text", "application", "font"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_gzip_threshold() -> usize {
    1024
}
fn default_gzip_async_threshold() -> usize {
    100 * 1024
}
fn default_gzip_cache_ttl() -> u64 {
    300
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_gzip_level(),
            types: default_gzip_types(),
            threshold: default_gzip_threshold(),
            async_threshold: default_gzip_async_threshold(),
            cache_enabled: true,
            cache_ttl: default_gzip_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoCertConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_acme_directory")]
    pub directory_url: String,
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

impl Default for AutoCertConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            domains: Vec::new(),
            directory_url: default_acme_directory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrpcProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Whitelisted upstream hosts (exact or host-only match)
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_grpc_header")]
    pub grpc_header: String,
    #[serde(default = "default_grpc_addr_header")]
    pub grpc_addr: String,
}

fn default_grpc_header() -> String {
    "X-Grpc-Proxy".to_string()
}
fn default_grpc_addr_header() -> String {
    "X-Grpc-Addr".to_string()
}

impl Default for GrpcProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            grpc_header: default_grpc_header(),
            grpc_addr: default_grpc_addr_header(),
        }
    }
}

// ── flow control ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowControlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub global_limit: RateLimit,
    #[serde(default)]
    pub rules: Vec<FlowControlRule>,
    #[serde(default)]
    pub recording: FlowRecordConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowControlRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Smaller number = higher priority
    #[serde(default)]
    pub priority: i32,
    /// "host", "header" or "ip"
    pub match_type: String,
    pub match_value: String,
    #[serde(default)]
    pub header_key: String,
    #[serde(default)]
    pub limits: Vec<RateLimit>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimit {
    #[serde(default = "default_rate_requests")]
    pub requests: u32,
    /// Window like "1s", "10min", or a bare number interpreted via `unit`
    #[serde(default = "default_rate_window")]
    pub window: String,
    #[serde(default = "default_rate_unit")]
    pub unit: String,
    /// "sliding", "fixed", "leaky" or "token"
    #[serde(default = "default_rate_mode")]
    pub mode: String,
}

fn default_rate_requests() -> u32 {
    100
}
fn default_rate_window() -> String {
    "1s".to_string()
}
fn default_rate_unit() -> String {
    "s".to_string()
}
fn default_rate_mode() -> String {
    "sliding".to_string()
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests: default_rate_requests(),
            window: default_rate_window(),
            unit: default_rate_unit(),
            mode: default_rate_mode(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlowRecordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub record_blocked: bool,
    #[serde(default)]
    pub record_allowed: bool,
    #[serde(default)]
    pub storage_type: String,
    #[serde(default)]
    pub retention_period: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakConfig {
    #[serde(default = "default_break_bucket")]
    pub bucket: usize,
    #[serde(default = "default_break_max_error")]
    pub max_error: usize,
    /// Reset period in seconds
    #[serde(default = "default_break_reset")]
    pub reset: u64,
}

fn default_break_bucket() -> usize {
    10
}
fn default_break_max_error() -> usize {
    5
}
fn default_break_reset() -> u64 {
    60
}

impl Default for BreakConfig {
    fn default() -> Self {
        Self {
            bucket: default_break_bucket(),
            max_error: default_break_max_error(),
            reset: default_break_reset(),
        }
    }
}

// ── database / security / headers / misc ─────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub mongo: MongoConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MongoConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InfluxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub allow_ips: Vec<String>,
    #[serde(default)]
    pub deny_ips: Vec<String>,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub hsts_subdomain: bool,
    #[serde(default)]
    pub hsts_preload: bool,
    #[serde(default)]
    pub xss_protection: bool,
    #[serde(default)]
    pub iframe_protection: bool,
    #[serde(default)]
    pub same_site: bool,
    #[serde(default)]
    pub image_protect: ImageProtectConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageProtectConfig {
    #[serde(default)]
    pub image_type: Vec<String>,
    #[serde(default)]
    pub allow_referer: Vec<String>,
}

/// Names of the reserved proxy headers written on outbound requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyHeaderConfig {
    #[serde(default = "default_trace_header")]
    pub trace_id: String,
    /// Carries the original client-facing host to the upstream
    #[serde(default = "default_forward_host_header")]
    pub frontend_host_header: String,
    /// Marks requests routed to a backend service
    #[serde(default = "default_backend_header")]
    pub backend_header: String,
    /// Names the service the request was proxied to
    #[serde(default = "default_proxy_app_header")]
    pub proxy_app: String,
}

fn default_forward_host_header() -> String {
    "X-Forward-Host".to_string()
}
fn default_backend_header() -> String {
    "X-Hamburger-Backend".to_string()
}
fn default_proxy_app_header() -> String {
    "X-Hamburger-App".to_string()
}

impl Default for ProxyHeaderConfig {
    fn default() -> Self {
        Self {
            trace_id: default_trace_header(),
            frontend_host_header: default_forward_host_header(),
            backend_header: default_backend_header(),
            proxy_app: default_proxy_app_header(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: String::new(),
            color: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleConfig {
    pub name: String,
    pub path: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub enable_stat: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub db_file: String,
    #[serde(default)]
    pub sync_duration: u64,
    #[serde(default)]
    pub save_duration: u64,
}

/// Background refresh cadences in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncerConfig {
    #[serde(default = "default_sync_secs")]
    pub job_sync_domains_map: u64,
    #[serde(default = "default_sync_secs")]
    pub job_sync_domain_ports: u64,
}

fn default_sync_secs() -> u64 {
    3600
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            job_sync_domains_map: default_sync_secs(),
            job_sync_domain_ports: default_sync_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PprofConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub port: u16,
}

// ── frontend / backend services ──────────────────────────────────

/// One API forwarding rule inside a frontend service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiBackendConfig {
    /// Path prefix to match
    pub api: String,
    /// Backend service name
    pub service: String,
    #[serde(default)]
    pub use_rewrite: bool,
    #[serde(default)]
    pub rewrite: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FrontServerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub backends: Vec<ApiBackendConfig>,
}

/// The static-asset frontend server this gateway forwards to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PxyFrontendConfig {
    #[serde(default = "default_frontend_host")]
    pub host: String,
    #[serde(default = "default_frontend_port")]
    pub port: u16,
    /// Header tagging the request with the frontend service name
    #[serde(default = "default_internal_flag")]
    pub internal_flag: String,
    #[serde(default)]
    pub servers: Vec<FrontServerConfig>,
}

fn default_frontend_host() -> String {
    "127.0.0.1".to_string()
}
fn default_frontend_port() -> u16 {
    8030
}
fn default_internal_flag() -> String {
    "X-Hamburger-Internal".to_string()
}

impl Default for PxyFrontendConfig {
    fn default() -> Self {
        Self {
            host: default_frontend_host(),
            port: default_frontend_port(),
            internal_flag: default_internal_flag(),
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PxyBackendConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<BackendServerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendServerConfig {
    pub service_name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CustomServiceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub services: Vec<BackendServerConfig>,
}

// ── root ─────────────────────────────────────────────────────────

/// Merged gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Optional file overriding `pxy_backend`
    #[serde(default)]
    pub pxy_backend_file: String,
    /// Optional file overriding `pxy_frontend`
    #[serde(default)]
    pub pxy_frontend_file: String,
    /// Domain → service map file consumed by the topology loader
    #[serde(default)]
    pub domain_map: String,

    #[serde(default)]
    pub proxy: ProxyEngineConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub proxy_header: ProxyHeaderConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub module: Vec<ModuleConfig>,
    #[serde(default)]
    pub stat: StatConfig,
    #[serde(default)]
    pub custom_header: HashMap<String, String>,
    #[serde(default)]
    pub syncer: SyncerConfig,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub pprof: PprofConfig,
    #[serde(default)]
    pub max_cores: usize,
    #[serde(default)]
    pub pxy_backend: PxyBackendConfig,
    #[serde(default)]
    pub pxy_frontend: PxyFrontendConfig,
    #[serde(default)]
    pub pxy_custom_service: CustomServiceConfig,
}

impl Config {
    /// Load the app-level file and merge any referenced frontend/backend
    /// files over it.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = parse_file(path)?;

        if !config.pxy_frontend_file.is_empty() {
            let sub: FrontendFile = parse_file(Path::new(&config.pxy_frontend_file))
                .with_context(|| format!("frontend config {}", config.pxy_frontend_file))?;
            config.pxy_frontend = sub.pxy_frontend;
        }
        if !config.pxy_backend_file.is_empty() {
            let sub: BackendFile = parse_file(Path::new(&config.pxy_backend_file))
                .with_context(|| format!("backend config {}", config.pxy_backend_file))?;
            config.pxy_backend = sub.pxy_backend;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for server in &self.servers {
            if server.port == 0 {
                bail!("server {} has no listen port", server.name);
            }
            match server.protocol.as_str() {
                "http" | "https" => {}
                other => bail!("server {}: unknown protocol {other:?}", server.name),
            }
            if server.protocol == "https" && server.tls.is_none() {
                bail!("server {} is https but has no tls section", server.name);
            }
        }
        match self.proxy.transport.as_str() {
            "standard" | "fast" => {}
            other => bail!("unknown transport {other:?} (expected standard|fast)"),
        }
        for rule in &self.features.flow_control.rules {
            match rule.match_type.as_str() {
                "host" | "header" | "ip" => {}
                other => bail!("flow rule {}: unknown match_type {other:?}", rule.name),
            }
            for limit in &rule.limits {
                match limit.mode.as_str() {
                    "sliding" | "fixed" | "leaky" | "token" => {}
                    other => bail!("flow rule {}: unknown mode {other:?}", rule.name),
                }
            }
        }
        if !(1..=9).contains(&self.features.gzip.level) {
            bail!("gzip level {} out of range (1-9)", self.features.gzip.level);
        }
        Ok(())
    }

    /// Serialized default configuration, used by `hamburger generate`.
    pub fn generate_default() -> String {
        let mut config = Config::default();
        config.servers = vec![
            ServerConfig {
                name: "http-server".to_string(),
                host: default_host(),
                port: 80,
                use_http2: false,
                protocol: "http".to_string(),
                enabled: true,
                max_request_body: default_max_request_body(),
                tls: None,
                domains: Vec::new(),
                read_timeout: default_read_timeout(),
                write_timeout: default_write_timeout(),
                idle_timeout: default_idle_timeout(),
                read_header_timeout: default_read_header_timeout(),
                max_header_bytes: default_max_header_bytes(),
            },
            ServerConfig {
                name: "https-server".to_string(),
                host: default_host(),
                port: 443,
                use_http2: true,
                protocol: "https".to_string(),
                enabled: false,
                max_request_body: default_max_request_body(),
                tls: Some(TlsFileConfig {
                    cert_file: "/path/to/cert.pem".to_string(),
                    key_file: "/path/to/key.pem".to_string(),
                    auto_tls: false,
                    cert_map: HashMap::new(),
                }),
                domains: Vec::new(),
                read_timeout: default_read_timeout(),
                write_timeout: default_write_timeout(),
                idle_timeout: default_idle_timeout(),
                read_header_timeout: default_read_header_timeout(),
                max_header_bytes: default_max_header_bytes(),
            },
        ];
        serde_json::to_string_pretty(&config).expect("default config always serializes")
    }
}

#[derive(Debug, Default, Deserialize)]
struct FrontendFile {
    #[serde(default)]
    pxy_frontend: PxyFrontendConfig,
}

#[derive(Debug, Default, Deserialize)]
struct BackendFile {
    #[serde(default)]
    pxy_backend: PxyBackendConfig,
}

fn parse_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&data).context("parse toml config"),
        Some("json") | None => serde_json::from_str(&data).context("parse json config"),
        Some(other) => bail!("unsupported config extension {other:?}"),
    }
}
