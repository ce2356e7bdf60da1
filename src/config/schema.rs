//! Configuration schema definitions.
//!
//! The descriptor tree names its dependencies by string; `builder` resolves
//! them. Every struct has serde defaults so minimal configs parse.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::observability::redact::RedactConfig;

/// Root configuration of the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Process lifecycle settings.
    pub entrypoint: EntrypointConfig,

    /// Listeners, one runner each.
    pub servers: Vec<ServerConfig>,

    /// Named virtual hosts.
    pub virtual_hosts: BTreeMap<String, VirtualHostConfig>,

    /// Named server-side middleware.
    pub middleware: BTreeMap<String, MiddlewareConfig>,

    /// Named client-side tripperware.
    pub tripperware: BTreeMap<String, TripperwareConfig>,

    /// Named terminal handlers.
    pub handlers: BTreeMap<String, HandlerConfig>,

    /// Named credential stores.
    pub stores: BTreeMap<String, StoreConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EntrypointConfig {
    /// Wait for every runner instead of stopping at the first one.
    pub wait_all: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1 and HTTP/2 over TCP.
    #[default]
    Http,
    /// HTTP/3 over QUIC. Requires TLS.
    Http3,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub protocol: Protocol,

    /// Bind address (e.g., "0.0.0.0:8443").
    pub addr: String,

    pub tls: Option<TlsConfig>,

    /// Negotiate HTTP/2 over TLS (and h2c when enabled).
    pub allow_http2: bool,

    /// Accept cleartext HTTP/2.
    pub enable_h2c: bool,

    pub read_timeout_ms: Option<u64>,
    pub read_header_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,

    /// Time given to in-flight requests after shutdown starts.
    pub shutdown_timeout_ms: u64,

    pub max_header_bytes: Option<usize>,
    pub max_connections: Option<usize>,
    pub disable_keep_alive: bool,
    pub http2: Http2Config,

    /// `Alt-Svc` header value added to every response.
    pub alt_svc: Option<String>,

    /// Answer `OPTIONS *` with 200 and an `Allow` header.
    pub general_options: bool,
    pub pprof: bool,
    pub expvar: bool,

    /// Server-wide middleware, outermost first.
    pub middleware: Vec<String>,
    pub virtual_hosts: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Http,
            addr: String::new(),
            tls: None,
            allow_http2: true,
            enable_h2c: false,
            read_timeout_ms: None,
            read_header_timeout_ms: None,
            write_timeout_ms: None,
            idle_timeout_ms: None,
            shutdown_timeout_ms: 30_000,
            max_header_bytes: None,
            max_connections: None,
            disable_keep_alive: false,
            http2: Http2Config::default(),
            alt_svc: None,
            general_options: true,
            pprof: false,
            expvar: false,
            middleware: Vec::new(),
            virtual_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Path to private key (PEM).
    pub key_path: PathBuf,

    /// Extra ALPN protocols advertised after `h2` and `http/1.1`.
    #[serde(default)]
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Http2Config {
    pub max_concurrent_streams: Option<u32>,
    pub max_read_frame_size: Option<u32>,
    pub max_upload_buffer_per_stream: Option<u32>,
    pub max_upload_buffer_per_connection: Option<u32>,
    pub max_send_buf_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VirtualHostConfig {
    /// Host names; empty matches every host.
    pub hosts: Vec<String>,

    /// Path prefix applied to every handler path.
    pub pattern: String,

    /// Method restriction; empty allows all.
    pub methods: Vec<String>,

    /// Middleware applied to every handler, outermost first.
    pub middleware: Vec<String>,

    pub handlers: Vec<HandlerRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandlerRef {
    pub handler: String,
    /// Defaults to `/`.
    pub paths: Vec<String>,
    pub methods: Vec<String>,
}

/// Server-side middleware.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareConfig {
    ApiKey(ApiKeyConfig),
    IdKey(IdKeyConfig),
    Casbin(CasbinConfig),
    AccessLog(LogConfig),
    JournalLog(JournalLogConfig),
}

fn default_key_header() -> String {
    "X-Api-Key".to_string()
}

fn default_id_header() -> String {
    "X-Api-Id".to_string()
}

fn default_claims_key() -> String {
    "authn".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Credential store name.
    pub store: String,
    #[serde(default = "default_key_header")]
    pub header: String,
    /// Forward the credential header upstream.
    #[serde(default)]
    pub keep: bool,
    #[serde(default = "default_claims_key")]
    pub claims_key: String,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdKeyConfig {
    pub store: String,
    #[serde(default = "default_id_header")]
    pub id_header: String,
    #[serde(default = "default_key_header")]
    pub key_header: String,
    #[serde(default)]
    pub keep: bool,
    #[serde(default = "default_claims_key")]
    pub claims_key: String,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// How secrets are stored and compared.
///
/// No `hash` keeps secrets as given; `hash` alone stores digests; `hash`
/// with `hmac_key` stores HMACs. `cipher_key` (hex, 16 or 32 bytes) seals
/// stored secrets with AES-GCM.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodecConfig {
    pub hash: Option<String>,
    pub hmac_key: Option<String>,
    /// Encoding of derived lookup ids.
    pub encoding: String,
    pub cipher_key: Option<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            hash: None,
            hmac_key: None,
            encoding: "hex".to_string(),
            cipher_key: None,
        }
    }
}

fn default_raw() -> String {
    "raw".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Env {
        key_prefix: String,
        /// Required by `id_key` middleware.
        #[serde(default)]
        id_prefix: Option<String>,
        #[serde(default = "default_raw")]
        encoding: String,
    },
    File {
        paths: Vec<PathBuf>,
        #[serde(default = "default_raw")]
        encoding: String,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CasbinConfig {
    /// Context key of the authentication claims.
    pub claims_key: Option<String>,
    /// Context keys passed as extra enforcement arguments (at most 3).
    pub extra_keys: Vec<String>,
    /// Log explanations to the `audit` target.
    pub explain: bool,
    pub enforcers: Vec<EnforcerConfig>,
}

fn default_load_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcerConfig {
    /// Model file path or http(s) URL.
    pub model: String,
    /// Policy file path (format by extension) or http(s) URL (format by
    /// content type).
    pub policy: String,
    /// Headers added to model and policy HTTP requests.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_load_timeout_ms")]
    pub timeout_ms: u64,
    /// Reload schedule, seconds field first.
    #[serde(default)]
    pub reload_cron: Option<String>,
}

pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn default_sink() -> String {
    crate::observability::sink::DEFAULT_SINK.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log sink name.
    #[serde(default = "default_sink")]
    pub sink: String,
    /// `%tag%` template; requires a raw-writer sink.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub redact: RedactConfig,
}

fn default_max_body() -> i64 {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalLogConfig {
    #[serde(flatten)]
    pub log: LogConfig,
    #[serde(default)]
    pub mimes: Vec<String>,
    #[serde(default = "default_max_body")]
    pub max_body: i64,
    #[serde(default)]
    pub body_path: Option<PathBuf>,
    #[serde(default)]
    pub base64: bool,
}

/// Client-side tripperware.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TripperwareConfig {
    Headers { headers: BTreeMap<String, String> },
    AccessLog(LogConfig),
    JournalLog(JournalLogConfig),
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfig {
    Proxy {
        upstream: String,
        #[serde(default)]
        tripperware: Vec<String>,
    },
    Static {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        content_type: Option<String>,
        #[serde(default)]
        body: String,
    },
    NotFound,
}

fn default_redis_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Redis {
        url: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_redis_timeout_ms")]
        timeout_ms: u64,
    },
}
