use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::acl::AclRefConfig;
use crate::config::root::LogLevelConfig;
use crate::config::service::{RewriteConfig, ServiceConfig};

/// TLS termination settings of one HTTPS listener.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerTlsConfig {
    /// Combined key+chain PEM files; a directory contributes every file
    /// inside. The first certificate is the SNI fallback.
    pub certs: Vec<PathBuf>,
    /// Client certificate verification mode 0..3: 0 none, 1 required,
    /// 2/3 requested.
    #[serde(default)]
    pub client_cert: u8,
    /// CA bundle for client certificate verification.
    pub ca_list: Option<PathBuf>,
    /// Certificate revocation lists applied during client verification.
    #[serde(default)]
    pub crl_list: Option<PathBuf>,
    /// Cipher suite names, colon or comma separated.
    pub ciphers: Option<String>,
    #[serde(default)]
    pub disable_tls12: bool,
}

/// One front-end listener.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// IP to bind, or an absolute UNIX socket path.
    pub address: Option<String>,
    pub port: Option<u16>,
    /// Receive a pre-bound socket over this UNIX path (SCM_RIGHTS).
    pub socket_from: Option<PathBuf>,

    pub tls: Option<ListenerTlsConfig>,

    /// Client I/O deadline, seconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    /// Largest accepted request body; 0 = unlimited.
    #[serde(default)]
    pub max_req_size: u64,
    /// Longest accepted request URI; 0 = unlimited.
    #[serde(default)]
    pub max_uri_length: usize,
    /// Highest permitted method group (0..4).
    #[serde(default)]
    pub verb: u8,
    /// 0 ignore, 1 force HTTP/1.0 on TLS, 2 only for MSIE agents.
    #[serde(default)]
    pub no_https_11: u8,
    /// 0 off, 1 rewrite backend authorities in Location headers, 2 also
    /// require the URL pattern to match the path.
    #[serde(default = "default_rewrite_location")]
    pub rewrite_location: u8,
    #[serde(default)]
    pub rewrite_destination: bool,
    /// Inject X-SSL-* request headers on TLS connections.
    #[serde(default)]
    pub ssl_headers: bool,
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
    /// Requests must match or are answered 501.
    pub url_pattern: Option<String>,
    /// Request headers dropped before processing (patterns over the full
    /// header line).
    #[serde(default)]
    pub head_remove: Vec<String>,
    pub trusted_ips: Option<AclRefConfig>,
    /// Access-log format: a level 0..5 or a format name.
    pub log_level: Option<LogLevelConfig>,
    /// Error body overrides by status code ("400", "404", ...).
    #[serde(default)]
    pub errors: BTreeMap<String, String>,

    #[serde(default, rename = "rewrite")]
    pub rewrites: Vec<RewriteConfig>,
    #[serde(default, rename = "response_rewrite")]
    pub response_rewrites: Vec<RewriteConfig>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

fn default_client_timeout() -> u64 {
    10
}

fn default_rewrite_location() -> u8 {
    1
}

fn default_forwarded_header() -> String {
    "X-Forwarded-For".to_string()
}
