use std::path::PathBuf;

use serde::Deserialize;

use crate::backend::AddrFamily;

/// How a `hostname` backend resolves.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolveModeConfig {
    /// Resolve once at configuration load.
    #[default]
    Immediate,
    /// Track the first returned address.
    First,
    /// Track every returned address.
    All,
    /// SRV lookup; priority/weight seed the children.
    Srv,
}

/// One backend entry inside a service (or a named backend template at top
/// level). Exactly one of `address`, `hostname`, `use`, `redirect`,
/// `error`, `acme`, `control`, `metrics` selects the kind.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// "host:port" or an absolute UNIX socket path.
    pub address: Option<String>,
    /// Hostname to resolve (immediately or dynamically, per `resolve`).
    pub hostname: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub family: AddrFamilyConfig,
    #[serde(default)]
    pub resolve: ResolveModeConfig,
    /// Reference to a named `[[backend]]` template.
    #[serde(rename = "use")]
    pub use_named: Option<String>,

    /// Redirect status: 301, 302, 303, 307 or 308. `url` is the target
    /// template.
    pub redirect: Option<u16>,
    pub url: Option<String>,

    /// Canned error status.
    pub error: Option<u16>,
    pub error_body: Option<String>,

    /// ACME challenge directory.
    pub acme: Option<PathBuf>,

    #[serde(default)]
    pub control: bool,
    #[serde(default)]
    pub metrics: bool,

    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub disabled: bool,
    /// Member of the emergency group instead of the normal one.
    #[serde(default)]
    pub emergency: bool,

    /// Backend read deadline, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: u64,
    /// WebSocket idle bound, seconds.
    #[serde(default = "default_ws_timeout")]
    pub ws_timeout: u64,

    /// Speak TLS to this backend.
    #[serde(default)]
    pub https: bool,
    /// SNI name for the backend handshake; defaults to the hostname.
    pub servername: Option<String>,

    /// Re-resolution period for dynamic backends, seconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamilyConfig {
    #[default]
    Any,
    V4,
    V6,
}

impl From<AddrFamilyConfig> for AddrFamily {
    fn from(v: AddrFamilyConfig) -> AddrFamily {
        match v {
            AddrFamilyConfig::Any => AddrFamily::Any,
            AddrFamilyConfig::V4 => AddrFamily::V4,
            AddrFamilyConfig::V6 => AddrFamily::V6,
        }
    }
}

fn default_priority() -> u32 {
    5
}

fn default_timeout() -> u64 {
    15
}

fn default_conn_timeout() -> u64 {
    3
}

fn default_ws_timeout() -> u64 {
    600
}

fn default_retry_interval() -> u64 {
    30
}
