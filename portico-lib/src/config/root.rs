use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::acl::AclConfig;
use crate::config::backend::BackendConfig;
use crate::config::listener::ListenerConfig;
use crate::matcher::PatternFlavor;

/// An access-log selector: a numeric level (0..5 picks the corresponding
/// canned format) or a format name.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum LogLevelConfig {
    Level(u8),
    Name(String),
}

impl Default for LogLevelConfig {
    fn default() -> Self {
        LogLevelConfig::Level(1)
    }
}

/// Resolver tuning for dynamic backends.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    /// Enable dynamic resolution (the `-W dns` / `-W no-dns` switch
    /// overrides this).
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig { enable: default_true() }
    }
}

/// The control endpoint: a UNIX-socket listener wired to a control
/// service.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    pub socket: PathBuf,
}


/// Top level of the configuration file.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    /// Drop privileges to this user after binding sockets.
    pub user: Option<String>,
    pub group: Option<String>,
    /// chroot(2) into this directory at startup.
    pub root_jail: Option<PathBuf>,

    #[serde(default = "default_worker_min")]
    pub worker_min_count: usize,
    #[serde(default = "default_worker_max")]
    pub worker_max_count: usize,
    /// Seconds an idle worker above the minimum sticks around.
    #[serde(default = "default_worker_idle")]
    pub worker_idle_timeout: u64,
    /// Seconds granted to in-flight requests on shutdown or reload.
    #[serde(default = "default_grace")]
    pub grace: u64,
    /// Seconds between liveness probes of dead backends.
    #[serde(default = "default_alive")]
    pub alive: u64,

    /// Default access-log format for listeners that set none.
    #[serde(default)]
    pub log_level: LogLevelConfig,
    /// User-defined named formats.
    #[serde(default)]
    pub log_format: BTreeMap<String, String>,

    /// Default pattern dialect for conditions without `match_type`.
    #[serde(default)]
    pub regex_type: PatternFlavor,

    #[serde(default)]
    pub resolver: ResolverConfig,

    pub control: Option<ControlConfig>,

    #[serde(default, rename = "acl")]
    pub acls: Vec<AclConfig>,
    /// Named backend templates, `[backend.<name>]`, referenced from
    /// services via `use = "<name>"`.
    #[serde(default, rename = "backend")]
    pub named_backends: BTreeMap<String, BackendConfig>,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
}

fn default_true() -> bool {
    true
}

fn default_worker_min() -> usize {
    5
}

fn default_worker_max() -> usize {
    128
}

fn default_worker_idle() -> u64 {
    30
}

fn default_grace() -> u64 {
    30
}

fn default_alive() -> u64 {
    30
}
