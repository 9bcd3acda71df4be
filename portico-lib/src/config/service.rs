use std::path::PathBuf;

use serde::Deserialize;

use crate::balance::BalanceAlgo;
use crate::config::acl::AclRefConfig;
use crate::config::backend::BackendConfig;
use crate::matcher::PatternFlavor;
use crate::session::SessionKind;

/// A named pattern applied to one value (query parameter or header).
#[derive(Debug, Deserialize, Clone)]
pub struct NamedValueConfig {
    pub name: String,
    pub value: String,
}

/// One condition block. Fields set together are an implicit AND;
/// `all`/`any`/`not` nest explicitly.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CondConfig {
    #[serde(default)]
    pub all: Vec<CondConfig>,
    #[serde(default)]
    pub any: Vec<CondConfig>,
    pub not: Option<Box<CondConfig>>,

    /// Pattern over the decoded URL (path + query).
    pub url: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    pub query_param: Option<NamedValueConfig>,
    /// Pattern over the joined header block (multiline, icase).
    pub header: Option<String>,
    pub host: Option<String>,
    /// Pattern over one named header's value.
    pub string_match: Option<NamedValueConfig>,
    pub acl: Option<AclRefConfig>,
    /// htpasswd file the Authorization header must verify against.
    pub basic_auth: Option<PathBuf>,

    /// Pattern flavor for the leaves of this block; defaults to the
    /// global `regex_type`.
    pub match_type: Option<PatternFlavor>,
    #[serde(default)]
    pub ignore_case: bool,
}

/// One rewrite operation, externally tagged so op order is preserved:
/// `{ set_header = "X: 1" }`, `{ delete_header = "^X-Drop:" }`, ...
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum RewriteOpConfig {
    SetHeader(String),
    DeleteHeader(String),
    SetUrl(String),
    SetPath(String),
    SetQuery(String),
    SetQueryParam { name: String, value: String },
    Sub(Box<RewriteConfig>),
}

/// A conditional rewrite rule.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RewriteConfig {
    #[serde(rename = "match")]
    pub cond: Option<CondConfig>,
    #[serde(default)]
    pub ops: Vec<RewriteOpConfig>,
    #[serde(rename = "else")]
    pub else_branch: Option<Box<RewriteConfig>>,
}

/// Session affinity settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: SessionKind,
    /// Seconds an unused session entry survives.
    pub ttl: u64,
    /// Cookie / parameter / header name, where the policy needs one.
    #[serde(default)]
    pub id: String,
}

/// One service inside a listener.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: Option<String>,
    /// Match condition; absent means match everything.
    #[serde(rename = "match")]
    pub cond: Option<CondConfig>,
    #[serde(default, rename = "rewrite")]
    pub rewrites: Vec<RewriteConfig>,
    #[serde(default, rename = "response_rewrite")]
    pub response_rewrites: Vec<RewriteConfig>,
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
    pub session: Option<SessionConfig>,
    #[serde(default)]
    pub algo: BalanceAlgo,
    /// Override of the listener's forwarded-for header name.
    pub forwarded_header: Option<String>,
    pub trusted_ips: Option<AclRefConfig>,
    #[serde(default)]
    pub log_suppress: bool,
    #[serde(default)]
    pub disabled: bool,
}
