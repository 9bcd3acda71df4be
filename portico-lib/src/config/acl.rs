use serde::Deserialize;

/// A named ACL defined at top level.
#[derive(Debug, Deserialize, Clone)]
pub struct AclConfig {
    pub name: String,
    /// CIDR notation, e.g. ["10.0.0.0/8", "::1/128"].
    pub cidr: Vec<String>,
}

/// Where an ACL is used: either by name, or as an inline CIDR list.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum AclRefConfig {
    Name(String),
    Inline(Vec<String>),
}
