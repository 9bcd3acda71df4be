use thiserror::Error;

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{0}")]
    Config(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("bad pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error("no backends configured for service")]
    NoBackends,
}

impl ProxyError {
    /// Config error prefixed with the location it was found at.
    pub fn at(locus: &str, msg: impl std::fmt::Display) -> Self {
        ProxyError::Config(format!("{locus}: {msg}"))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
