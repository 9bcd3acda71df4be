use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Where a regular backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Inet(sa) => write!(f, "{sa}"),
            BackendAddr::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// TLS material for talking to an HTTPS backend.
pub struct BackendTls {
    pub connector: TlsConnector,
    pub servername: ServerName<'static>,
}

impl fmt::Debug for BackendTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTls")
            .field("servername", &self.servername)
            .finish()
    }
}

/// A resolved server we can open connections to.
#[derive(Debug)]
pub struct RegularBackend {
    pub addr: BackendAddr,
    pub alive: AtomicBool,
    /// Backend read deadline.
    pub timeout: Duration,
    pub conn_timeout: Duration,
    /// WebSocket idle bound once a connection is upgraded.
    pub ws_timeout: Duration,
    pub tls: Option<BackendTls>,
}

/// How a matrix hostname expands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Keep a single child, the first address returned.
    First,
    /// Keep one child per address.
    All,
    /// SRV lookup; SRV priority/weight seed each child's priority.
    Srv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// Fields a matrix hands down to the children it creates.
#[derive(Debug, Clone)]
pub struct BackendTemplate {
    pub priority: u32,
    pub timeout: Duration,
    pub conn_timeout: Duration,
    pub ws_timeout: Duration,
    /// Children speak TLS to their servers, SNI set to the hostname.
    pub https: bool,
}

/// A hostname expanded into regular children by the resolver loop.
#[derive(Debug)]
pub struct MatrixBackend {
    pub hostname: String,
    pub port: u16,
    pub family: AddrFamily,
    pub mode: ResolveMode,
    pub retry_interval: Duration,
    pub template: BackendTemplate,
    pub children: RwLock<Vec<Arc<Backend>>>,
}

#[derive(Debug)]
pub enum BackendKind {
    Regular(RegularBackend),
    Matrix(MatrixBackend),
    Redirect {
        code: u16,
        template: String,
        /// True when the template references the request URI (`$N`); a
        /// plain target gets the original URL appended on expansion.
        has_uri: bool,
    },
    Error {
        status: u16,
        body: Option<String>,
    },
    Acme {
        directory: PathBuf,
        /// The challenge path pattern; its capture names the file.
        pattern: crate::matcher::Matcher,
    },
    Control,
    Metrics,
}

/// One entry in a balancer group: a server, or an internal responder.
#[derive(Debug)]
pub struct Backend {
    pub kind: BackendKind,
    pub priority: u32,
    pub disabled: AtomicBool,
    /// Created at runtime by matrix expansion (and thus deletable).
    pub dynamic: bool,
    pub locus: String,
}

impl Backend {
    pub fn new(kind: BackendKind, priority: u32, locus: String) -> Backend {
        Backend {
            kind,
            priority,
            disabled: AtomicBool::new(false),
            dynamic: false,
            locus,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, v: bool) {
        self.disabled.store(v, Ordering::Relaxed);
    }

    /// Internal responders are always alive; a matrix is never selected
    /// directly, only its children are.
    pub fn is_alive(&self) -> bool {
        match &self.kind {
            BackendKind::Regular(r) => r.alive.load(Ordering::Relaxed),
            BackendKind::Matrix(_) => false,
            _ => true,
        }
    }

    pub fn set_alive(&self, v: bool) {
        if let BackendKind::Regular(r) = &self.kind {
            r.alive.store(v, Ordering::Relaxed);
        }
    }

    pub fn eligible(&self) -> bool {
        !self.is_disabled() && self.is_alive()
    }

    pub fn regular(&self) -> Option<&RegularBackend> {
        match &self.kind {
            BackendKind::Regular(r) => Some(r),
            _ => None,
        }
    }

    /// Display label used in logs and the control listing.
    pub fn label(&self) -> String {
        match &self.kind {
            BackendKind::Regular(r) => r.addr.to_string(),
            BackendKind::Matrix(m) => format!("{}:{}", m.hostname, m.port),
            BackendKind::Redirect { code, template, .. } => {
                format!("redirect({code} {template})")
            }
            BackendKind::Error { status, .. } => format!("error({status})"),
            BackendKind::Acme { .. } => "(acme)".to_string(),
            BackendKind::Control => "(control)".to_string(),
            BackendKind::Metrics => "(metrics)".to_string(),
        }
    }
}
