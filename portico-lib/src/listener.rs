use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use arc_swap::ArcSwap;

use crate::accesslog::LogFormat;
use crate::acl::Acl;
use crate::http::reply::HttpStatus;
use crate::http::request::Request;
use crate::matcher::{Captures, Matcher};
use crate::routing::rewrite::RewriteRule;
use crate::service::Service;
use crate::tls::TlsServer;

/// Where a listener binds.
#[derive(Debug, Clone)]
pub enum BindAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
    /// A pre-bound TCP socket received over this UNIX socket via
    /// SCM_RIGHTS ancillary data.
    SocketFrom(PathBuf),
}

impl std::fmt::Display for BindAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindAddr::Inet(sa) => write!(f, "{sa}"),
            BindAddr::Unix(p) => write!(f, "{}", p.display()),
            BindAddr::SocketFrom(p) => write!(f, "fd from {}", p.display()),
        }
    }
}

/// A front-end endpoint: bind address, optional TLS contexts, and the
/// ordered service list. The service list sits behind an `ArcSwap` so a
/// graceful reload can republish it while the socket lives on.
#[derive(Debug)]
pub struct Listener {
    pub bind: BindAddr,
    pub tls: Option<Arc<TlsServer>>,
    pub services: ArcSwap<Vec<Arc<Service>>>,
    /// Requests must match this pattern or get 501.
    pub url_pattern: Option<Matcher>,
    /// Inject the X-SSL-* headers on TLS connections.
    pub ssl_headers: bool,
    /// Strip matching request headers before any processing.
    pub head_remove: Vec<Matcher>,
    pub rewrite_request: Vec<RewriteRule>,
    pub rewrite_response: Vec<RewriteRule>,
    /// 0 = unlimited.
    pub max_req_size: u64,
    /// 0 = unlimited.
    pub max_uri_length: usize,
    pub client_timeout: Duration,
    /// 0 off, 1 rewrite backend authorities, 2 also require the URL
    /// pattern to match the path.
    pub rewrite_location: u8,
    pub rewrite_destination: bool,
    /// Highest permitted method safety group.
    pub verb: u8,
    /// 0 ignore, 1 force HTTP/1.0 on TLS, 2 force it on TLS for MSIE.
    pub no_https_11: u8,
    /// Per-status error body overrides.
    pub err_bodies: AHashMap<u16, String>,
    pub forwarded_header: String,
    pub trusted_ips: Option<Acl>,
    pub log_format: Arc<LogFormat>,
    pub locus: String,
}

impl Listener {
    pub fn name(&self) -> String {
        self.bind.to_string()
    }

    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    pub fn err_body(&self, status: HttpStatus) -> Option<&str> {
        self.err_bodies.get(&status.code()).map(|s| s.as_str())
    }

    /// First enabled service accepting the request, in configuration
    /// order.
    pub fn find_service(
        &self,
        req: &Request,
        peer: Option<IpAddr>,
        caps: &mut Captures,
    ) -> Option<Arc<Service>> {
        let services = self.services.load();
        services
            .iter()
            .find(|svc| svc.matches(req, peer, caps))
            .cloned()
    }

    /// Snapshot of the current service list.
    pub fn service_list(&self) -> Arc<Vec<Arc<Service>>> {
        self.services.load_full()
    }
}
