use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use ipnet::IpNet;

use crate::accesslog::{canned_formats, LogFormat};
use crate::acl::Acl;
use crate::auth::PasswdFile;
use crate::backend::{
    AddrFamily, Backend, BackendAddr, BackendKind, BackendTemplate, BackendTls, MatrixBackend,
    RegularBackend,
};
use crate::balance::BalancerGroup;
use crate::config::acl::AclRefConfig;
use crate::config::backend::{BackendConfig, ResolveModeConfig};
use crate::config::listener::ListenerConfig;
use crate::config::root::{LogLevelConfig, RootConfig};
use crate::config::service::{CondConfig, RewriteConfig, RewriteOpConfig, ServiceConfig};
use crate::core::Core;
use crate::error::{ProxyError, Result};
use crate::listener::{BindAddr, Listener};
use crate::matcher::{Matcher, PatternFlavor};
use crate::metrics::Metrics;
use crate::routing::cond::Cond;
use crate::routing::rewrite::{RewriteOp, RewriteRule};
use crate::service::Service;
use crate::session::{SessionPolicy, SessionTable};
use crate::tls::{build_backend_connector, TlsServer};

struct BuildCtx {
    regex_type: PatternFlavor,
    acls: AHashMap<String, Arc<Acl>>,
    named: AHashMap<String, BackendConfig>,
    formats: Vec<LogFormat>,
    named_formats: BTreeMap<String, LogFormat>,
    dns_enabled: bool,
}

impl BuildCtx {
    fn resolve_acl(&self, r: &AclRefConfig, locus: &str) -> Result<Arc<Acl>> {
        match r {
            AclRefConfig::Name(name) => self
                .acls
                .get(name)
                .cloned()
                .ok_or_else(|| ProxyError::at(locus, format!("unknown ACL {name:?}"))),
            AclRefConfig::Inline(cidrs) => Ok(Arc::new(Acl::new(None, parse_nets(cidrs, locus)?))),
        }
    }

    fn resolve_format(&self, sel: &LogLevelConfig, locus: &str) -> Result<Arc<LogFormat>> {
        match sel {
            LogLevelConfig::Level(n) => self
                .formats
                .get(*n as usize)
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| ProxyError::at(locus, format!("log level {n} out of range (0..5)"))),
            LogLevelConfig::Name(name) => self
                .named_formats
                .get(name)
                .or_else(|| self.formats.iter().find(|f| &f.name == name))
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| ProxyError::at(locus, format!("unknown log format {name:?}"))),
        }
    }
}

fn parse_nets(cidrs: &[String], locus: &str) -> Result<Vec<IpNet>> {
    cidrs
        .iter()
        .map(|s| {
            // a bare address is a host net
            s.parse::<IpNet>().or_else(|_| {
                s.parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|_| ProxyError::at(locus, format!("bad CIDR {s:?}")))
            })
        })
        .collect()
}

/// Compile a loaded configuration into the runtime graph.
pub fn build_core(cfg: &RootConfig, dns_enabled: bool) -> Result<Arc<Core>> {
    let mut acls = AHashMap::new();
    for acl in &cfg.acls {
        let nets = parse_nets(&acl.cidr, &format!("acl {:?}", acl.name))?;
        acls.insert(
            acl.name.clone(),
            Arc::new(Acl::new(Some(acl.name.clone()), nets)),
        );
    }

    let mut named = AHashMap::new();
    for (name, backend) in &cfg.named_backends {
        named.insert(name.clone(), backend.clone());
    }

    let mut named_formats = BTreeMap::new();
    for (name, fmt) in &cfg.log_format {
        named_formats.insert(name.clone(), LogFormat::compile(name, fmt)?);
    }

    let ctx = BuildCtx {
        regex_type: cfg.regex_type,
        acls,
        named,
        formats: canned_formats(),
        named_formats,
        dns_enabled,
    };

    let mut listeners = Vec::new();
    for (li, lcfg) in cfg.listeners.iter().enumerate() {
        let locus = format!("listener[{li}]");
        listeners.push(Arc::new(build_listener(lcfg, &ctx, &cfg.log_level, &locus)?));
    }

    if let Some(control) = &cfg.control {
        listeners.push(Arc::new(control_listener(&control.socket, &ctx)?));
    }

    Ok(Arc::new(Core {
        listeners,
        metrics: Arc::new(Metrics::new()),
        grace: Duration::from_secs(cfg.grace),
        alive_interval: Duration::from_secs(cfg.alive.max(1)),
        worker_min: cfg.worker_min_count,
        worker_max: cfg.worker_max_count,
        worker_idle_timeout: Duration::from_secs(cfg.worker_idle_timeout),
    }))
}

fn build_listener(
    lcfg: &ListenerConfig,
    ctx: &BuildCtx,
    default_log: &LogLevelConfig,
    locus: &str,
) -> Result<Listener> {
    let bind = match (&lcfg.address, &lcfg.socket_from) {
        (Some(addr), None) if addr.starts_with('/') => BindAddr::Unix(PathBuf::from(addr)),
        (Some(addr), None) => {
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| ProxyError::at(locus, format!("bad listen address {addr:?}")))?;
            let port = lcfg
                .port
                .ok_or_else(|| ProxyError::at(locus, "inet listener without a port"))?;
            BindAddr::Inet(SocketAddr::new(ip, port))
        }
        (None, Some(path)) => BindAddr::SocketFrom(path.clone()),
        _ => return Err(ProxyError::at(locus, "listener without a bind address")),
    };

    let tls = match &lcfg.tls {
        Some(t) => Some(Arc::new(TlsServer::build(
            &t.certs,
            t.client_cert,
            t.ca_list.as_deref(),
            t.crl_list.as_deref(),
            t.ciphers.as_deref(),
            t.disable_tls12,
        )?)),
        None => None,
    };

    let url_pattern = lcfg
        .url_pattern
        .as_deref()
        .map(|p| Matcher::compile(p, ctx.regex_type, false))
        .transpose()?;

    let head_remove = lcfg
        .head_remove
        .iter()
        .map(|p| Matcher::compile(p, ctx.regex_type, true))
        .collect::<Result<Vec<_>>>()?;

    let mut err_bodies = AHashMap::new();
    for (key, body) in &lcfg.errors {
        let code: u16 = key
            .parse()
            .map_err(|_| ProxyError::at(locus, format!("bad error code {key:?}")))?;
        err_bodies.insert(code, body.clone());
    }

    let services = lcfg
        .services
        .iter()
        .enumerate()
        .map(|(si, s)| {
            build_service(s, ctx, &format!("{locus}.service[{si}]")).map(Arc::new)
        })
        .collect::<Result<Vec<_>>>()?;

    let log_format = ctx.resolve_format(lcfg.log_level.as_ref().unwrap_or(default_log), locus)?;

    Ok(Listener {
        bind,
        tls,
        services: ArcSwap::from_pointee(services),
        url_pattern,
        ssl_headers: lcfg.ssl_headers,
        head_remove,
        rewrite_request: build_rewrites(&lcfg.rewrites, ctx, locus)?,
        rewrite_response: build_rewrites(&lcfg.response_rewrites, ctx, locus)?,
        max_req_size: lcfg.max_req_size,
        max_uri_length: lcfg.max_uri_length,
        client_timeout: Duration::from_secs(lcfg.client_timeout),
        rewrite_location: lcfg.rewrite_location,
        rewrite_destination: lcfg.rewrite_destination,
        verb: lcfg.verb,
        no_https_11: lcfg.no_https_11,
        err_bodies,
        forwarded_header: lcfg.forwarded_header.clone(),
        trusted_ips: lcfg
            .trusted_ips
            .as_ref()
            .map(|r| ctx.resolve_acl(r, locus))
            .transpose()?
            .map(|a| (*a).clone()),
        log_format,
        locus: locus.to_string(),
    })
}

/// The `[control]` section is sugar for a UNIX listener with a single
/// catch-all control service.
fn control_listener(socket: &std::path::Path, ctx: &BuildCtx) -> Result<Listener> {
    let control_be = Arc::new(Backend::new(
        BackendKind::Control,
        5,
        "control".to_string(),
    ));
    let service = Arc::new(Service {
        name: Some("control".into()),
        cond: Cond::And(Vec::new()),
        rewrite_request: Vec::new(),
        rewrite_response: Vec::new(),
        normal: BalancerGroup::new(Default::default(), vec![control_be]),
        emergency: None,
        matrices: Vec::new(),
        session_policy: None,
        sessions: None,
        forwarded_header: None,
        trusted_ips: None,
        log_suppress: true,
        disabled: AtomicBool::new(false),
        locus: "control".to_string(),
    });
    Ok(Listener {
        bind: BindAddr::Unix(socket.to_path_buf()),
        tls: None,
        services: ArcSwap::from_pointee(vec![service]),
        url_pattern: None,
        ssl_headers: false,
        head_remove: Vec::new(),
        rewrite_request: Vec::new(),
        rewrite_response: Vec::new(),
        max_req_size: 0,
        max_uri_length: 0,
        client_timeout: Duration::from_secs(10),
        rewrite_location: 0,
        rewrite_destination: false,
        verb: 1,
        no_https_11: 0,
        err_bodies: AHashMap::new(),
        forwarded_header: "X-Forwarded-For".to_string(),
        trusted_ips: None,
        log_format: ctx.resolve_format(&LogLevelConfig::Level(0), "control")?,
        locus: "control".to_string(),
    })
}

fn build_service(scfg: &ServiceConfig, ctx: &BuildCtx, locus: &str) -> Result<Service> {
    let cond = match &scfg.cond {
        Some(c) => build_cond(c, ctx, locus)?,
        None => Cond::And(Vec::new()),
    };

    let mut normal = Vec::new();
    let mut emergency = Vec::new();
    let mut matrices = Vec::new();
    for (bi, bcfg) in scfg.backends.iter().enumerate() {
        let locus = format!("{locus}.backend[{bi}]");
        let be = build_backend(bcfg, ctx, &locus)?;
        if matches!(be.kind, BackendKind::Matrix(_)) {
            matrices.push(be);
        } else if bcfg.emergency {
            emergency.push(be);
        } else {
            normal.push(be);
        }
    }

    let (session_policy, sessions) = match &scfg.session {
        Some(s) => {
            let ttl = Duration::from_secs(s.ttl);
            (
                Some(SessionPolicy { kind: s.kind, ttl, id: s.id.clone() }),
                Some(SessionTable::new(ttl)),
            )
        }
        None => (None, None),
    };

    Ok(Service {
        name: scfg.name.clone(),
        cond,
        rewrite_request: build_rewrites(&scfg.rewrites, ctx, locus)?,
        rewrite_response: build_rewrites(&scfg.response_rewrites, ctx, locus)?,
        normal: BalancerGroup::new(scfg.algo, normal),
        emergency: if emergency.is_empty() {
            None
        } else {
            Some(BalancerGroup::new(scfg.algo, emergency))
        },
        matrices,
        session_policy,
        sessions,
        forwarded_header: scfg.forwarded_header.clone(),
        trusted_ips: scfg
            .trusted_ips
            .as_ref()
            .map(|r| ctx.resolve_acl(r, locus))
            .transpose()?
            .map(|a| (*a).clone()),
        log_suppress: scfg.log_suppress,
        disabled: AtomicBool::new(scfg.disabled),
        locus: locus.to_string(),
    })
}

fn template_refs_uri(tpl: &str) -> bool {
    let bytes = tpl.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' {
            if bytes[i + 1] == b'$' {
                i += 2;
                continue;
            }
            if bytes[i + 1].is_ascii_digit() {
                return true;
            }
        }
        i += 1;
    }
    false
}

fn backend_tls(cfg: &BackendConfig, host_hint: &str) -> Option<BackendTls> {
    if !cfg.https {
        return None;
    }
    let name = cfg
        .servername
        .clone()
        .or_else(|| cfg.hostname.clone())
        .unwrap_or_else(|| host_hint.to_string());
    rustls_pki_types::ServerName::try_from(name)
        .ok()
        .map(|servername| BackendTls {
            connector: build_backend_connector(),
            servername,
        })
}

fn build_backend(cfg: &BackendConfig, ctx: &BuildCtx, locus: &str) -> Result<Arc<Backend>> {
    if let Some(name) = &cfg.use_named {
        let named = ctx
            .named
            .get(name)
            .ok_or_else(|| ProxyError::at(locus, format!("unknown named backend {name:?}")))?;
        let mut merged = named.clone();
        merged.emergency = cfg.emergency;
        merged.disabled = cfg.disabled;
        return build_backend(&merged, ctx, locus);
    }

    let timeouts = (
        Duration::from_secs(cfg.timeout),
        Duration::from_secs(cfg.conn_timeout),
        Duration::from_secs(cfg.ws_timeout),
    );

    let kind = if let Some(addr) = &cfg.address {
        let (addr, host_hint) = if addr.starts_with('/') {
            (BackendAddr::Unix(PathBuf::from(addr)), addr.clone())
        } else {
            let sa: SocketAddr = addr
                .parse()
                .map_err(|_| ProxyError::at(locus, format!("bad backend address {addr:?}")))?;
            if sa.port() == 0 {
                return Err(ProxyError::at(locus, "backend port can't be zero"));
            }
            (BackendAddr::Inet(sa), sa.ip().to_string())
        };
        BackendKind::Regular(RegularBackend {
            addr,
            alive: AtomicBool::new(true),
            timeout: timeouts.0,
            conn_timeout: timeouts.1,
            ws_timeout: timeouts.2,
            tls: backend_tls(cfg, &host_hint),
        })
    } else if let Some(hostname) = &cfg.hostname {
        let dynamic = ctx.dns_enabled && cfg.resolve != ResolveModeConfig::Immediate;
        if dynamic {
            BackendKind::Matrix(MatrixBackend {
                hostname: hostname.clone(),
                port: cfg.port.unwrap_or(0),
                family: cfg.family.into(),
                mode: match cfg.resolve {
                    ResolveModeConfig::First => crate::backend::ResolveMode::First,
                    ResolveModeConfig::Srv => crate::backend::ResolveMode::Srv,
                    _ => crate::backend::ResolveMode::All,
                },
                retry_interval: Duration::from_secs(cfg.retry_interval),
                template: BackendTemplate {
                    priority: cfg.priority,
                    timeout: timeouts.0,
                    conn_timeout: timeouts.1,
                    ws_timeout: timeouts.2,
                    https: cfg.https,
                },
                children: std::sync::RwLock::new(Vec::new()),
            })
        } else {
            let port = cfg
                .port
                .ok_or_else(|| ProxyError::at(locus, "hostname backend without a port"))?;
            let family: AddrFamily = cfg.family.into();
            let resolved = (hostname.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| ProxyError::at(locus, format!("can't resolve {hostname:?}: {e}")))?
                .find(|sa| match family {
                    AddrFamily::Any => true,
                    AddrFamily::V4 => sa.is_ipv4(),
                    AddrFamily::V6 => sa.is_ipv6(),
                })
                .ok_or_else(|| {
                    ProxyError::at(locus, format!("no usable address for {hostname:?}"))
                })?;
            BackendKind::Regular(RegularBackend {
                addr: BackendAddr::Inet(resolved),
                alive: AtomicBool::new(true),
                timeout: timeouts.0,
                conn_timeout: timeouts.1,
                ws_timeout: timeouts.2,
                tls: backend_tls(cfg, hostname),
            })
        }
    } else if let Some(code) = cfg.redirect {
        let template = cfg
            .url
            .clone()
            .ok_or_else(|| ProxyError::at(locus, "redirect requires a url template"))?;
        let has_uri = template_refs_uri(&template);
        BackendKind::Redirect { code, template, has_uri }
    } else if let Some(status) = cfg.error {
        BackendKind::Error { status, body: cfg.error_body.clone() }
    } else if let Some(dir) = &cfg.acme {
        BackendKind::Acme {
            directory: dir.clone(),
            pattern: Matcher::compile(
                r"^/\.well-known/acme-challenge/(.+)",
                PatternFlavor::Posix,
                false,
            )?,
        }
    } else if cfg.control {
        BackendKind::Control
    } else if cfg.metrics {
        BackendKind::Metrics
    } else {
        return Err(ProxyError::at(locus, "backend kind is required"));
    };

    let be = Backend {
        kind,
        priority: cfg.priority,
        disabled: AtomicBool::new(cfg.disabled),
        dynamic: false,
        locus: locus.to_string(),
    };
    Ok(Arc::new(be))
}

fn build_cond(cfg: &CondConfig, ctx: &BuildCtx, locus: &str) -> Result<Cond> {
    let flavor = cfg.match_type.unwrap_or(ctx.regex_type);
    let icase = cfg.ignore_case;
    let mut nodes: Vec<Cond> = Vec::new();

    for sub in &cfg.all {
        nodes.push(build_cond(sub, ctx, locus)?);
    }
    if !cfg.any.is_empty() {
        let children = cfg
            .any
            .iter()
            .map(|c| build_cond(c, ctx, locus))
            .collect::<Result<Vec<_>>>()?;
        nodes.push(Cond::Or(children));
    }
    if let Some(sub) = &cfg.not {
        nodes.push(Cond::Not(Box::new(build_cond(sub, ctx, locus)?)));
    }

    if let Some(p) = &cfg.url {
        nodes.push(Cond::Url(Matcher::compile(p, flavor, icase)?));
    }
    if let Some(p) = &cfg.path {
        nodes.push(Cond::Path(Matcher::compile(p, flavor, icase)?));
    }
    if let Some(p) = &cfg.query {
        nodes.push(Cond::Query(Matcher::compile(p, flavor, icase)?));
    }
    if let Some(qp) = &cfg.query_param {
        nodes.push(Cond::QueryParam {
            name: qp.name.clone(),
            value: Matcher::compile(&qp.value, flavor, icase)?,
        });
    }
    if let Some(p) = &cfg.header {
        nodes.push(Cond::header(p, flavor)?);
    }
    if let Some(p) = &cfg.host {
        nodes.push(Cond::host(p, flavor)?);
    }
    if let Some(sm) = &cfg.string_match {
        nodes.push(Cond::StringMatch {
            header: sm.name.clone(),
            value: Matcher::compile(&sm.value, flavor, icase)?,
        });
    }
    if let Some(acl) = &cfg.acl {
        nodes.push(Cond::Acl(ctx.resolve_acl(acl, locus)?));
    }
    if let Some(pwfile) = &cfg.basic_auth {
        nodes.push(Cond::BasicAuth(Arc::new(PasswdFile::load(pwfile)?)));
    }

    Ok(match nodes.len() {
        0 => Cond::And(Vec::new()),
        1 => nodes.remove(0),
        _ => Cond::And(nodes),
    })
}

fn build_rewrites(
    cfgs: &[RewriteConfig],
    ctx: &BuildCtx,
    locus: &str,
) -> Result<Vec<RewriteRule>> {
    cfgs.iter().map(|c| build_rewrite(c, ctx, locus)).collect()
}

fn build_rewrite(cfg: &RewriteConfig, ctx: &BuildCtx, locus: &str) -> Result<RewriteRule> {
    let cond = cfg
        .cond
        .as_ref()
        .map(|c| build_cond(c, ctx, locus))
        .transpose()?;
    let ops = cfg
        .ops
        .iter()
        .map(|op| {
            Ok(match op {
                RewriteOpConfig::SetHeader(line) => RewriteOp::SetHeader(line.clone()),
                RewriteOpConfig::DeleteHeader(pat) => {
                    RewriteOp::DeleteHeader(Matcher::compile(pat, ctx.regex_type, true)?)
                }
                RewriteOpConfig::SetUrl(t) => RewriteOp::SetUrl(t.clone()),
                RewriteOpConfig::SetPath(t) => RewriteOp::SetPath(t.clone()),
                RewriteOpConfig::SetQuery(t) => RewriteOp::SetQuery(t.clone()),
                RewriteOpConfig::SetQueryParam { name, value } => RewriteOp::SetQueryParam {
                    name: name.clone(),
                    value: value.clone(),
                },
                RewriteOpConfig::Sub(sub) => RewriteOp::Sub(build_rewrite(sub, ctx, locus)?),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let else_branch = cfg
        .else_branch
        .as_ref()
        .map(|e| build_rewrite(e, ctx, locus).map(Box::new))
        .transpose()?;
    Ok(RewriteRule { cond, ops, else_branch })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_path;
    use std::io::Write;

    fn build(text: &str) -> Result<Arc<Core>> {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(text.as_bytes()).expect("write config");
        let cfg = load_from_path(f.path())?;
        build_core(&cfg, true)
    }

    #[test]
    fn builds_minimal_graph() {
        let core = build(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 0

            [[listener.service]]
            name = "web"
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            priority = 5
            "#,
        )
        .expect("core builds");
        assert_eq!(core.listeners.len(), 1);
        let services = core.listeners[0].service_list();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].normal.tot_pri(), 5);
    }

    #[test]
    fn emergency_backends_get_their_own_group() {
        let core = build(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 0
            [[listener.service]]
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            [[listener.service.backend]]
            address = "127.0.0.1:9100"
            emergency = true
            "#,
        )
        .expect("core builds");
        let services = core.listeners[0].service_list();
        assert!(services[0].emergency.is_some());
    }

    #[test]
    fn named_backend_reference_resolves() {
        let core = build(
            r#"
            [backend.pool]
            address = "127.0.0.1:9000"
            priority = 7

            [[listener]]
            address = "127.0.0.1"
            port = 0
            [[listener.service]]
            [[listener.service.backend]]
            use = "pool"
            "#,
        )
        .expect("core builds");
        let services = core.listeners[0].service_list();
        assert_eq!(services[0].normal.tot_pri(), 7);
    }

    #[test]
    fn unknown_named_backend_is_fatal() {
        let err = build(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 0
            [[listener.service]]
            [[listener.service.backend]]
            use = "nope"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown named backend"));
    }

    #[test]
    fn redirect_template_uri_detection() {
        assert!(template_refs_uri("https://x/$1"));
        assert!(!template_refs_uri("https://x/plain"));
        assert!(!template_refs_uri("price $$10"));
    }

    #[test]
    fn control_section_adds_unix_listener() {
        let core = build(
            r#"
            control = { socket = "/tmp/portico-test.ctl" }

            [[listener]]
            address = "127.0.0.1"
            port = 0
            [[listener.service]]
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            "#,
        )
        .expect("core builds");
        assert_eq!(core.listeners.len(), 2);
        assert!(matches!(core.listeners[1].bind, BindAddr::Unix(_)));
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        let err = build(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 0
            [[listener.service]]
            match = { url = "(unclosed" }
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }
}
