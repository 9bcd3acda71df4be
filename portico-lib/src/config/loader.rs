use std::path::Path;

use crate::config::root::RootConfig;
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<RootConfig> {
    let txt = std::fs::read_to_string(&p).map_err(|e| {
        ProxyError::Config(format!(
            "can't read config file {}: {e}",
            p.as_ref().display()
        ))
    })?;
    let cfg: RootConfig = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("{}: {e}", p.as_ref().display())))?;

    validate(&cfg)?;

    Ok(cfg)
}

fn validate(cfg: &RootConfig) -> Result<()> {
    if cfg.listeners.is_empty() && cfg.control.is_none() {
        return Err(ProxyError::Config("no listeners configured".into()));
    }
    if cfg.worker_max_count < cfg.worker_min_count {
        return Err(ProxyError::Config(
            "worker_max_count below worker_min_count".into(),
        ));
    }

    for (li, l) in cfg.listeners.iter().enumerate() {
        let locus = format!("listener[{li}]");
        let binds =
            usize::from(l.address.is_some()) + usize::from(l.socket_from.is_some());
        if binds != 1 {
            return Err(ProxyError::at(
                &locus,
                "exactly one of address and socket_from is required",
            ));
        }
        if let Some(addr) = &l.address {
            if !addr.starts_with('/') && l.port.is_none() {
                return Err(ProxyError::at(&locus, "inet listener without a port"));
            }
        }
        if l.verb > 4 {
            return Err(ProxyError::at(&locus, "verb group out of range (0..4)"));
        }
        if l.no_https_11 > 2 {
            return Err(ProxyError::at(&locus, "no_https_11 out of range (0..2)"));
        }
        if l.rewrite_location > 2 {
            return Err(ProxyError::at(&locus, "rewrite_location out of range (0..2)"));
        }
        if let Some(tls) = &l.tls {
            if tls.client_cert > 3 {
                return Err(ProxyError::at(&locus, "client_cert out of range (0..3)"));
            }
            if tls.client_cert > 0 && tls.ca_list.is_none() {
                return Err(ProxyError::at(&locus, "client_cert requires ca_list"));
            }
        }
        for key in l.errors.keys() {
            let code: u16 = key
                .parse()
                .map_err(|_| ProxyError::at(&locus, format!("bad error code {key:?}")))?;
            if crate::http::reply::HttpStatus::from_code(code).is_none() {
                return Err(ProxyError::at(
                    &locus,
                    format!("no built-in error page for status {code}"),
                ));
            }
        }

        let mut names: Vec<&str> = Vec::new();
        for (si, s) in l.services.iter().enumerate() {
            let locus = format!("{locus}.service[{si}]");
            if let Some(name) = s.name.as_deref() {
                if names.contains(&name) {
                    return Err(ProxyError::at(&locus, format!("duplicate service name {name:?}")));
                }
                names.push(name);
            }
            if s.backends.is_empty() {
                return Err(ProxyError::at(&locus, "service without backends"));
            }
            if let Some(sess) = &s.session {
                use crate::session::SessionKind;
                let needs_id = matches!(
                    sess.kind,
                    SessionKind::Cookie | SessionKind::Url | SessionKind::Header
                );
                if needs_id && sess.id.is_empty() {
                    return Err(ProxyError::at(&locus, "session type requires an id"));
                }
                if sess.ttl == 0 {
                    return Err(ProxyError::at(&locus, "session ttl must be positive"));
                }
            }
            for (bi, b) in s.backends.iter().enumerate() {
                validate_backend(b, &format!("{locus}.backend[{bi}]"))?;
            }
        }
    }

    for (name, backend) in &cfg.named_backends {
        if backend.use_named.is_some() {
            return Err(ProxyError::Config(format!(
                "named backend {name:?} can't itself be a reference"
            )));
        }
        validate_backend(backend, &format!("backend {name:?}"))?;
    }

    Ok(())
}

fn validate_backend(b: &crate::config::backend::BackendConfig, locus: &str) -> Result<()> {
    let kinds = usize::from(b.address.is_some())
        + usize::from(b.hostname.is_some())
        + usize::from(b.use_named.is_some())
        + usize::from(b.redirect.is_some())
        + usize::from(b.error.is_some())
        + usize::from(b.acme.is_some())
        + usize::from(b.control)
        + usize::from(b.metrics);
    if kinds != 1 {
        return Err(ProxyError::at(
            locus,
            "exactly one backend kind (address/hostname/use/redirect/error/acme/control/metrics) is required",
        ));
    }
    if let Some(code) = b.redirect {
        if !matches!(code, 301 | 302 | 303 | 307 | 308) {
            return Err(ProxyError::at(locus, format!("bad redirect status {code}")));
        }
        if b.url.is_none() {
            return Err(ProxyError::at(locus, "redirect requires a url template"));
        }
    }
    if let Some(code) = b.error {
        if crate::http::reply::HttpStatus::from_code(code).is_none() || code < 400 {
            return Err(ProxyError::at(locus, format!("bad error status {code}")));
        }
    }
    if b.hostname.is_some() && b.port.is_none() && b.resolve != super::ResolveModeConfig::Srv {
        return Err(ProxyError::at(locus, "hostname backend without a port"));
    }
    if b.priority > 9 {
        return Err(ProxyError::at(locus, "priority out of range (0..9)"));
    }
    if b.emergency && b.hostname.is_some() && b.resolve != super::ResolveModeConfig::Immediate {
        return Err(ProxyError::at(
            locus,
            "dynamic backends can't be emergency members",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(text: &str) -> Result<RootConfig> {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(text.as_bytes()).expect("write config");
        load_from_path(f.path())
    }

    #[test]
    fn minimal_config_loads() {
        let cfg = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080

            [[listener.service]]
            name = "web"

            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            "#,
        )
        .expect("config loads");
        assert_eq!(cfg.listeners.len(), 1);
        assert_eq!(cfg.listeners[0].services[0].backends.len(), 1);
        assert_eq!(cfg.worker_min_count, 5);
    }

    #[test]
    fn rejects_service_without_backends() {
        let err = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080
            [[listener.service]]
            name = "empty"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("without backends"));
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let err = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080
            [[listener.service]]
            name = "dup"
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            [[listener.service]]
            name = "dup"
            [[listener.service.backend]]
            address = "127.0.0.1:9001"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate service name"));
    }

    #[test]
    fn rejects_ambiguous_backend() {
        let err = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080
            [[listener.service]]
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            redirect = 301
            url = "https://x/"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one backend kind"));
    }

    #[test]
    fn rejects_bad_redirect_code() {
        let err = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080
            [[listener.service]]
            [[listener.service.backend]]
            redirect = 305
            url = "https://x/"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad redirect status"));
    }

    #[test]
    fn rejects_cookie_session_without_id() {
        let err = load(
            r#"
            [[listener]]
            address = "127.0.0.1"
            port = 8080
            [[listener.service]]
            session = { type = "cookie", ttl = 60 }
            [[listener.service.backend]]
            address = "127.0.0.1:9000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires an id"));
    }

    #[test]
    fn sessions_and_rewrites_parse() {
        let cfg = load(
            r#"
            regex_type = "pcre"

            [[acl]]
            name = "office"
            cidr = ["10.0.0.0/8"]

            [[listener]]
            address = "127.0.0.1"
            port = 8443
            tls = { certs = ["/etc/portico/site.pem"] }
            ssl_headers = true

            [[listener.rewrite]]
            ops = [{ delete_header = "^X-Forwarded-Proto:" }, { set_header = "X-Forwarded-Proto: https" }]

            [[listener.service]]
            name = "app"
            match = { host = "app\\.example\\.org", acl = "office" }
            session = { type = "cookie", ttl = 300, id = "JSID" }
            algo = "iwrr"

            [[listener.service.backend]]
            address = "10.0.0.10:8000"
            priority = 7

            [[listener.service.backend]]
            address = "10.0.0.11:8000"
            emergency = true
            "#,
        )
        .expect("config loads");
        let svc = &cfg.listeners[0].services[0];
        assert!(svc.session.is_some());
        assert_eq!(svc.backends.len(), 2);
        assert!(svc.backends[1].emergency);
        assert_eq!(cfg.listeners[0].rewrites[0].ops.len(), 2);
    }
}
