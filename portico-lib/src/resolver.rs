use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{
    AddrFamily, Backend, BackendAddr, BackendKind, BackendTls, MatrixBackend, RegularBackend,
};
use crate::core::Core;
use crate::error::{ProxyError, Result};
use crate::service::Service;
use crate::tls::build_backend_connector;

/// Shortest pause between driver passes.
const MIN_TICK: Duration = Duration::from_secs(1);

pub fn system_resolver() -> Result<TokioAsyncResolver> {
    TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| ProxyError::Dns(format!("resolver setup: {e}")))
}

fn family_allows(family: AddrFamily, ip: &IpAddr) -> bool {
    match family {
        AddrFamily::Any => true,
        AddrFamily::V4 => ip.is_ipv4(),
        AddrFamily::V6 => ip.is_ipv6(),
    }
}

/// One resolved address a matrix should currently have a child for.
struct Desired {
    addr: SocketAddr,
    priority: u32,
}

async fn resolve_matrix(
    resolver: &TokioAsyncResolver,
    matrix: &MatrixBackend,
) -> Result<(Vec<Desired>, Option<std::time::Instant>)> {
    use crate::backend::ResolveMode;

    match matrix.mode {
        ResolveMode::First | ResolveMode::All => {
            let lookup = resolver
                .lookup_ip(matrix.hostname.as_str())
                .await
                .map_err(|e| ProxyError::Dns(format!("{}: {e}", matrix.hostname)))?;
            let valid_until = Some(lookup.as_lookup().valid_until());
            let mut desired: Vec<Desired> = lookup
                .iter()
                .filter(|ip| family_allows(matrix.family, ip))
                .map(|ip| Desired {
                    addr: SocketAddr::new(ip, matrix.port),
                    priority: matrix.template.priority,
                })
                .collect();
            if matrix.mode == ResolveMode::First {
                desired.truncate(1);
            }
            Ok((desired, valid_until))
        }
        ResolveMode::Srv => {
            let lookup = resolver
                .srv_lookup(matrix.hostname.as_str())
                .await
                .map_err(|e| ProxyError::Dns(format!("SRV {}: {e}", matrix.hostname)))?;
            let valid_until = Some(lookup.as_lookup().valid_until());
            let mut desired = Vec::new();
            for srv in lookup.iter() {
                let target = srv.target().to_utf8();
                let port = srv.port();
                // SRV weight seeds the child's priority on the 0..9 scale
                let priority = u32::from(srv.weight()).clamp(1, 9);
                match resolver.lookup_ip(target.as_str()).await {
                    Ok(ips) => {
                        for ip in ips.iter().filter(|ip| family_allows(matrix.family, ip)) {
                            desired.push(Desired {
                                addr: SocketAddr::new(ip, port),
                                priority,
                            });
                        }
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "SRV target lookup failed");
                    }
                }
            }
            Ok((desired, valid_until))
        }
    }
}

fn make_child(matrix: &MatrixBackend, desired: &Desired) -> Arc<Backend> {
    let tls = if matrix.template.https {
        rustls_pki_types::ServerName::try_from(matrix.hostname.clone())
            .ok()
            .map(|servername| BackendTls {
                connector: build_backend_connector(),
                servername,
            })
    } else {
        None
    };
    let mut be = Backend::new(
        BackendKind::Regular(RegularBackend {
            addr: BackendAddr::Inet(desired.addr),
            alive: AtomicBool::new(true),
            timeout: matrix.template.timeout,
            conn_timeout: matrix.template.conn_timeout,
            ws_timeout: matrix.template.ws_timeout,
            tls,
        }),
        desired.priority,
        format!("dynamic:{}", matrix.hostname),
    );
    be.dynamic = true;
    Arc::new(be)
}

/// Reconcile one matrix against a fresh answer set: create children for
/// new addresses, retire children whose address disappeared. Retired
/// children are disabled and dropped from the group; in-flight requests
/// keep them alive until the last reference drops.
fn apply_diff(svc: &Arc<Service>, matrix_be: &Arc<Backend>, desired: &[Desired]) {
    let BackendKind::Matrix(matrix) = &matrix_be.kind else {
        return;
    };
    let mut children = matrix.children.write().expect("matrix children lock");

    let mut keep: Vec<Arc<Backend>> = Vec::new();
    for child in children.iter() {
        let addr = child.regular().map(|r| r.addr.clone());
        let still_wanted = addr
            .as_ref()
            .is_some_and(|a| desired.iter().any(|d| BackendAddr::Inet(d.addr) == *a));
        if still_wanted {
            keep.push(Arc::clone(child));
        } else {
            child.set_disabled(true);
            svc.normal.remove(child);
            info!(service = svc.display_name(), backend = %child.label(), "resolver retired backend");
        }
    }

    for d in desired {
        let exists = keep
            .iter()
            .any(|c| c.regular().map(|r| &r.addr) == Some(&BackendAddr::Inet(d.addr)));
        if !exists {
            let child = make_child(matrix, d);
            info!(service = svc.display_name(), backend = %child.label(), "resolver added backend");
            svc.normal.add(Arc::clone(&child));
            keep.push(child);
        }
    }

    *children = keep;
}

fn collect_matrices(core: &Arc<Core>) -> Vec<(Arc<Service>, Arc<Backend>)> {
    let mut out = Vec::new();
    for listener in &core.listeners {
        for svc in listener.service_list().iter() {
            for m in &svc.matrices {
                out.push((Arc::clone(svc), Arc::clone(m)));
            }
        }
    }
    out
}

/// The resolver driver: periodically expands every matrix backend,
/// bounded by the answer TTL and the configured retry interval.
pub async fn run(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    let resolver = match system_resolver() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "resolver unavailable, dynamic backends disabled");
            return;
        }
    };

    let mut next_due: HashMap<usize, Instant> = HashMap::new();
    loop {
        let matrices = collect_matrices(&core);
        let now = Instant::now();
        let mut wake = now + Duration::from_secs(30);

        for (svc, matrix_be) in &matrices {
            let key = Arc::as_ptr(matrix_be) as usize;
            let due = next_due.get(&key).copied().unwrap_or(now);
            if due > now {
                wake = wake.min(due);
                continue;
            }
            let BackendKind::Matrix(matrix) = &matrix_be.kind else {
                continue;
            };
            let retry = matrix.retry_interval;
            let mut next = now + retry;
            match resolve_matrix(&resolver, matrix).await {
                Ok((desired, valid_until)) => {
                    debug!(hostname = %matrix.hostname, answers = desired.len(), "matrix resolved");
                    apply_diff(svc, matrix_be, &desired);
                    if let Some(vu) = valid_until {
                        let ttl_wake = Instant::from_std(vu);
                        next = next.min(ttl_wake.max(now + MIN_TICK));
                    }
                }
                Err(e) => {
                    warn!(hostname = %matrix.hostname, error = %e, "matrix resolution failed");
                }
            }
            next_due.insert(key, next);
            wake = wake.min(next);
        }

        // forget matrices that vanished in a reload
        let live: std::collections::HashSet<usize> = matrices
            .iter()
            .map(|(_, m)| Arc::as_ptr(m) as usize)
            .collect();
        next_due.retain(|k, _| live.contains(k));

        let sleep_for = wake.saturating_duration_since(Instant::now()).max(MIN_TICK);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
