use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::core::Core;
use crate::http::io::Conn;
use crate::http::reply::HttpStatus;
use crate::http::request::{Method, Request};
use crate::service::Service;

/// Answer a request routed to a `control` backend.
///
/// `GET /` lists the listener/service/backend hierarchy as JSON.
/// `PUT /listener/N/service/M/backend/K` toggles that backend's
/// `disabled` flag (`/service/M` alone toggles the service).
/// `DELETE` on a backend path removes a dynamic (resolver-created)
/// backend.
pub async fn control_reply(conn: &mut Conn, req: &Request, core: &Arc<Core>) -> HttpStatus {
    match req.method {
        Method::Get => {
            let doc = listing(core);
            let body = doc.to_string();
            let head = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            let mut out = head.into_bytes();
            out.extend_from_slice(body.as_bytes());
            if conn.write_all(&out).await.is_err() || conn.flush().await.is_err() {
                warn!("control reply write failed");
            }
            HttpStatus::Ok
        }
        Method::Put => match locate(core, req.path()) {
            Some(Located::Backend(_, be)) => {
                let now = !be.is_disabled();
                be.set_disabled(now);
                info!(backend = %be.label(), disabled = now, "control toggled backend");
                refresh_groups(core);
                plain_ok(conn).await
            }
            Some(Located::Service(svc)) => {
                let now = !svc.is_disabled();
                svc.set_disabled(now);
                info!(service = svc.display_name(), disabled = now, "control toggled service");
                plain_ok(conn).await
            }
            None => HttpStatus::NotFound,
        },
        Method::Delete => match locate(core, req.path()) {
            Some(Located::Backend(svc, be)) => {
                if !be.dynamic {
                    return HttpStatus::BadRequest;
                }
                be.set_disabled(true);
                svc.normal.remove(&be);
                if let Some(g) = &svc.emergency {
                    g.remove(&be);
                }
                info!(backend = %be.label(), "control removed dynamic backend");
                plain_ok(conn).await
            }
            _ => HttpStatus::NotFound,
        },
        _ => HttpStatus::NotImplemented,
    }
}

async fn plain_ok(conn: &mut Conn) -> HttpStatus {
    let body = "done\n";
    let head = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    if conn.write_all(&out).await.is_err() || conn.flush().await.is_err() {
        warn!("control reply write failed");
    }
    HttpStatus::Ok
}

enum Located {
    Service(Arc<Service>),
    Backend(Arc<Service>, Arc<Backend>),
}

/// Resolve `/listener/N/service/M[/backend/K]` against the live graph.
/// Backend indexes span the normal group then the emergency group, the
/// order the listing shows.
fn locate(core: &Arc<Core>, path: &str) -> Option<Located> {
    let mut parts = path.split('/').filter(|s| !s.is_empty());
    if parts.next()? != "listener" {
        return None;
    }
    let l: usize = parts.next()?.parse().ok()?;
    if parts.next()? != "service" {
        return None;
    }
    let s: usize = parts.next()?.parse().ok()?;

    let listener = core.listeners.get(l)?;
    let services = listener.service_list();
    let svc = services.get(s)?.clone();

    match parts.next() {
        None => Some(Located::Service(svc)),
        Some("backend") => {
            let k: usize = parts.next()?.parse().ok()?;
            let be = service_backends(&svc).into_iter().nth(k)?;
            Some(Located::Backend(svc, be))
        }
        Some(_) => None,
    }
}

fn service_backends(svc: &Arc<Service>) -> Vec<Arc<Backend>> {
    let mut all = svc.normal.backends();
    if let Some(g) = &svc.emergency {
        all.extend(g.backends());
    }
    all
}

fn refresh_groups(core: &Arc<Core>) {
    for listener in &core.listeners {
        for svc in listener.service_list().iter() {
            svc.normal.recompute();
            if let Some(g) = &svc.emergency {
                g.recompute();
            }
        }
    }
}

fn listing(core: &Arc<Core>) -> serde_json::Value {
    let listeners: Vec<_> = core
        .listeners
        .iter()
        .map(|l| {
            let services: Vec<_> = l
                .service_list()
                .iter()
                .map(|svc| {
                    let backends: Vec<_> = service_backends(svc)
                        .iter()
                        .map(|be| {
                            json!({
                                "address": be.label(),
                                "priority": be.priority,
                                "alive": be.is_alive(),
                                "disabled": be.is_disabled(),
                                "dynamic": be.dynamic,
                            })
                        })
                        .collect();
                    json!({
                        "name": svc.display_name(),
                        "disabled": svc.is_disabled(),
                        "total_priority": svc.normal.tot_pri(),
                        "sessions": svc.sessions.as_ref().map(|t| t.len()).unwrap_or(0),
                        "backends": backends,
                    })
                })
                .collect();
            json!({
                "address": l.name(),
                "https": l.is_https(),
                "services": services,
            })
        })
        .collect();
    json!({ "listeners": listeners })
}

/// Answer a request routed to a `metrics` backend.
pub async fn metrics_reply(conn: &mut Conn, core: &Arc<Core>) -> HttpStatus {
    let body = core.metrics.render();
    let head = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body.as_bytes());
    if conn.write_all(&out).await.is_err() || conn.flush().await.is_err() {
        warn!("metrics reply write failed");
    }
    HttpStatus::Ok
}
