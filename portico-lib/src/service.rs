use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::acl::Acl;
use crate::backend::Backend;
use crate::balance::BalancerGroup;
use crate::http::request::{Request, Response};
use crate::matcher::Captures;
use crate::routing::cond::Cond;
use crate::routing::rewrite::RewriteRule;
use crate::session::{self, SessionPolicy, SessionTable};

/// A match condition, a balancer pair, rewrite chains, and a session
/// policy. The emergency group is consulted only when the normal group
/// has no live member.
#[derive(Debug)]
pub struct Service {
    pub name: Option<String>,
    pub cond: Cond,
    pub rewrite_request: Vec<RewriteRule>,
    pub rewrite_response: Vec<RewriteRule>,
    pub normal: BalancerGroup,
    pub emergency: Option<BalancerGroup>,
    /// Matrix templates whose children live in the normal group.
    pub matrices: Vec<Arc<Backend>>,
    pub session_policy: Option<SessionPolicy>,
    pub sessions: Option<SessionTable>,
    /// Override of the listener's forwarded-for header name.
    pub forwarded_header: Option<String>,
    pub trusted_ips: Option<Acl>,
    pub log_suppress: bool,
    pub disabled: AtomicBool,
    pub locus: String,
}

impl Service {
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, v: bool) {
        self.disabled.store(v, Ordering::Relaxed);
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("-")
    }

    /// Does this service accept the request? Fills the capture vector on
    /// success.
    pub fn matches(&self, req: &Request, peer: Option<IpAddr>, caps: &mut Captures) -> bool {
        !self.is_disabled() && self.cond.eval(req, peer, caps)
    }

    /// Sticky lookup first, then the balancer. Request-keyed session
    /// policies insert their mapping at selection time.
    pub fn select_backend(&self, req: &Request, peer: Option<IpAddr>) -> Option<Arc<Backend>> {
        let key = self
            .session_policy
            .as_ref()
            .and_then(|p| session::key_from_request(p, req, peer));

        if let (Some(key), Some(table)) = (key.as_deref(), self.sessions.as_ref()) {
            if let Some(be) = table.lookup(key) {
                debug!(service = self.display_name(), key, "session hit");
                return Some(be);
            }
        }

        let group = if self.normal.has_live() {
            &self.normal
        } else {
            match &self.emergency {
                Some(g) if g.has_live() => {
                    info!(service = self.display_name(), "using emergency backends");
                    g
                }
                _ => &self.normal,
            }
        };
        let be = group.select()?;

        if let (Some(policy), Some(table), Some(key)) =
            (self.session_policy.as_ref(), self.sessions.as_ref(), key.as_deref())
        {
            if !policy.keyed_on_response() {
                table.insert(key, &be);
            }
        }
        Some(be)
    }

    /// Record the session mapping carried back by a response, for the
    /// cookie and header policies.
    pub fn note_response(&self, resp: &Response, backend: &Arc<Backend>) {
        if let (Some(policy), Some(table)) = (self.session_policy.as_ref(), self.sessions.as_ref())
        {
            if policy.keyed_on_response() {
                if let Some(key) = session::key_from_response(policy, resp) {
                    table.insert(&key, backend);
                }
            }
        }
    }

    /// Mark a backend dead after an unretryable failure and restore the
    /// priority sums.
    pub fn kill_backend(&self, be: &Arc<Backend>) {
        info!(
            service = self.display_name(),
            backend = %be.label(),
            "marking backend dead"
        );
        be.set_alive(false);
        self.normal.recompute();
        if let Some(g) = &self.emergency {
            g.recompute();
        }
    }

    /// Upper bound for connect retries: one attempt per group member.
    pub fn retry_budget(&self) -> usize {
        let mut n = self.normal.backends().len();
        if let Some(g) = &self.emergency {
            n += g.backends().len();
        }
        n.max(1)
    }

    /// Expunge dead sessions; called by the sweeper task.
    pub fn sweep_sessions(&self, now: std::time::Instant) {
        if let Some(table) = &self.sessions {
            table.sweep(now);
        }
    }
}
