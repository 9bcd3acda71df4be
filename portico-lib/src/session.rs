use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use serde::Deserialize;

use crate::backend::Backend;
use crate::http::request::{Request, Response};

/// What part of a request pins a client to a backend.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Peer address, /24 for IPv4 and /64 for IPv6.
    Ip,
    /// Sub-cookie named by `id` (request `Cookie:`, response `Set-Cookie:`).
    Cookie,
    /// Query parameter named by `id`.
    Url,
    /// `;`-delimited path parameter named by `id`.
    Parm,
    /// Authenticated Basic user name.
    Basic,
    /// Header named by `id`.
    Header,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub kind: SessionKind,
    pub ttl: Duration,
    pub id: String,
}

impl SessionPolicy {
    /// True when the mapping is inserted when a response routes through
    /// a backend (the ID travels in response headers), rather than on
    /// first selection.
    pub fn keyed_on_response(&self) -> bool {
        matches!(self.kind, SessionKind::Cookie | SessionKind::Header)
    }
}

#[derive(Debug)]
struct Entry {
    backend: Weak<Backend>,
    last_seen: Instant,
}

/// Session key to backend mapping with TTL eviction. Lookup refreshes the
/// TTL; entries pointing at dead, disabled, or dropped backends are
/// expunged lazily.
#[derive(Debug)]
pub struct SessionTable {
    ttl: Duration,
    map: Mutex<AHashMap<String, Entry>>,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> SessionTable {
        SessionTable { ttl, map: Mutex::new(AHashMap::new()) }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Backend>> {
        let mut map = self.map.lock().expect("session lock");
        let entry = map.get_mut(key)?;
        if entry.last_seen.elapsed() > self.ttl {
            map.remove(key);
            return None;
        }
        match entry.backend.upgrade() {
            Some(be) if be.eligible() => {
                entry.last_seen = Instant::now();
                Some(be)
            }
            _ => {
                map.remove(key);
                None
            }
        }
    }

    pub fn insert(&self, key: &str, be: &Arc<Backend>) {
        let mut map = self.map.lock().expect("session lock");
        map.insert(
            key.to_string(),
            Entry { backend: Arc::downgrade(be), last_seen: Instant::now() },
        );
    }

    /// Drop entries idle longer than the TTL.
    pub fn sweep(&self, now: Instant) {
        let mut map = self.map.lock().expect("session lock");
        let ttl = self.ttl;
        map.retain(|_, e| now.duration_since(e.last_seen) <= ttl && e.backend.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("session lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ip_key(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            o[..8].iter().map(|b| format!("{b:02x}")).collect()
        }
    }
}

fn sub_cookie(header_value: &str, name: &str) -> Option<String> {
    header_value.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Derive the session key from a request, per policy.
pub fn key_from_request(
    policy: &SessionPolicy,
    req: &Request,
    peer: Option<IpAddr>,
) -> Option<String> {
    match policy.kind {
        SessionKind::Ip => peer.map(ip_key),
        SessionKind::Basic => req.user.clone(),
        SessionKind::Url => req.query_param(&policy.id).map(str::to_string),
        SessionKind::Parm => req.path().split(';').skip(1).find_map(|seg| {
            match seg.split_once('=') {
                Some((k, v)) if k == policy.id => Some(v.to_string()),
                None if policy.id.is_empty() => Some(seg.to_string()),
                _ => None,
            }
        }),
        SessionKind::Cookie => req
            .headers
            .iter()
            .filter(|h| h.has_name("Cookie"))
            .find_map(|h| sub_cookie(h.value(), &policy.id)),
        SessionKind::Header => req.headers.named_value(&policy.id).map(str::to_string),
    }
}

/// Derive the session key carried back by a response (stateful cookie and
/// header policies only).
pub fn key_from_response(policy: &SessionPolicy, resp: &Response) -> Option<String> {
    match policy.kind {
        SessionKind::Cookie => resp
            .headers
            .iter()
            .filter(|h| h.has_name("Set-Cookie"))
            .find_map(|h| sub_cookie(h.value(), &policy.id)),
        SessionKind::Header => resp.headers.named_value(&policy.id).map(str::to_string),
        _ => None,
    }
}
