use std::path::Path;

use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use sha1::Sha1;
use tracing::warn;

use crate::error::{ProxyError, Result};

/// An Apache htpasswd-style credential file, loaded once at configuration
/// time. Lookup and verification happen per request on the matching path.
///
/// Supported hash families, selected by prefix: `$apr1$` (APR MD5),
/// `$2y$`/`$2a$`/`$2b$` (bcrypt), `{SHA}` (base64 SHA1), and plain text.
/// Classic crypt(3) DES entries are not supported and fail verification.
#[derive(Debug)]
pub struct PasswdFile {
    path: String,
    users: AHashMap<String, String>,
}

impl PasswdFile {
    pub fn load(path: &Path) -> Result<PasswdFile> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("can't read password file {}: {e}", path.display()))
        })?;
        let mut users = AHashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, hash)) = line.split_once(':') {
                users.insert(user.to_string(), hash.to_string());
            }
        }
        Ok(PasswdFile { path: path.display().to_string(), users })
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &str)]) -> PasswdFile {
        PasswdFile {
            path: "(test)".into(),
            users: entries
                .iter()
                .map(|(u, h)| (u.to_string(), h.to_string()))
                .collect(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        match self.users.get(user) {
            Some(hash) => verify_hash(password, hash),
            None => false,
        }
    }
}

fn verify_hash(password: &str, hash: &str) -> bool {
    if let Some(rest) = hash.strip_prefix("$apr1$") {
        let salt = rest.split('$').next().unwrap_or("");
        return apr1_crypt(password.as_bytes(), salt.as_bytes()) == hash;
    }
    if hash.starts_with("$2y$") || hash.starts_with("$2a$") || hash.starts_with("$2b$") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }
    if let Some(encoded) = hash.strip_prefix("{SHA}") {
        let digest = Sha1::digest(password.as_bytes());
        return BASE64.encode(digest) == encoded;
    }
    if hash.starts_with('$') || (hash.len() == 13 && !hash.contains(':')) {
        // crypt(3)-style entry we can't evaluate
        warn!(hash_prefix = %&hash[..hash.len().min(4)], "unsupported password hash family");
        return false;
    }
    // plain text entry
    constant_time_eq(password.as_bytes(), hash.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

const TO64_ALPHABET: &[u8; 64] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn to64(mut v: u32, n: usize, out: &mut String) {
    for _ in 0..n {
        out.push(TO64_ALPHABET[(v & 0x3f) as usize] as char);
        v >>= 6;
    }
}

/// The APR1 variant of MD5 crypt, as produced by `htpasswd -m`.
fn apr1_crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(8)];

    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(b"$apr1$");
    ctx.update(salt);

    let mut alt = Md5::new();
    alt.update(password);
    alt.update(salt);
    alt.update(password);
    let alt_sum = alt.finalize();

    let mut n = password.len();
    while n > 0 {
        ctx.update(&alt_sum[..n.min(16)]);
        n = n.saturating_sub(16);
    }

    let mut n = password.len();
    while n > 0 {
        if n & 1 != 0 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        n >>= 1;
    }

    let mut digest = ctx.finalize();

    for round in 0..1000 {
        let mut c = Md5::new();
        if round & 1 != 0 {
            c.update(password);
        } else {
            c.update(digest);
        }
        if round % 3 != 0 {
            c.update(salt);
        }
        if round % 7 != 0 {
            c.update(password);
        }
        if round & 1 != 0 {
            c.update(digest);
        } else {
            c.update(password);
        }
        digest = c.finalize();
    }

    let mut out = format!("$apr1${}$", String::from_utf8_lossy(salt));
    let d = &digest;
    for &(a, b, c) in &[(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let v = ((d[a] as u32) << 16) | ((d[b] as u32) << 8) | d[c] as u32;
        to64(v, 4, &mut out);
    }
    to64(d[11] as u32, 2, &mut out);
    out
}

/// Extract the user name (and password) from a Basic Authorization header
/// value. Returns `None` for non-Basic schemes or undecodable payloads.
pub fn basic_credentials(hdrval: &str) -> Option<(String, String)> {
    let rest = hdrval.strip_prefix("Basic").or_else(|| hdrval.strip_prefix("basic"))?;
    let mut token = rest.trim();
    // some agents quote the token
    if let Some(t) = token.strip_prefix('"') {
        token = t.strip_suffix('"').unwrap_or(t);
    }
    let decoded = BASE64.decode(token.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
