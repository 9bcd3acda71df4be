use crate::http::headers::{HeaderList, HeaderTag};

/// Request methods, grouped into safety classes. A listener's `verb`
/// setting caps the permitted group: 0 covers plain web traffic, 1 adds
/// mutation, 2 WebDAV, 3 extended/MS verbs, 4 the RPC-over-HTTP tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Patch,
    Delete,
    Lock,
    Unlock,
    Propfind,
    Proppatch,
    Search,
    Mkcol,
    Move,
    Copy,
    Options,
    Trace,
    Mkactivity,
    Checkout,
    Merge,
    Report,
    Subscribe,
    Unsubscribe,
    Bproppatch,
    Poll,
    Bmove,
    Bcopy,
    Bdelete,
    Bpropfind,
    Notify,
    Connect,
    RpcInData,
    RpcOutData,
}

const METHODS: &[(&str, Method, u8)] = &[
    ("GET", Method::Get, 0),
    ("POST", Method::Post, 0),
    ("HEAD", Method::Head, 0),
    ("PUT", Method::Put, 1),
    ("PATCH", Method::Patch, 1),
    ("DELETE", Method::Delete, 1),
    ("LOCK", Method::Lock, 2),
    ("UNLOCK", Method::Unlock, 2),
    ("PROPFIND", Method::Propfind, 2),
    ("PROPPATCH", Method::Proppatch, 2),
    ("SEARCH", Method::Search, 2),
    ("MKCOL", Method::Mkcol, 2),
    ("MOVE", Method::Move, 2),
    ("COPY", Method::Copy, 2),
    ("OPTIONS", Method::Options, 2),
    ("TRACE", Method::Trace, 2),
    ("MKACTIVITY", Method::Mkactivity, 2),
    ("CHECKOUT", Method::Checkout, 2),
    ("MERGE", Method::Merge, 2),
    ("REPORT", Method::Report, 2),
    ("SUBSCRIBE", Method::Subscribe, 3),
    ("UNSUBSCRIBE", Method::Unsubscribe, 3),
    ("BPROPPATCH", Method::Bproppatch, 3),
    ("POLL", Method::Poll, 3),
    ("BMOVE", Method::Bmove, 3),
    ("BCOPY", Method::Bcopy, 3),
    ("BDELETE", Method::Bdelete, 3),
    ("BPROPFIND", Method::Bpropfind, 3),
    ("NOTIFY", Method::Notify, 3),
    ("CONNECT", Method::Connect, 3),
    ("RPC_IN_DATA", Method::RpcInData, 4),
    ("RPC_OUT_DATA", Method::RpcOutData, 4),
];

impl Method {
    pub fn find(name: &str) -> Option<(Method, u8)> {
        METHODS
            .iter()
            .find(|(n, _, _)| name.eq_ignore_ascii_case(n))
            .map(|&(_, m, g)| (m, g))
    }

    pub fn name(&self) -> &'static str {
        METHODS
            .iter()
            .find(|(_, m, _)| m == self)
            .map(|&(n, _, _)| n)
            .unwrap_or("GET")
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode a URL. Decoding that yields a NUL byte rejects the
/// request; malformed escapes are passed through literally.
pub fn decode_url(src: &str) -> Option<String> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(&a), Some(&b)) = (bytes.get(i + 1), bytes.get(i + 2)) {
                if let (Some(hi), Some(lo)) = (hex_val(a), hex_val(b)) {
                    let v = (hi << 4) | lo;
                    if v == 0 {
                        return None;
                    }
                    out.push(v);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

const URL_SAFE: &[u8] = b"_.:/?&;-=~@$,!*'()+[]";

/// Percent-encode bytes outside the safe set. The inverse of
/// `decode_url` for strings that round-trip.
pub fn encode_url(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        if b.is_ascii_alphanumeric() || URL_SAFE.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

/// Percent-encode for redirect Location values: a narrower safe set, so
/// that expanded capture text cannot smuggle header-breaking characters.
pub fn encode_url_strict(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        if b.is_ascii_alphanumeric() || b"_.:/?&;-=".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

/// A parsed client request, recreated for each request on a persistent
/// connection.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request line exactly as received.
    pub line: String,
    pub method: Method,
    pub group: u8,
    /// Percent-decoded URL; the subject of matching and rewriting.
    pub url: String,
    /// URL as it will appear on the wire; replaced when a rewrite fires.
    wire_url: String,
    rewritten: bool,
    /// HTTP minor version (0 or 1).
    pub version: u8,
    pub headers: HeaderList,
    /// User name from a decodable Basic Authorization header.
    pub user: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    BadLine,
    BadMethod,
    MethodNotAllowed,
    BadUrl,
}

impl Request {
    /// Parse the request line against the listener's verb group cap.
    pub fn parse(line: String, headers: HeaderList, max_group: u8) -> Result<Request, ParseError> {
        let mut parts = line.split_ascii_whitespace();
        let method_txt = parts.next().ok_or(ParseError::BadLine)?;
        let url_txt = parts.next().ok_or(ParseError::BadLine)?;
        let ver_txt = parts.next().ok_or(ParseError::BadLine)?;
        if parts.next().is_some() {
            return Err(ParseError::BadLine);
        }

        let (method, group) = Method::find(method_txt).ok_or(ParseError::BadMethod)?;
        if group > max_group {
            return Err(ParseError::MethodNotAllowed);
        }

        let version = match ver_txt {
            "HTTP/1.0" => 0,
            "HTTP/1.1" => 1,
            _ => return Err(ParseError::BadLine),
        };

        let url = decode_url(url_txt).ok_or(ParseError::BadUrl)?;
        let wire_url = url_txt.to_string();

        Ok(Request {
            line,
            method,
            group,
            url,
            wire_url,
            rewritten: false,
            version,
            headers,
            user: None,
        })
    }

    /// The line to send to a backend: the original bytes unless a rewrite
    /// replaced the URL.
    pub fn request_line(&self) -> String {
        if self.rewritten {
            format!(
                "{} {} HTTP/1.{}",
                self.method.name(),
                self.wire_url,
                self.version
            )
        } else {
            self.line.clone()
        }
    }

    /// Install a rewritten URL: `decoded` is the matching/rewriting form,
    /// the wire form is re-encoded from it.
    pub fn set_url(&mut self, decoded: String) {
        self.wire_url = encode_url(&decoded);
        self.url = decoded;
        self.rewritten = true;
    }

    pub fn path(&self) -> &str {
        match self.url.find('?') {
            Some(q) => &self.url[..q],
            None => &self.url,
        }
    }

    pub fn query(&self) -> &str {
        match self.url.find('?') {
            Some(q) => &self.url[q + 1..],
            None => "",
        }
    }

    /// First query parameter with the given name.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query().split('&').find_map(|kv| {
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            (k == name).then_some(v)
        })
    }

    /// Canonical Host header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers.value_of(HeaderTag::Host)
    }
}

/// A backend's status line and headers.
#[derive(Debug, Clone)]
pub struct Response {
    pub line: String,
    pub status: u16,
    /// True when the backend answered with HTTP/1.1.
    pub http_11: bool,
    pub headers: HeaderList,
}

impl Response {
    pub fn parse(line: String, headers: HeaderList) -> Option<Response> {
        let rest = line.strip_prefix("HTTP/1.")?;
        let http_11 = rest.as_bytes().first() == Some(&b'1');
        if !matches!(rest.as_bytes().first(), Some(b'0') | Some(b'1')) {
            return None;
        }
        let status_txt = rest.get(2..5)?;
        let status: u16 = status_txt.parse().ok()?;
        Some(Response { line, status, http_11, headers })
    }

    pub fn informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Statuses that never carry a body. 100 is left out: it is dropped
    /// in its own read cycle and must not mark the exchange bodyless.
    pub fn no_content(&self) -> bool {
        (self.informational() && self.status != 100) || self.status == 204 || self.status == 304
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(line: &str) -> Result<Request, ParseError> {
        Request::parse(line.to_string(), HeaderList::new(), 4)
    }

    #[test]
    fn parses_simple_request() {
        let r = req("GET /foo HTTP/1.1").unwrap();
        assert_eq!(r.method, Method::Get);
        assert_eq!(r.url, "/foo");
        assert_eq!(r.version, 1);
        assert_eq!(r.request_line(), "GET /foo HTTP/1.1");
    }

    #[test]
    fn decodes_url_for_matching_but_forwards_raw() {
        let r = req("GET /a%20b/c%2Fd HTTP/1.0").unwrap();
        assert_eq!(r.url, "/a b/c/d");
        assert_eq!(r.request_line(), "GET /a%20b/c%2Fd HTTP/1.0");
    }

    #[test]
    fn rejects_nul_in_decoded_url() {
        assert_eq!(req("GET /a%00b HTTP/1.1").unwrap_err(), ParseError::BadUrl);
    }

    #[test]
    fn verb_group_cap() {
        assert!(Request::parse("DELETE /x HTTP/1.1".into(), HeaderList::new(), 0).is_err());
        assert!(Request::parse("DELETE /x HTTP/1.1".into(), HeaderList::new(), 1).is_ok());
        assert!(Request::parse("RPC_IN_DATA /x HTTP/1.1".into(), HeaderList::new(), 3).is_err());
    }

    #[test]
    fn rejects_unknown_method_and_version() {
        assert_eq!(req("FROB /x HTTP/1.1").unwrap_err(), ParseError::BadMethod);
        assert_eq!(req("GET /x HTTP/2.0").unwrap_err(), ParseError::BadLine);
        assert_eq!(req("GET /x").unwrap_err(), ParseError::BadLine);
    }

    #[test]
    fn rewrite_reencodes_wire_url() {
        let mut r = req("GET /old/x%20y HTTP/1.1").unwrap();
        r.set_url("/new/x y".to_string());
        assert_eq!(r.url, "/new/x y");
        assert_eq!(r.request_line(), "GET /new/x%20y HTTP/1.1");
    }

    #[test]
    fn path_query_split() {
        let r = req("GET /p/q?a=1&b=2 HTTP/1.1").unwrap();
        assert_eq!(r.path(), "/p/q");
        assert_eq!(r.query(), "a=1&b=2");
        assert_eq!(r.query_param("b"), Some("2"));
        assert_eq!(r.query_param("c"), None);
    }

    #[test]
    fn encode_decode_round_trip() {
        for u in ["/plain", "/with space", "/q?x=%&y=#frag", "/päth"] {
            assert_eq!(decode_url(&encode_url(u)).as_deref(), Some(u));
        }
    }

    #[test]
    fn parses_response_line() {
        let r = Response::parse("HTTP/1.1 200 OK".into(), HeaderList::new()).unwrap();
        assert_eq!(r.status, 200);
        assert!(r.http_11);
        assert!(!r.no_content());
        let r = Response::parse("HTTP/1.0 304 Not Modified".into(), HeaderList::new()).unwrap();
        assert!(!r.http_11);
        assert!(r.no_content());
        let r = Response::parse("HTTP/1.1 100 Continue".into(), HeaderList::new()).unwrap();
        assert!(r.informational());
        assert!(!r.no_content());
        assert!(Response::parse("ICY 200 OK".into(), HeaderList::new()).is_none());
    }
}
