use std::io;
use std::path::Path;

use tracing::{error, warn};

use crate::http::io::Conn;
use crate::http::request::{encode_url_strict, Request};
use crate::matcher::Captures;
use crate::routing::rewrite::expand_template;

/// Listener-observable failure categories; each may carry a configured
/// body, else the built-in HTML one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    Ok,
    BadRequest,
    NotFound,
    PayloadTooLarge,
    UriTooLong,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl HttpStatus {
    pub fn code(self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::BadRequest => 400,
            HttpStatus::NotFound => 404,
            HttpStatus::PayloadTooLarge => 413,
            HttpStatus::UriTooLong => 414,
            HttpStatus::InternalServerError => 500,
            HttpStatus::NotImplemented => 501,
            HttpStatus::ServiceUnavailable => 503,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::PayloadTooLarge => "Payload Too Large",
            HttpStatus::UriTooLong => "URI Too Long",
            HttpStatus::InternalServerError => "Internal Server Error",
            HttpStatus::NotImplemented => "Not Implemented",
            HttpStatus::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn from_code(code: u16) -> Option<HttpStatus> {
        Some(match code {
            200 => HttpStatus::Ok,
            400 => HttpStatus::BadRequest,
            404 => HttpStatus::NotFound,
            413 => HttpStatus::PayloadTooLarge,
            414 => HttpStatus::UriTooLong,
            500 => HttpStatus::InternalServerError,
            501 => HttpStatus::NotImplemented,
            503 => HttpStatus::ServiceUnavailable,
            _ => return None,
        })
    }

    fn default_body(self) -> String {
        format!(
            "<html><head><title>{text}</title></head><body><h1>{code} {text}</h1></body></html>",
            code = self.code(),
            text = self.text()
        )
    }
}

/// Write an error response. Always HTTP/1.0 with an explicit length and
/// cache-defeating headers, like every terminal reply we synthesize.
pub async fn err_reply(conn: &mut Conn, status: HttpStatus, body: Option<&str>) {
    let body = match body {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => status.default_body(),
    };
    let head = format!(
        "HTTP/1.0 {} {}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Expires: now\r\n\
         Pragma: no-cache\r\n\
         Cache-control: no-cache,no-store\r\n\
         \r\n",
        status.code(),
        status.text(),
        body.len()
    );
    if let Err(e) = write_reply(conn, &head, body.as_bytes()).await {
        warn!(error = %e, "error reply write failed");
    }
}

async fn write_reply(conn: &mut Conn, head: &str, body: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    conn.write_all(&out).await?;
    conn.flush().await
}

fn redirect_text(code: u16) -> &'static str {
    match code {
        301 => "Moved Permanently",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        _ => "Found",
    }
}

/// Answer a redirect backend: expand the target template, percent-encode
/// it defensively, and send a small HTML body referencing it.
pub async fn redirect_reply(
    conn: &mut Conn,
    req: &Request,
    code: u16,
    template: &str,
    has_uri: bool,
    caps: &Captures,
) -> HttpStatus {
    let mut target = expand_template(template, caps);
    if !has_uri {
        // a plain target inherits the original URL
        target.push_str(&req.url);
    }
    let url = encode_url_strict(&target);

    let body = format!(
        "<html><head><title>Redirect</title></head><body><h1>Redirect</h1>\
         <p>You should go to <a href=\"{url}\">{url}</a></p></body></html>"
    );
    let head = format!(
        "HTTP/1.0 {} {}\r\n\
         Location: {}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\r\n",
        code,
        redirect_text(code),
        url,
        body.len()
    );
    if let Err(e) = write_reply(conn, &head, body.as_bytes()).await {
        warn!(error = %e, "redirect reply write failed");
    }
    HttpStatus::Ok
}

/// Serve an ACME challenge file from the configured directory. The
/// capture from the challenge pattern names the file; anything that could
/// escape the directory is refused.
pub async fn acme_reply(conn: &mut Conn, directory: &Path, caps: &Captures) -> HttpStatus {
    let name = match caps.get(1).and_then(|c| c.as_deref()) {
        Some(n) if !n.is_empty() && !n.contains('/') && !n.contains("..") => n,
        _ => return HttpStatus::NotFound,
    };
    let path = directory.join(name);
    let content = match tokio::fs::read(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HttpStatus::NotFound,
        Err(e) => {
            error!(path = %path.display(), error = %e, "can't read challenge file");
            return HttpStatus::InternalServerError;
        }
    };
    let head = format!(
        "HTTP/1.0 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\r\n",
        content.len()
    );
    if let Err(e) = write_reply(conn, &head, &content).await {
        warn!(error = %e, "acme reply write failed");
    }
    HttpStatus::Ok
}
