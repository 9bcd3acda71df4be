use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::{ProxyError, Result};
use crate::http::request::Request;

/// One directive of a compiled access-log format.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOp {
    Lit(String),
    /// %a
    ClientAddr,
    /// %r
    RequestLine,
    /// %s and %>s
    Status,
    /// %u
    User,
    /// %t
    Time,
    /// %b
    Bytes,
    /// %{Name}i - empty when missing
    ReqHeader(String),
    /// %{Name}I - "-" when missing
    ReqHeaderDash(String),
    /// %{service}N / %{backend}N
    ServiceName,
    BackendName,
    /// %{f}T
    Duration,
}

/// A compiled access-log format. The canned formats `null`, `regular`,
/// `extended`, `vhost_combined`, `combined` and `detailed` correspond to
/// log levels 0 through 5.
#[derive(Debug, Clone)]
pub struct LogFormat {
    pub name: String,
    ops: Vec<LogOp>,
}

/// Everything one log line may mention.
pub struct LogContext<'a> {
    pub peer: &'a str,
    pub req: Option<&'a Request>,
    pub status: u16,
    pub bytes: u64,
    pub service: &'a str,
    pub backend: &'a str,
    pub when: DateTime<Local>,
    pub duration: Duration,
}

impl LogFormat {
    pub fn compile(name: &str, fmt: &str) -> Result<LogFormat> {
        let mut ops = Vec::new();
        let mut lit = String::new();
        let mut chars = fmt.chars().peekable();

        let bad = |what: &str| {
            ProxyError::Config(format!("log format {name:?}: unknown directive %{what}"))
        };

        while let Some(c) = chars.next() {
            if c != '%' {
                lit.push(c);
                continue;
            }
            let op = match chars.next() {
                Some('%') => {
                    lit.push('%');
                    continue;
                }
                Some('a') => LogOp::ClientAddr,
                Some('r') => LogOp::RequestLine,
                Some('s') => LogOp::Status,
                Some('u') => LogOp::User,
                Some('t') => LogOp::Time,
                Some('b') => LogOp::Bytes,
                Some('>') => match chars.next() {
                    Some('s') => LogOp::Status,
                    other => return Err(bad(&format!(">{}", other.unwrap_or(' ')))),
                },
                Some('{') => {
                    let mut arg = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        arg.push(c);
                    }
                    match chars.next() {
                        Some('i') => LogOp::ReqHeader(arg),
                        Some('I') => LogOp::ReqHeaderDash(arg),
                        Some('N') if arg == "service" => LogOp::ServiceName,
                        Some('N') if arg == "backend" => LogOp::BackendName,
                        Some('T') => LogOp::Duration,
                        other => {
                            return Err(bad(&format!("{{{arg}}}{}", other.unwrap_or(' '))))
                        }
                    }
                }
                other => return Err(bad(&other.map(String::from).unwrap_or_default())),
            };
            if !lit.is_empty() {
                ops.push(LogOp::Lit(std::mem::take(&mut lit)));
            }
            ops.push(op);
        }
        if !lit.is_empty() {
            ops.push(LogOp::Lit(lit));
        }
        Ok(LogFormat { name: name.to_string(), ops })
    }

    /// The null format suppresses logging entirely.
    pub fn is_null(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn render(&self, ctx: &LogContext<'_>) -> String {
        let mut out = String::new();
        for op in &self.ops {
            match op {
                LogOp::Lit(s) => out.push_str(s),
                LogOp::ClientAddr => out.push_str(ctx.peer),
                LogOp::RequestLine => {
                    out.push_str(ctx.req.map(|r| r.line.as_str()).unwrap_or("-"))
                }
                LogOp::Status => out.push_str(&format!("{:03}", ctx.status)),
                LogOp::User => out.push_str(
                    ctx.req
                        .and_then(|r| r.user.as_deref())
                        .unwrap_or("-"),
                ),
                LogOp::Time => {
                    out.push_str(&ctx.when.format("%d/%b/%Y:%H:%M:%S %z").to_string())
                }
                LogOp::Bytes => {
                    if ctx.bytes > 0 {
                        out.push_str(&ctx.bytes.to_string());
                    } else {
                        out.push('-');
                    }
                }
                LogOp::ReqHeader(name) => {
                    if let Some(v) = ctx.req.and_then(|r| r.headers.named_value(name)) {
                        out.push_str(v);
                    }
                }
                LogOp::ReqHeaderDash(name) => {
                    match ctx.req.and_then(|r| r.headers.named_value(name)) {
                        Some(v) if !v.is_empty() => out.push_str(v),
                        _ => out.push('-'),
                    }
                }
                LogOp::ServiceName => out.push_str(ctx.service),
                LogOp::BackendName => out.push_str(ctx.backend),
                LogOp::Duration => {
                    let ms = ctx.duration.as_millis();
                    out.push_str(&format!("{}.{:03}", ms / 1000, ms % 1000));
                }
            }
        }
        out
    }
}

/// The built-in formats, one per log level 0..5.
pub fn canned_formats() -> Vec<LogFormat> {
    let specs: &[(&str, &str)] = &[
        ("null", ""),
        ("regular", "%a %r - %>s"),
        (
            "extended",
            "%a %r - %>s (%{Host}I/%{service}N -> %{backend}N) %{f}T sec",
        ),
        (
            "vhost_combined",
            "%{Host}I %a - %u [%t] \"%r\" %>s %b \"%{Referer}i\" \"%{User-Agent}i\"",
        ),
        (
            "combined",
            "%a - %u [%t] \"%r\" %>s %b \"%{Referer}i\" \"%{User-Agent}i\"",
        ),
        (
            "detailed",
            "%{Host}I %a - %u [%t] \"%r\" %>s %b \"%{Referer}i\" \"%{User-Agent}i\" (%{service}N -> %{backend}N) %{f}T sec",
        ),
    ];
    specs
        .iter()
        .map(|(name, fmt)| LogFormat::compile(name, fmt).expect("canned format compiles"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::HeaderList;

    fn context<'a>(req: &'a Request) -> LogContext<'a> {
        LogContext {
            peer: "203.0.113.9",
            req: Some(req),
            status: 200,
            bytes: 1234,
            service: "web",
            backend: "127.0.0.1:9000",
            when: Local::now(),
            duration: Duration::from_millis(1542),
        }
    }

    fn request() -> Request {
        let mut headers = HeaderList::new();
        headers.append_line("Host: example.org");
        headers.append_line("Referer: http://prev.example/");
        headers.append_line("User-Agent: check/1.0");
        Request::parse("GET /x HTTP/1.1".into(), headers, 4).unwrap()
    }

    #[test]
    fn combined_format_lines_up() {
        let fmt = LogFormat::compile("combined", "%a - %u [%t] \"%r\" %>s %b").unwrap();
        let req = request();
        let line = fmt.render(&context(&req));
        assert!(line.starts_with("203.0.113.9 - - ["));
        assert!(line.ends_with("\"GET /x HTTP/1.1\" 200 1234"));
    }

    #[test]
    fn header_directives() {
        let fmt = LogFormat::compile("t", "%{Host}i|%{Missing}i|%{Missing}I").unwrap();
        let req = request();
        assert_eq!(fmt.render(&context(&req)), "example.org||-");
    }

    #[test]
    fn names_and_duration() {
        let fmt = LogFormat::compile("t", "%{service}N->%{backend}N %{f}T").unwrap();
        let req = request();
        assert_eq!(
            fmt.render(&context(&req)),
            "web->127.0.0.1:9000 1.542"
        );
    }

    #[test]
    fn zero_bytes_renders_dash() {
        let fmt = LogFormat::compile("t", "%b").unwrap();
        let req = request();
        let mut ctx = context(&req);
        ctx.bytes = 0;
        assert_eq!(fmt.render(&ctx), "-");
    }

    #[test]
    fn percent_escape_and_unknown() {
        let fmt = LogFormat::compile("t", "100%%").unwrap();
        let req = request();
        assert_eq!(fmt.render(&context(&req)), "100%");
        assert!(LogFormat::compile("t", "%q").is_err());
        assert!(LogFormat::compile("t", "%{oops}N").is_err());
    }

    #[test]
    fn canned_set_compiles() {
        let formats = canned_formats();
        assert_eq!(formats.len(), 6);
        assert!(formats[0].is_null());
        assert_eq!(formats[4].name, "combined");
    }
}
