use std::net::IpAddr;

use crate::http::request::{Request, Response};
use crate::matcher::{Captures, Matcher};
use crate::routing::cond::Cond;

/// One rewrite operation. Operations run in order and later operations
/// see earlier effects.
#[derive(Debug)]
pub enum RewriteOp {
    /// Append a verbatim header line (after template expansion).
    SetHeader(String),
    /// Remove every header whose full text matches.
    DeleteHeader(Matcher),
    /// Replace path and query together.
    SetUrl(String),
    /// Replace the path, keeping the query.
    SetPath(String),
    /// Replace the entire query string.
    SetQuery(String),
    /// Add or replace one query parameter, preserving the order of the
    /// others.
    SetQueryParam { name: String, value: String },
    /// A nested rule with its own condition: conjunction with
    /// short-circuiting.
    Sub(RewriteRule),
}

/// A conditional rewrite: if the condition matches, apply the operations;
/// otherwise run the else branch.
#[derive(Debug)]
pub struct RewriteRule {
    pub cond: Option<Cond>,
    pub ops: Vec<RewriteOp>,
    pub else_branch: Option<Box<RewriteRule>>,
}

/// Expand `$0`..`$9` from the capture vector; `$$` is a literal dollar, a
/// stray `$` before a non-digit or at end of string stays literal. Absent
/// captures expand to nothing.
pub fn expand_template(tpl: &str, caps: &Captures) -> String {
    let mut out = String::with_capacity(tpl.len());
    let mut chars = tpl.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d) if d.is_ascii_digit() => {
                let n = d.to_digit(10).unwrap_or(0) as usize;
                chars.next();
                if let Some(Some(text)) = caps.get(n) {
                    out.push_str(text);
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

impl RewriteRule {
    pub fn unconditional(ops: Vec<RewriteOp>) -> RewriteRule {
        RewriteRule { cond: None, ops, else_branch: None }
    }

    pub fn apply_request(&self, req: &mut Request, peer: Option<IpAddr>, caps: &mut Captures) {
        let matched = self
            .cond
            .as_ref()
            .map_or(true, |c| c.eval(req, peer, caps));
        if matched {
            for op in &self.ops {
                op.apply_request(req, peer, caps);
            }
        } else if let Some(rule) = &self.else_branch {
            rule.apply_request(req, peer, caps);
        }
    }

    /// Response-side application: conditions are still evaluated against
    /// the request; header operations touch the response, URL operations
    /// have nothing to act on and are ignored.
    pub fn apply_response(
        &self,
        req: &Request,
        resp: &mut Response,
        peer: Option<IpAddr>,
        caps: &mut Captures,
    ) {
        let matched = self
            .cond
            .as_ref()
            .map_or(true, |c| c.eval(req, peer, caps));
        if matched {
            for op in &self.ops {
                op.apply_response(req, resp, peer, caps);
            }
        } else if let Some(rule) = &self.else_branch {
            rule.apply_response(req, resp, peer, caps);
        }
    }
}

impl RewriteOp {
    fn apply_request(&self, req: &mut Request, peer: Option<IpAddr>, caps: &mut Captures) {
        match self {
            RewriteOp::SetHeader(tpl) => {
                req.headers.append_line(&expand_template(tpl, caps));
            }
            RewriteOp::DeleteHeader(m) => req.headers.filter_out(m),
            RewriteOp::SetUrl(tpl) => req.set_url(expand_template(tpl, caps)),
            RewriteOp::SetPath(tpl) => {
                let path = expand_template(tpl, caps);
                let query = req.query();
                let url = if query.is_empty() {
                    path
                } else {
                    format!("{path}?{query}")
                };
                req.set_url(url);
            }
            RewriteOp::SetQuery(tpl) => {
                let query = expand_template(tpl, caps);
                let path = req.path().to_string();
                let url = if query.is_empty() {
                    path
                } else {
                    format!("{path}?{query}")
                };
                req.set_url(url);
            }
            RewriteOp::SetQueryParam { name, value } => {
                let value = expand_template(value, caps);
                let mut found = false;
                let mut params: Vec<String> = Vec::new();
                for kv in req.query().split('&').filter(|s| !s.is_empty()) {
                    let key = kv.split_once('=').map_or(kv, |(k, _)| k);
                    if key == name {
                        params.push(format!("{name}={value}"));
                        found = true;
                    } else {
                        params.push(kv.to_string());
                    }
                }
                if !found {
                    params.push(format!("{name}={value}"));
                }
                let url = format!("{}?{}", req.path(), params.join("&"));
                req.set_url(url);
            }
            RewriteOp::Sub(rule) => rule.apply_request(req, peer, caps),
        }
    }

    fn apply_response(
        &self,
        req: &Request,
        resp: &mut Response,
        peer: Option<IpAddr>,
        caps: &mut Captures,
    ) {
        match self {
            RewriteOp::SetHeader(tpl) => {
                resp.headers.append_line(&expand_template(tpl, caps));
            }
            RewriteOp::DeleteHeader(m) => resp.headers.filter_out(m),
            RewriteOp::Sub(rule) => rule.apply_response(req, resp, peer, caps),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::HeaderList;
    use crate::matcher::PatternFlavor;

    fn request(line: &str) -> Request {
        Request::parse(line.to_string(), HeaderList::new(), 4).expect("request parses")
    }

    #[test]
    fn expansion_identity_without_dollars() {
        assert_eq!(expand_template("/plain/path", &Vec::new()), "/plain/path");
    }

    #[test]
    fn expansion_backrefs_and_escapes() {
        let caps = vec![Some("/old/x".into()), Some("x".into())];
        assert_eq!(expand_template("/new/$1", &caps), "/new/x");
        assert_eq!(expand_template("price: $$5", &caps), "price: $5");
        assert_eq!(expand_template("trailing $", &caps), "trailing $");
        assert_eq!(expand_template("missing $7 cap", &caps), "missing  cap");
    }

    #[test]
    fn set_path_keeps_query() {
        let mut req = request("GET /old/a?k=1 HTTP/1.1");
        let rule = RewriteRule::unconditional(vec![RewriteOp::SetPath("/new/a".into())]);
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.url, "/new/a?k=1");
    }

    #[test]
    fn set_query_replaces_whole_query() {
        let mut req = request("GET /p?a=1&b=2 HTTP/1.1");
        let rule = RewriteRule::unconditional(vec![RewriteOp::SetQuery("c=3".into())]);
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.url, "/p?c=3");
    }

    #[test]
    fn set_query_param_preserves_order() {
        let mut req = request("GET /p?a=1&b=2&c=3 HTTP/1.1");
        let rule = RewriteRule::unconditional(vec![RewriteOp::SetQueryParam {
            name: "b".into(),
            value: "9".into(),
        }]);
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.url, "/p?a=1&b=9&c=3");

        let rule = RewriteRule::unconditional(vec![RewriteOp::SetQueryParam {
            name: "d".into(),
            value: "4".into(),
        }]);
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.url, "/p?a=1&b=9&c=3&d=4");
    }

    #[test]
    fn conditional_rewrite_with_else() {
        let cond = Cond::Url(Matcher::compile("^/old/(.*)$", PatternFlavor::Posix, false).unwrap());
        let rule = RewriteRule {
            cond: Some(cond),
            ops: vec![RewriteOp::SetUrl("/new/$1".into())],
            else_branch: Some(Box::new(RewriteRule::unconditional(vec![
                RewriteOp::SetHeader("X-Unmatched: 1".into()),
            ]))),
        };

        let mut req = request("GET /old/page HTTP/1.1");
        let mut caps = Vec::new();
        rule.apply_request(&mut req, None, &mut caps);
        assert_eq!(req.url, "/new/page");

        let mut req = request("GET /other HTTP/1.1");
        let mut caps = Vec::new();
        rule.apply_request(&mut req, None, &mut caps);
        assert_eq!(req.url, "/other");
        assert_eq!(req.headers.named_value("X-Unmatched"), Some("1"));
    }

    #[test]
    fn delete_header_removes_all_matching() {
        let mut req = request("GET / HTTP/1.1");
        req.headers.append_line("X-Trace: a");
        req.headers.append_line("X-Trace: b");
        req.headers.append_line("Host: h");
        let rule = RewriteRule::unconditional(vec![RewriteOp::DeleteHeader(
            Matcher::compile("^X-Trace:", PatternFlavor::Posix, true).unwrap(),
        )]);
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn sub_rewrite_gates_on_its_own_condition() {
        let inner = RewriteRule {
            cond: Some(Cond::Url(
                Matcher::compile("^/api/", PatternFlavor::Posix, false).unwrap(),
            )),
            ops: vec![RewriteOp::SetHeader("X-Api: 1".into())],
            else_branch: None,
        };
        let rule = RewriteRule::unconditional(vec![RewriteOp::Sub(inner)]);

        let mut req = request("GET /api/x HTTP/1.1");
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert_eq!(req.headers.named_value("X-Api"), Some("1"));

        let mut req = request("GET /web/x HTTP/1.1");
        rule.apply_request(&mut req, None, &mut Vec::new());
        assert!(req.headers.named_value("X-Api").is_none());
    }
}
