use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::accesslog::LogContext;
use crate::backend::{Backend, BackendAddr, BackendKind, RegularBackend};
use crate::core::Core;
use crate::http::body::{copy_bin, copy_chunks, copy_until_eof, tunnel};
use crate::http::headers::{HeaderList, HeaderTag};
use crate::http::io::{BoxedIo, Conn};
use crate::http::reply::{acme_reply, err_reply, redirect_reply, HttpStatus};
use crate::http::request::{Method, ParseError, Request, Response};
use crate::listener::Listener;
use crate::matcher::Captures;
use crate::service::Service;
use crate::tls::TlsInfo;
use crate::worker::{AcceptedSock, ThreadArg};

const MAX_HEADER_LINE: usize = 4096;
const MAX_HEADERS: usize = 128;
const MAX_REQUEST_LINE: usize = 16384;

/// RPC-over-HTTP tunnel direction, when the method selects one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rpc {
    None,
    In,
    Out,
}

/// WebSocket upgrade progress bits, request side and response side.
mod wss {
    pub const REQ_GET: u8 = 0x01;
    pub const REQ_CONN_UPGRADE: u8 = 0x02;
    pub const REQ_UPGRADE_WS: u8 = 0x04;
    pub const RESP_101: u8 = 0x08;
    pub const RESP_CONN_UPGRADE: u8 = 0x10;
    pub const RESP_UPGRADE_WS: u8 = 0x20;
    pub const COMPLETE: u8 = 0x3f;
}

enum Next {
    KeepAlive,
    Close,
}

/// A live connection to a chosen backend, kept across keep-alive
/// requests that route to the same place.
struct BackendConn {
    backend: Arc<Backend>,
    conn: Conn,
    reused: bool,
}

fn set_sock_opts(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_linger(Some(std::time::Duration::from_secs(10)));
    let _ = sock.set_nodelay(true);
}

/// Case-insensitive token search in a comma-separated header value.
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn parse_content_length(value: &str) -> Option<i64> {
    let v = value.trim();
    if v.is_empty() || !v.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return None;
    }
    v.parse().ok()
}

/// Split `scheme://authority/path` into its parts; anything else is not
/// an absolute HTTP URL.
fn split_http_url(url: &str) -> Option<(&str, &str, &str)> {
    let rest = url
        .strip_prefix("http://")
        .map(|r| ("http", r))
        .or_else(|| url.strip_prefix("https://").map(|r| ("https", r)));
    let (scheme, rest) = rest?;
    match rest.find('/') {
        Some(slash) => Some((scheme, &rest[..slash], &rest[slash..])),
        None => Some((scheme, rest, "/")),
    }
}

/// Run one accepted connection to completion. Owns both sockets; every
/// exit path closes them.
pub async fn handle_connection(core: Arc<Core>, arg: ThreadArg, shutdown: watch::Receiver<bool>) {
    let listener = Arc::clone(&arg.listener);
    let peer_ip = arg.peer_ip();
    let peer_label = arg.peer_label();

    core.metrics.connections_active.inc();

    let (stream, tls_info): (BoxedIo, Option<TlsInfo>) = match arg.sock {
        AcceptedSock::Tcp(tcp, _) => {
            set_sock_opts(&tcp);
            match &listener.tls {
                Some(tls) => {
                    match timeout(listener.client_timeout, tls.acceptor.accept(tcp)).await {
                        Ok(Ok(tls_stream)) => {
                            let info = TlsInfo::from_connection(tls_stream.get_ref().1);
                            (Box::new(tls_stream), Some(info))
                        }
                        Ok(Err(e)) => {
                            debug!(peer = %peer_label, error = %e, "TLS handshake failed");
                            core.metrics.connections_active.dec();
                            return;
                        }
                        Err(_) => {
                            debug!(peer = %peer_label, "TLS handshake timed out");
                            core.metrics.connections_active.dec();
                            return;
                        }
                    }
                }
                None => (Box::new(tcp), None),
            }
        }
        AcceptedSock::Unix(unix) => (Box::new(unix), None),
    };

    let mut client = Conn::new(stream, listener.client_timeout);
    let mut backend_conn: Option<BackendConn> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match serve_one(
            &core,
            &listener,
            &mut client,
            &mut backend_conn,
            peer_ip,
            &peer_label,
            tls_info.as_ref(),
        )
        .await
        {
            Next::KeepAlive => continue,
            Next::Close => break,
        }
    }

    client.shutdown().await;
    if let Some(mut bc) = backend_conn {
        bc.conn.shutdown().await;
    }
    core.metrics.connections_active.dec();
}

/// Read the next request line, tolerating leading empty lines.
async fn read_request_line(client: &mut Conn) -> io::Result<String> {
    loop {
        let line = client.read_line(MAX_REQUEST_LINE).await?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
}

async fn read_headers(conn: &mut Conn, peer: &str) -> io::Result<HeaderList> {
    let mut headers = HeaderList::new();
    loop {
        let line = conn.read_line(MAX_HEADER_LINE).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "too many headers",
            ));
        }
        if !headers.append_line(&line) {
            debug!(peer = %peer, line = %line, "dropping malformed header");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_one(
    core: &Arc<Core>,
    listener: &Arc<Listener>,
    client: &mut Conn,
    backend_conn: &mut Option<BackendConn>,
    peer_ip: Option<IpAddr>,
    peer: &str,
    tls_info: Option<&TlsInfo>,
) -> Next {
    // READ_REQUEST
    let line = match read_request_line(client).await {
        Ok(l) => l,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            err_reply(client, HttpStatus::UriTooLong, listener.err_body(HttpStatus::UriTooLong))
                .await;
            return Next::Close;
        }
        Err(_) => return Next::Close,
    };
    let headers = match read_headers(client, peer).await {
        Ok(h) => h,
        Err(_) => return Next::Close,
    };
    let start = Instant::now();

    // VALIDATE
    if listener.max_uri_length > 0 {
        let uri_len = line.split_ascii_whitespace().nth(1).map_or(0, str::len);
        if uri_len > listener.max_uri_length {
            info!(peer = %peer, "request URI too long");
            err_reply(client, HttpStatus::UriTooLong, listener.err_body(HttpStatus::UriTooLong))
                .await;
            return Next::Close;
        }
    }

    let mut req = match Request::parse(line, headers, listener.verb) {
        Ok(r) => r,
        Err(err) => {
            let status = match err {
                ParseError::BadUrl => HttpStatus::BadRequest,
                _ => HttpStatus::NotImplemented,
            };
            info!(peer = %peer, ?err, "rejecting request");
            err_reply(client, status, listener.err_body(status)).await;
            return Next::Close;
        }
    };
    let cl_11 = req.version == 1;

    if let Some(pat) = &listener.url_pattern {
        if !pat.is_match(&req.url) {
            info!(peer = %peer, url = %req.url, "URL rejected by listener pattern");
            err_reply(
                client,
                HttpStatus::NotImplemented,
                listener.err_body(HttpStatus::NotImplemented),
            )
            .await;
            return Next::Close;
        }
    }

    let mut rpc = match req.method {
        Method::RpcInData => Rpc::In,
        Method::RpcOutData => Rpc::Out,
        _ => Rpc::None,
    };
    let mut is_ws: u8 = if req.method == Method::Get { wss::REQ_GET } else { 0 };
    let mut no_cont = req.method == Method::Head;
    let mut conn_closed = false;
    let mut chunked = false;
    let mut cont: i64 = -1;

    // header scan
    {
        let mut drop_idx = Vec::new();
        let mut seen_cl = false;
        for (idx, hdr) in req.headers.iter().enumerate() {
            match hdr.tag {
                HeaderTag::Connection => {
                    if hdr.value().eq_ignore_ascii_case("close") {
                        conn_closed = true;
                    } else if has_token(hdr.value(), "upgrade") {
                        is_ws |= wss::REQ_CONN_UPGRADE;
                    }
                }
                HeaderTag::Upgrade => {
                    if hdr.value().eq_ignore_ascii_case("websocket") {
                        is_ws |= wss::REQ_UPGRADE_WS;
                    }
                }
                HeaderTag::TransferEncoding => {
                    if hdr.value().eq_ignore_ascii_case("chunked") {
                        chunked = true;
                    } else {
                        info!(peer = %peer, "multiple transfer-encodings");
                        err_reply(
                            client,
                            HttpStatus::BadRequest,
                            listener.err_body(HttpStatus::BadRequest),
                        )
                        .await;
                        return Next::Close;
                    }
                }
                HeaderTag::ContentLength => {
                    if seen_cl || hdr.value().contains(',') {
                        info!(peer = %peer, "multiple content-length values");
                        err_reply(
                            client,
                            HttpStatus::BadRequest,
                            listener.err_body(HttpStatus::BadRequest),
                        )
                        .await;
                        return Next::Close;
                    }
                    seen_cl = true;
                    match parse_content_length(hdr.value()) {
                        Some(v) if v < 0 => {
                            // negative length: drop the header, keep going
                            drop_idx.push(idx);
                        }
                        Some(v) => cont = v,
                        None => {
                            info!(peer = %peer, "bad content-length value");
                            err_reply(
                                client,
                                HttpStatus::BadRequest,
                                listener.err_body(HttpStatus::BadRequest),
                            )
                            .await;
                            return Next::Close;
                        }
                    }
                    if rpc == Rpc::In && !(0x20000..=0x8000_0000).contains(&cont) {
                        rpc = Rpc::None;
                    }
                }
                HeaderTag::Expect => {
                    if hdr.value().eq_ignore_ascii_case("100-continue") {
                        drop_idx.push(idx);
                    }
                }
                HeaderTag::Authorization => {
                    if let Some((user, _)) = crate::auth::basic_credentials(hdr.value()) {
                        req.user = Some(user);
                    }
                }
                _ => {}
            }
        }
        if !drop_idx.is_empty() {
            let mut idx = 0;
            req.headers.retain(|_| {
                let keep = !drop_idx.contains(&idx);
                idx += 1;
                keep
            });
        }
    }

    for m in &listener.head_remove {
        req.headers.filter_out(m);
    }

    // request smuggling guard
    if chunked && cont != -1 {
        info!(peer = %peer, "transfer-encoding and content-length together");
        err_reply(client, HttpStatus::BadRequest, listener.err_body(HttpStatus::BadRequest)).await;
        return Next::Close;
    }

    if listener.max_req_size > 0 && cont > 0 && cont as u64 > listener.max_req_size && rpc != Rpc::In
    {
        info!(peer = %peer, length = cont, "request too large");
        err_reply(
            client,
            HttpStatus::PayloadTooLarge,
            listener.err_body(HttpStatus::PayloadTooLarge),
        )
        .await;
        return Next::Close;
    }

    // APPLY_LISTENER_REWRITE
    let mut caps: Captures = Vec::new();
    for rule in &listener.rewrite_request {
        rule.apply_request(&mut req, peer_ip, &mut caps);
    }

    // ROUTE
    let Some(svc) = listener.find_service(&req, peer_ip, &mut caps) else {
        info!(peer = %peer, request = %req.line, "no service matches");
        err_reply(
            client,
            HttpStatus::ServiceUnavailable,
            listener.err_body(HttpStatus::ServiceUnavailable),
        )
        .await;
        return Next::Close;
    };
    for rule in &svc.rewrite_request {
        rule.apply_request(&mut req, peer_ip, &mut caps);
    }

    let Some(mut backend) = svc.select_backend(&req, peer_ip) else {
        info!(peer = %peer, service = svc.display_name(), "no live backend");
        err_reply(
            client,
            HttpStatus::ServiceUnavailable,
            listener.err_body(HttpStatus::ServiceUnavailable),
        )
        .await;
        return Next::Close;
    };
    core.metrics
        .backend_selections_total
        .with_label_values(&[svc.display_name(), &backend.label()])
        .inc();

    // noHTTPS11: 1 forces HTTP/1.0 on TLS, 2 only for MSIE agents
    let force_10 = match listener.no_https_11 {
        1 => tls_info.is_some(),
        2 => {
            tls_info.is_some()
                && req
                    .headers
                    .value_of(HeaderTag::UserAgent)
                    .is_some_and(|ua| ua.contains("MSIE"))
        }
        _ => false,
    };

    // a cached backend connection only helps if routing repeats itself
    if let Some(bc) = backend_conn.take() {
        if Arc::ptr_eq(&bc.backend, &backend) && backend.regular().is_some() {
            *backend_conn = Some(BackendConn { reused: true, ..bc });
        } else {
            let mut conn = bc.conn;
            conn.shutdown().await;
        }
    }

    // HANDLE_INTERNAL or CONNECT_BE
    if backend.regular().is_none() {
        // internal responders consume the request body first
        if !consume_request_body(client, cl_11, chunked, cont, rpc, listener.max_req_size).await {
            return Next::Close;
        }
        let code = handle_internal(core, listener, client, &req, &backend, &caps).await;
        finish_log(core, listener, &svc, Some(&backend), peer, &req, code, 0, start);
        return if cl_11 && !conn_closed && !force_10 {
            Next::KeepAlive
        } else {
            Next::Close
        };
    }

    let mut be_conn =
        match take_or_connect(core, &svc, &mut backend, backend_conn, &req, peer_ip).await {
            Some(c) => c,
            None => {
                err_reply(
                    client,
                    HttpStatus::ServiceUnavailable,
                    listener.err_body(HttpStatus::ServiceUnavailable),
                )
                .await;
                return Next::Close;
            }
        };
    let Some(regular) = backend.regular() else {
        // reselection fell through to an internal responder
        if !consume_request_body(client, cl_11, chunked, cont, rpc, listener.max_req_size).await {
            return Next::Close;
        }
        let code = handle_internal(core, listener, client, &req, &backend, &caps).await;
        finish_log(core, listener, &svc, Some(&backend), peer, &req, code, 0, start);
        return if cl_11 && !conn_closed && !force_10 {
            Next::KeepAlive
        } else {
            Next::Close
        };
    };

    // FORWARD_REQUEST
    if listener.rewrite_destination {
        rewrite_destination(&mut req, regular);
    }

    let trusted = listener
        .trusted_ips
        .as_ref()
        .map(|a| a.matches(peer_ip))
        .unwrap_or(false)
        || svc
            .trusted_ips
            .as_ref()
            .map(|a| a.matches(peer_ip))
            .unwrap_or(false);

    let out = serialize_request(&req, listener, &svc, peer, tls_info, trusted);
    if be_conn.conn.write_all(&out).await.is_err() || be_conn.conn.flush().await.is_err() {
        // a reused keep-alive connection may have died quietly; redial once
        let retry = if be_conn.reused {
            be_conn.conn.shutdown().await;
            connect_backend(core, &svc, &backend).await
        } else {
            None
        };
        match retry {
            Some(conn) => {
                be_conn = BackendConn { backend: Arc::clone(&backend), conn, reused: false };
                let out = serialize_request(&req, listener, &svc, peer, tls_info, trusted);
                if be_conn.conn.write_all(&out).await.is_err()
                    || be_conn.conn.flush().await.is_err()
                {
                    warn!(peer = %peer, backend = %backend.label(), "request write failed");
                    err_reply(
                        client,
                        HttpStatus::InternalServerError,
                        listener.err_body(HttpStatus::InternalServerError),
                    )
                    .await;
                    return Next::Close;
                }
            }
            None => {
                warn!(peer = %peer, backend = %backend.label(), "request write failed");
                err_reply(
                    client,
                    HttpStatus::InternalServerError,
                    listener.err_body(HttpStatus::InternalServerError),
                )
                .await;
                return Next::Close;
            }
        }
    }

    // FORWARD_BODY
    let mut req_bytes = 0u64;
    let mut cl_11 = cl_11;
    if cl_11 && chunked {
        if copy_chunks(client, Some(&mut be_conn.conn), &mut req_bytes, listener.max_req_size)
            .await
            .is_err()
        {
            warn!(peer = %peer, "request body copy failed");
            err_reply(
                client,
                HttpStatus::InternalServerError,
                listener.err_body(HttpStatus::InternalServerError),
            )
            .await;
            return Next::Close;
        }
    } else if cont > 0 && rpc != Rpc::In {
        if copy_bin(client, Some(&mut be_conn.conn), cont as u64, &mut req_bytes)
            .await
            .is_err()
        {
            warn!(peer = %peer, "request body copy failed");
            err_reply(
                client,
                HttpStatus::InternalServerError,
                listener.err_body(HttpStatus::InternalServerError),
            )
            .await;
            return Next::Close;
        }
    } else if cont > 0 && rpc == Rpc::In {
        // RPC_IN_DATA: stream until the client closes, HTTP/1.0 rules
        cl_11 = false;
        if copy_until_eof(client, Some(&mut be_conn.conn), &mut req_bytes, cont as u64)
            .await
            .is_err()
        {
            warn!(peer = %peer, "RPC stream ended with error");
            return Next::Close;
        }
        finish_log(core, listener, &svc, Some(&backend), peer, &req, 0, req_bytes, start);
        return Next::Close;
    }
    if be_conn.conn.flush().await.is_err() {
        err_reply(
            client,
            HttpStatus::InternalServerError,
            listener.err_body(HttpStatus::InternalServerError),
        )
        .await;
        return Next::Close;
    }

    // READ_RESPONSE / FORWARD_RESPONSE
    let https = tls_info.is_some();
    let mut res_bytes = 0u64;
    let mut be_11 = false;
    let mut final_status: u16 = 0;
    loop {
        let line = match be_conn.conn.read_line(MAX_HEADER_LINE).await {
            Ok(l) => l,
            Err(e) => {
                warn!(peer = %peer, backend = %backend.label(), error = %e, "response read failed");
                err_reply(
                    client,
                    HttpStatus::InternalServerError,
                    listener.err_body(HttpStatus::InternalServerError),
                )
                .await;
                return Next::Close;
            }
        };
        let resp_headers = match read_headers(&mut be_conn.conn, peer).await {
            Ok(h) => h,
            Err(e) => {
                warn!(peer = %peer, backend = %backend.label(), error = %e, "response read failed");
                err_reply(
                    client,
                    HttpStatus::InternalServerError,
                    listener.err_body(HttpStatus::InternalServerError),
                )
                .await;
                return Next::Close;
            }
        };
        let Some(mut resp) = Response::parse(line, resp_headers) else {
            warn!(peer = %peer, backend = %backend.label(), "unparseable response line");
            err_reply(
                client,
                HttpStatus::InternalServerError,
                listener.err_body(HttpStatus::InternalServerError),
            )
            .await;
            return Next::Close;
        };

        be_11 = resp.http_11;
        final_status = resp.status;
        let skip = resp.informational() && resp.status != 101;
        if resp.status == 101 {
            is_ws |= wss::RESP_101;
        }
        if !no_cont && resp.no_content() {
            no_cont = true;
        }

        let mut resp_chunked = false;
        let mut resp_cont: i64 = -1;
        for hdr in resp.headers.iter() {
            match hdr.tag {
                HeaderTag::Connection => {
                    if hdr.value().eq_ignore_ascii_case("close") {
                        conn_closed = true;
                    } else if has_token(hdr.value(), "upgrade") {
                        is_ws |= wss::RESP_CONN_UPGRADE;
                    }
                }
                HeaderTag::Upgrade => {
                    if hdr.value().eq_ignore_ascii_case("websocket") {
                        is_ws |= wss::RESP_UPGRADE_WS;
                    }
                }
                HeaderTag::TransferEncoding => {
                    if hdr.value().eq_ignore_ascii_case("chunked") {
                        resp_chunked = true;
                        no_cont = false;
                    }
                }
                HeaderTag::ContentLength => {
                    resp_cont = parse_content_length(hdr.value()).unwrap_or(-1);
                    if rpc == Rpc::Out {
                        if (0x20000..=0x8000_0000).contains(&resp_cont) {
                            // RPC_OUT_DATA: the declared length frames
                            // nothing, stream until EOF
                            resp_cont = -1;
                        } else {
                            rpc = Rpc::None;
                        }
                    }
                }
                HeaderTag::Location | HeaderTag::ContentLocation => {}
                _ => {}
            }
        }

        if listener.rewrite_location > 0 {
            rewrite_location_headers(listener, &req, &mut resp, regular, https);
        }

        svc.note_response(&resp, &backend);

        for rule in &listener.rewrite_response {
            rule.apply_response(&req, &mut resp, peer_ip, &mut caps);
        }
        for rule in &svc.rewrite_response {
            rule.apply_response(&req, &mut resp, peer_ip, &mut caps);
        }

        if !skip {
            let mut out = Vec::new();
            out.extend_from_slice(resp.line.as_bytes());
            out.extend_from_slice(b"\r\n");
            resp.headers.write_to(&mut out);
            out.extend_from_slice(b"\r\n");
            if client.write_all(&out).await.is_err() || client.flush().await.is_err() {
                debug!(peer = %peer, "client write failed");
                return Next::Close;
            }
        }

        if !no_cont {
            let copied = {
                let dst: Option<&mut Conn> = if skip { None } else { Some(&mut *client) };
                if be_11 && resp_chunked {
                    copy_chunks(&mut be_conn.conn, dst, &mut res_bytes, 0).await
                } else if resp_cont >= 0 {
                    copy_bin(&mut be_conn.conn, dst, resp_cont as u64, &mut res_bytes).await
                } else if !skip {
                    // unframed body: stream until the backend closes
                    cl_11 = false;
                    be_11 = false;
                    copy_until_eof(&mut be_conn.conn, dst, &mut res_bytes, 0).await
                } else {
                    Ok(())
                }
            };
            if copied.is_err() {
                debug!(peer = %peer, "response body copy failed");
                return Next::Close;
            }
            if client.flush().await.is_err() {
                return Next::Close;
            }
        } else if is_ws == wss::COMPLETE {
            // WEBSOCKET_TUNNEL
            cl_11 = false;
            be_11 = false;
            let idle = regular.ws_timeout;
            client.set_deadline(idle);
            be_conn.conn.set_deadline(idle);
            match tunnel(client, &mut be_conn.conn, idle).await {
                Ok(n) => res_bytes += n,
                Err(e) => debug!(peer = %peer, error = %e, "websocket tunnel ended"),
            }
            client.set_deadline(listener.client_timeout);
        }

        if !skip {
            break;
        }
    }

    finish_log(
        core,
        listener,
        &svc,
        Some(&backend),
        peer,
        &req,
        final_status,
        res_bytes,
        start,
    );

    if be_11 && !conn_closed {
        *backend_conn = Some(be_conn);
    } else {
        be_conn.conn.shutdown().await;
    }

    if cl_11 && !conn_closed && !force_10 {
        Next::KeepAlive
    } else {
        Next::Close
    }
}

/// Internal responders still need the request body drained off the wire.
async fn consume_request_body(
    client: &mut Conn,
    cl_11: bool,
    chunked: bool,
    cont: i64,
    rpc: Rpc,
    max_req: u64,
) -> bool {
    let mut sink = 0u64;
    let res = if cl_11 && chunked {
        copy_chunks(client, None, &mut sink, max_req).await
    } else if cont > 0 && rpc != Rpc::In {
        copy_bin(client, None, cont as u64, &mut sink).await
    } else {
        Ok(())
    };
    res.is_ok()
}

/// Answer a request routed to an internal responder. Returns the status
/// code that went to the client, for the access log.
async fn handle_internal(
    core: &Arc<Core>,
    listener: &Arc<Listener>,
    client: &mut Conn,
    req: &Request,
    backend: &Arc<Backend>,
    caps: &Captures,
) -> u16 {
    match &backend.kind {
        BackendKind::Redirect { code, template, has_uri } => {
            redirect_reply(client, req, *code, template, *has_uri, caps).await;
            *code
        }
        BackendKind::Error { status, body } => {
            let status = HttpStatus::from_code(*status).unwrap_or(HttpStatus::ServiceUnavailable);
            let body = body.as_deref().or_else(|| listener.err_body(status));
            err_reply(client, status, body).await;
            status.code()
        }
        BackendKind::Acme { directory, pattern } => {
            let status = match pattern.captures(req.path()) {
                Some(challenge) => acme_reply(client, directory, &challenge).await,
                None => HttpStatus::NotFound,
            };
            if status != HttpStatus::Ok {
                err_reply(client, status, listener.err_body(status)).await;
                status.code()
            } else {
                200
            }
        }
        BackendKind::Control => {
            let status = crate::control::control_reply(client, req, core).await;
            if status != HttpStatus::Ok {
                err_reply(client, status, listener.err_body(status)).await;
                status.code()
            } else {
                200
            }
        }
        BackendKind::Metrics => {
            let status = crate::control::metrics_reply(client, core).await;
            if status != HttpStatus::Ok {
                err_reply(client, status, listener.err_body(status)).await;
                status.code()
            } else {
                200
            }
        }
        _ => {
            err_reply(
                client,
                HttpStatus::InternalServerError,
                listener.err_body(HttpStatus::InternalServerError),
            )
            .await;
            500
        }
    }
}

/// Connect to the chosen regular backend, killing and reselecting on
/// failure, at most one attempt per group member.
async fn take_or_connect(
    core: &Arc<Core>,
    svc: &Arc<Service>,
    backend: &mut Arc<Backend>,
    cached: &mut Option<BackendConn>,
    req: &Request,
    peer_ip: Option<IpAddr>,
) -> Option<BackendConn> {
    if let Some(bc) = cached.take() {
        if Arc::ptr_eq(&bc.backend, backend) {
            return Some(bc);
        }
        let mut conn = bc.conn;
        conn.shutdown().await;
    }

    let mut attempts = svc.retry_budget();
    loop {
        if backend.regular().is_none() {
            // internal responder chosen after reselection; the caller
            // handles it in place
            return Some(BackendConn {
                backend: Arc::clone(backend),
                conn: Conn::new(
                    Box::new(std::io::Cursor::new(Vec::new())),
                    std::time::Duration::from_secs(1),
                ),
                reused: false,
            });
        }
        match connect_backend(core, svc, backend).await {
            Some(conn) => {
                return Some(BackendConn { backend: Arc::clone(backend), conn, reused: false })
            }
            None => {
                attempts = attempts.saturating_sub(1);
                if attempts == 0 {
                    return None;
                }
                // the failed backend is dead now; draw again
                *backend = svc.select_backend(req, peer_ip)?;
            }
        }
    }
}

async fn connect_backend(
    core: &Arc<Core>,
    svc: &Arc<Service>,
    backend: &Arc<Backend>,
) -> Option<Conn> {
    let regular = backend.regular()?;
    let stream: io::Result<BoxedIo> = match &regular.addr {
        BackendAddr::Inet(sa) => {
            match timeout(regular.conn_timeout, TcpStream::connect(sa)).await {
                Ok(Ok(tcp)) => {
                    set_sock_opts(&tcp);
                    match &regular.tls {
                        Some(tls) => {
                            match timeout(
                                regular.conn_timeout,
                                tls.connector.connect(tls.servername.clone(), tcp),
                            )
                            .await
                            {
                                Ok(Ok(s)) => Ok(Box::new(s)),
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err(io::Error::new(
                                    io::ErrorKind::TimedOut,
                                    "backend TLS handshake timed out",
                                )),
                            }
                        }
                        None => Ok(Box::new(tcp)),
                    }
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        }
        BackendAddr::Unix(path) => match tokio::net::UnixStream::connect(path).await {
            Ok(s) => Ok(Box::new(s)),
            Err(e) => Err(e),
        },
    };

    match stream {
        Ok(s) => Some(Conn::new(s, regular.timeout)),
        Err(e) => {
            warn!(backend = %backend.label(), error = %e, "backend connect failed");
            core.metrics
                .backend_failures_total
                .with_label_values(&[&backend.label()])
                .inc();
            svc.kill_backend(backend);
            None
        }
    }
}

/// Rewrite the Destination header to point at the chosen backend,
/// preserving path and query.
fn rewrite_destination(req: &mut Request, regular: &RegularBackend) {
    let Some(hdr) = req.headers.first_mut(HeaderTag::Destination) else {
        return;
    };
    let Some((_, _, path)) = split_http_url(hdr.value()) else {
        debug!(value = %hdr.value(), "can't parse Destination header");
        return;
    };
    let scheme = if regular.tls.is_some() { "https" } else { "http" };
    let line = format!("Destination: {scheme}://{}{path}", regular.addr);
    hdr.set_raw(line);
}

/// Location / Content-Location rewriting: when the URL points back at
/// the backend we just used, swap in the virtual host the client asked
/// for.
fn rewrite_location_headers(
    listener: &Arc<Listener>,
    req: &Request,
    resp: &mut Response,
    regular: &RegularBackend,
    https: bool,
) {
    let Some(v_host) = req.host().filter(|h| !h.is_empty()).map(str::to_string) else {
        return;
    };
    let be_authority = regular.addr.to_string();
    let be_host = match &regular.addr {
        BackendAddr::Inet(sa) => sa.ip().to_string(),
        BackendAddr::Unix(_) => return,
    };
    let scheme = if https { "https" } else { "http" };

    for hdr in resp.headers.iter_mut() {
        let (name, tag) = (hdr.name().to_string(), hdr.tag);
        if tag != HeaderTag::Location && tag != HeaderTag::ContentLocation {
            continue;
        }
        let Some((_, authority, path)) = split_http_url(hdr.value()) else {
            continue;
        };
        if authority != be_authority && authority != be_host {
            continue;
        }
        if listener.rewrite_location == 2 {
            if let Some(pat) = &listener.url_pattern {
                if !pat.is_match(path) {
                    continue;
                }
            }
        }
        let line = format!("{name}: {scheme}://{v_host}{path}");
        hdr.set_raw(line);
    }
}

fn serialize_request(
    req: &Request,
    listener: &Arc<Listener>,
    svc: &Arc<Service>,
    peer: &str,
    tls_info: Option<&TlsInfo>,
    trusted_peer: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(req.request_line().as_bytes());
    out.extend_from_slice(b"\r\n");

    let fwd_name = svc
        .forwarded_header
        .as_deref()
        .unwrap_or(&listener.forwarded_header);

    if trusted_peer {
        req.headers.write_to(&mut out);
    } else {
        // an untrusted client doesn't get to seed the forwarded chain
        for hdr in req.headers.iter().filter(|h| !h.has_name(fwd_name)) {
            out.extend_from_slice(hdr.raw().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    if listener.ssl_headers {
        if let Some(info) = tls_info {
            let mut extra = HeaderList::new();
            info.append_headers(&mut extra);
            extra.write_to(&mut out);
        }
    }

    out.extend_from_slice(format!("{fwd_name}: {peer}\r\n").as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

#[allow(clippy::too_many_arguments)]
fn finish_log(
    core: &Arc<Core>,
    listener: &Arc<Listener>,
    svc: &Arc<Service>,
    backend: Option<&Arc<Backend>>,
    peer: &str,
    req: &Request,
    status: u16,
    bytes: u64,
    start: Instant,
) {
    core.metrics
        .requests_total
        .with_label_values(&[&listener.name(), svc.display_name(), &status.to_string()])
        .inc();

    if svc.log_suppress || listener.log_format.is_null() {
        return;
    }
    let line = listener.log_format.render(&LogContext {
        peer,
        req: Some(req),
        status,
        bytes,
        service: svc.display_name(),
        backend: &backend.map(|b| b.label()).unwrap_or_else(|| "-".into()),
        when: chrono::Local::now(),
        duration: start.elapsed(),
    });
    info!(target: "portico::access", "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_search_is_icase_and_list_aware() {
        assert!(has_token("Upgrade", "upgrade"));
        assert!(has_token("keep-alive, Upgrade", "upgrade"));
        assert!(!has_token("keep-alive", "upgrade"));
        assert!(!has_token("upgraded", "upgrade"));
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(parse_content_length("42"), Some(42));
        assert_eq!(parse_content_length(" 42 "), Some(42));
        assert_eq!(parse_content_length("-1"), Some(-1));
        assert_eq!(parse_content_length("4 2"), None);
        assert_eq!(parse_content_length("x"), None);
        assert_eq!(parse_content_length("1,2"), None);
    }

    #[test]
    fn http_url_splitting() {
        assert_eq!(
            split_http_url("http://h:8080/p?q"),
            Some(("http", "h:8080", "/p?q"))
        );
        assert_eq!(split_http_url("https://h"), Some(("https", "h", "/")));
        assert_eq!(split_http_url("ftp://h/"), None);
        assert_eq!(split_http_url("/relative"), None);
    }
}
