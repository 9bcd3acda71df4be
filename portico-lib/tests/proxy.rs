mod helpers;

use std::sync::atomic::Ordering;
use std::time::Duration;

use helpers::{roundtrip, spawn_backend, spawn_ws_backend, start_proxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PLAIN_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!";

fn ok_response_naming(port: u16) -> Vec<u8> {
    let body = format!("port {port}");
    format!(
        "HTTP/1.1 200 OK\r\nX-Served-By: {port}\r\nSet-Cookie: JSID={port}; Path=/\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[tokio::test]
async fn basic_round_trip_with_forwarded_for() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        name = "web"
        [[listener.service.backend]]
        address = "{}"
        priority = 5
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, body) = roundtrip(&mut sock, b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hi!");

    let seen = backend.requests.lock().await.join("");
    assert!(seen.starts_with("GET /foo HTTP/1.1\r\n"), "got: {seen}");
    assert!(seen.contains("Host: x\r\n"));
    assert!(seen.contains("X-Forwarded-For: 127.0.0.1\r\n"));

    // the connection stays alive for a second exchange
    let (head, body) = roundtrip(&mut sock, b"GET /bar HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, b"hi!");
}

#[tokio::test]
async fn host_routing_is_case_insensitive() {
    let a = spawn_backend(ok_response_naming(1).to_vec()).await;
    let b = spawn_backend(ok_response_naming(2).to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0

        [[listener.service]]
        name = "site-a"
        match = {{ host = "a\\.example" }}
        [[listener.service.backend]]
        address = "{}"

        [[listener.service]]
        name = "site-b"
        match = {{ host = "b\\.example" }}
        [[listener.service.backend]]
        address = "{}"
        "#,
        a.addr, b.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(&mut sock, b"GET / HTTP/1.1\r\nHost: B.Example\r\n\r\n").await;
    assert!(head.contains("X-Served-By: 2"), "got: {head}");
    assert_eq!(a.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn smuggling_attempt_is_rejected_before_backend_contact() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(
        &mut sock,
        b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.0 400"), "got: {head}");
    // the proxy never talked to the backend
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cookie_session_sticks_to_the_first_backend() {
    let b1 = spawn_backend(ok_response_naming(1).to_vec()).await;
    let b2 = spawn_backend(ok_response_naming(2).to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        name = "app"
        session = {{ type = "cookie", ttl = 60, id = "JSID" }}
        [[listener.service.backend]]
        address = "{}"
        [[listener.service.backend]]
        address = "{}"
        "#,
        b1.addr, b2.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(&mut sock, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
    let winner = head
        .lines()
        .find_map(|l| l.strip_prefix("X-Served-By: "))
        .expect("backend marker")
        .trim()
        .to_string();
    let cookie = head
        .lines()
        .find_map(|l| l.strip_prefix("Set-Cookie: "))
        .and_then(|v| v.split(';').next())
        .expect("session cookie");

    // every follow-up carrying the cookie lands on the same backend
    for _ in 0..10 {
        let mut sock = TcpStream::connect(proxy).await.expect("connect");
        let req = format!("GET / HTTP/1.1\r\nHost: h\r\nCookie: {cookie}\r\n\r\n");
        let (head, _) = roundtrip(&mut sock, req.as_bytes()).await;
        let served = head
            .lines()
            .find_map(|l| l.strip_prefix("X-Served-By: "))
            .expect("backend marker")
            .trim()
            .to_string();
        assert_eq!(served, winner);
    }
}

#[tokio::test]
async fn redirect_backend_expands_captures() {
    let proxy = start_proxy(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        match = { url = "^/old/(.*)$" }
        [[listener.service.backend]]
        redirect = 301
        url = "https://new.example/$1"
        "#,
    )
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, body) = roundtrip(&mut sock, b"GET /old/path?x=1 HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.0 301 Moved Permanently"), "got: {head}");
    assert!(
        head.contains("Location: https://new.example/path?x=1"),
        "got: {head}"
    );
    assert!(String::from_utf8_lossy(&body).contains("https://new.example/path?x=1"));
}

#[tokio::test]
async fn websocket_upgrade_tunnels_bytes() {
    let ws = spawn_ws_backend().await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        address = "{ws}"
        ws_timeout = 5
        "#
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    sock.write_all(
        b"GET /ws HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await
    .expect("upgrade request");

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
        .await
        .expect("101 within deadline")
        .expect("101 read");
    let head = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");

    // bytes pumped both ways
    sock.write_all(b"ping").await.expect("tunnel write");
    let mut echo = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), sock.read_exact(&mut echo))
        .await
        .expect("echo within deadline")
        .expect("echo read");
    assert_eq!(&echo, b"ping");
}

#[tokio::test]
async fn overlong_uri_gets_414() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        max_uri_length = 16
        [[listener.service]]
        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let long = format!("GET /{} HTTP/1.1\r\nHost: h\r\n\r\n", "a".repeat(64));
    let (head, _) = roundtrip(&mut sock, long.as_bytes()).await;
    assert!(head.starts_with("HTTP/1.0 414"), "got: {head}");
}

#[tokio::test]
async fn oversize_body_gets_413() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        max_req_size = 10
        [[listener.service]]
        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(
        &mut sock,
        b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.0 413"), "got: {head}");
}

#[tokio::test]
async fn zero_length_body_is_forwarded_unchanged() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(
        &mut sock,
        b"POST /empty HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    let seen = backend.requests.lock().await.join("");
    assert!(seen.contains("Content-Length: 0\r\n"));
}

#[tokio::test]
async fn chunked_request_body_reaches_backend() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(
        &mut sock,
        b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    let seen = backend.requests.lock().await.join("");
    assert!(seen.contains("Transfer-Encoding: chunked"));
}

#[tokio::test]
async fn no_matching_service_yields_503() {
    let proxy = start_proxy(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        match = { url = "^/only-this$" }
        [[listener.service.backend]]
        error = 404
        "#,
    )
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(&mut sock, b"GET /other HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.0 503"), "got: {head}");
}

#[tokio::test]
async fn error_backend_serves_configured_status() {
    let proxy = start_proxy(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        error = 404
        error_body = "<html><body>gone fishing</body></html>"
        "#,
    )
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, body) = roundtrip(&mut sock, b"GET /anything HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.0 404"), "got: {head}");
    assert!(String::from_utf8_lossy(&body).contains("gone fishing"));
}

#[tokio::test]
async fn dead_backend_fails_over_to_the_live_one() {
    let live = spawn_backend(ok_response_naming(1).to_vec()).await;
    // a port nothing listens on: connect will fail fast
    let dead = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let addr = sock.local_addr().expect("probe addr");
        drop(sock);
        addr
    };
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        address = "{dead}"
        priority = 9
        [[listener.service.backend]]
        address = "{}"
        priority = 1
        "#,
        live.addr
    ))
    .await;

    // whichever backend the draw favors, the answer comes from the live one
    for _ in 0..5 {
        let mut sock = TcpStream::connect(proxy).await.expect("connect");
        let (head, _) = roundtrip(&mut sock, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(head.contains("X-Served-By: 1"), "got: {head}");
    }
}

#[tokio::test]
async fn rewrite_set_path_reaches_backend() {
    let backend = spawn_backend(PLAIN_OK.to_vec()).await;
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0

        [[listener.service]]
        match = {{ url = "^/api/(.*)$" }}

        [[listener.service.rewrite]]
        match = {{ url = "^/api/(.*)$" }}
        ops = [{{ set_url = "/v1/$1" }}, {{ set_header = "X-Gateway: portico" }}]

        [[listener.service.backend]]
        address = "{}"
        "#,
        backend.addr
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(&mut sock, b"GET /api/users?id=7 HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    let seen = backend.requests.lock().await.join("");
    assert!(seen.starts_with("GET /v1/users?id=7 HTTP/1.1\r\n"), "got: {seen}");
    assert!(seen.contains("X-Gateway: portico\r\n"));
}

#[tokio::test]
async fn acme_backend_serves_challenge_files() {
    let dir = tempfile::tempdir().expect("challenge dir");
    std::fs::write(dir.path().join("token123"), b"challenge-proof").expect("write challenge");
    let proxy = start_proxy(&format!(
        r#"
        [[listener]]
        address = "127.0.0.1"
        port = 0
        [[listener.service]]
        [[listener.service.backend]]
        acme = "{}"
        "#,
        dir.path().display()
    ))
    .await;

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, body) = roundtrip(
        &mut sock,
        b"GET /.well-known/acme-challenge/token123 HTTP/1.1\r\nHost: h\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.0 200"), "got: {head}");
    assert_eq!(body, b"challenge-proof");

    let mut sock = TcpStream::connect(proxy).await.expect("connect");
    let (head, _) = roundtrip(
        &mut sock,
        b"GET /.well-known/acme-challenge/missing HTTP/1.1\r\nHost: h\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.0 404"), "got: {head}");
}
