use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// A scripted upstream server: answers every request on a connection
/// with the same canned response and records what it saw.
pub struct TestBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

pub async fn spawn_backend(response: Vec<u8>) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let conn_count = Arc::clone(&connections);
    let req_log = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            let req_log = Arc::clone(&req_log);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    // gather one request head
                    let head_end = loop {
                        if let Some(pos) = find_head_end(&buf) {
                            break pos;
                        }
                        let mut chunk = [0u8; 4096];
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
                    let body_len = content_length(&head);
                    let total = head_end + 4 + body_len;
                    while buf.len() < total {
                        let mut chunk = [0u8; 4096];
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    req_log
                        .lock()
                        .await
                        .push(String::from_utf8_lossy(&buf[..total]).into_owned());
                    buf.drain(..total);
                    if sock.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    TestBackend { addr, connections, requests }
}

/// An upstream that answers 101 and then echoes every byte back.
pub async fn spawn_ws_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    if find_head_end(&buf).is_some() {
                        break;
                    }
                    let mut chunk = [0u8; 4096];
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let reply = b"HTTP/1.1 101 Switching Protocols\r\n\
                              Upgrade: websocket\r\n\
                              Connection: Upgrade\r\n\r\n";
                if sock.write_all(reply).await.is_err() {
                    return;
                }
                // echo mode
                let mut chunk = [0u8; 4096];
                loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

/// Write a config to disk, build the graph, bind port 0 and serve in the
/// background. Returns the proxy's listen address.
pub async fn start_proxy(config_text: &str) -> SocketAddr {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    file.write_all(config_text.as_bytes()).expect("write config");
    let path = file.path().to_path_buf();
    // keep the file alive for the process lifetime; reload re-reads it
    std::mem::forget(file);

    let cfg = portico_lib::load_from_path(&path).expect("config loads");
    let core = portico_lib::build_core(&cfg, false).expect("core builds");
    let bound = portico_lib::bind(core, path, false).expect("bind succeeds");
    let addr = *bound.local_addrs().first().expect("one inet listener");
    tokio::spawn(bound.run());
    // give the dispatcher a beat to start accepting
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// One HTTP exchange over an existing connection; returns (head, body).
pub async fn roundtrip(sock: &mut TcpStream, request: &[u8]) -> (String, Vec<u8>) {
    sock.write_all(request).await.expect("request write");
    read_response(sock).await
}

pub async fn read_response(sock: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut chunk))
            .await
            .expect("response within deadline")
            .expect("response read");
        if n == 0 {
            break buf.len().saturating_sub(4);
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let body_len = content_length(&head);
    let body_start = head_end + 4;
    while buf.len() < body_start + body_len {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut chunk))
            .await
            .expect("body within deadline")
            .expect("body read");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf[body_start.min(buf.len())..].to_vec();
    (head, body)
}
