use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendAddr};
use crate::config::{build_core, load_from_path};
use crate::core::Core;
use crate::error::{ProxyError, Result};
use crate::http::handler::handle_connection;
use crate::listener::{BindAddr, Listener};
use crate::worker::{AcceptedSock, ThreadArg, WorkerPool};

/// One bound front-end socket.
enum Endpoint {
    Tcp(TcpListener, Arc<Listener>),
    Unix(UnixListener, Arc<Listener>),
}

impl Endpoint {
    async fn accept(&self) -> io::Result<ThreadArg> {
        match self {
            Endpoint::Tcp(sock, listener) => {
                let (stream, peer) = sock.accept().await?;
                Ok(ThreadArg {
                    sock: AcceptedSock::Tcp(stream, peer),
                    listener: Arc::clone(listener),
                })
            }
            Endpoint::Unix(sock, listener) => {
                let (stream, _) = sock.accept().await?;
                Ok(ThreadArg {
                    sock: AcceptedSock::Unix(stream),
                    listener: Arc::clone(listener),
                })
            }
        }
    }
}

/// Receive a pre-bound TCP listener over a UNIX socket as SCM_RIGHTS
/// ancillary data, one descriptor per message.
#[allow(unsafe_code)]
fn recv_listener_fd(path: &Path) -> Result<std::net::TcpListener> {
    use nix::cmsg_space;
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
    use std::io::IoSliceMut;
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};
    use std::os::unix::net::UnixStream as StdUnixStream;

    let stream = StdUnixStream::connect(path).map_err(|e| {
        ProxyError::Config(format!("socket_from {}: {e}", path.display()))
    })?;

    let mut data = [0u8; 16];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg = cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(|e| ProxyError::Config(format!("socket_from {}: recvmsg: {e}", path.display())))?;

    let cmsgs = msg
        .cmsgs()
        .map_err(|e| ProxyError::Config(format!("socket_from {}: {e}", path.display())))?;
    for c in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = c {
            if let Some(&fd) = fds.first() {
                // SAFETY: the peer handed us ownership of this descriptor
                // in the SCM_RIGHTS payload; nothing else refers to it.
                let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                listener
                    .set_nonblocking(true)
                    .map_err(ProxyError::Io)?;
                return Ok(listener);
            }
        }
    }
    Err(ProxyError::Config(format!(
        "socket_from {}: no descriptor received",
        path.display()
    )))
}

/// A bound socket that hasn't joined the runtime yet. Binding happens
/// before privileges drop; registration with the reactor happens in
/// `BoundServer::run`.
enum StdEndpoint {
    Tcp(std::net::TcpListener, Arc<Listener>),
    Unix(std::os::unix::net::UnixListener, Arc<Listener>),
}

fn bind_endpoint(listener: &Arc<Listener>) -> Result<StdEndpoint> {
    match &listener.bind {
        BindAddr::Inet(sa) => {
            let sock = std::net::TcpListener::bind(sa)
                .map_err(|e| ProxyError::Config(format!("can't bind {sa}: {e}")))?;
            sock.set_nonblocking(true).map_err(ProxyError::Io)?;
            Ok(StdEndpoint::Tcp(sock, Arc::clone(listener)))
        }
        BindAddr::Unix(path) => {
            // a stale socket file blocks the bind
            let _ = std::fs::remove_file(path);
            let sock = std::os::unix::net::UnixListener::bind(path)
                .map_err(|e| ProxyError::Config(format!("can't bind {}: {e}", path.display())))?;
            sock.set_nonblocking(true).map_err(ProxyError::Io)?;
            Ok(StdEndpoint::Unix(sock, Arc::clone(listener)))
        }
        BindAddr::SocketFrom(path) => {
            let sock = recv_listener_fd(path)?;
            Ok(StdEndpoint::Tcp(sock, Arc::clone(listener)))
        }
    }
}

fn all_backends(core: &Arc<Core>) -> Vec<Arc<Backend>> {
    let mut out = Vec::new();
    for listener in &core.listeners {
        for svc in listener.service_list().iter() {
            out.extend(svc.normal.backends());
            if let Some(g) = &svc.emergency {
                out.extend(g.backends());
            }
        }
    }
    out
}

/// Re-probe dead backends with a plain connect; success restores their
/// priority.
async fn health_ticker(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(core.alive_interval) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        for be in all_backends(&core) {
            let Some(regular) = be.regular() else { continue };
            if be.is_alive() {
                continue;
            }
            let ok = match &regular.addr {
                BackendAddr::Inet(sa) => {
                    matches!(
                        tokio::time::timeout(regular.conn_timeout, tokio::net::TcpStream::connect(sa)).await,
                        Ok(Ok(_))
                    )
                }
                BackendAddr::Unix(path) => {
                    tokio::net::UnixStream::connect(path).await.is_ok()
                }
            };
            if ok {
                info!(backend = %be.label(), "backend resurrected");
                be.set_alive(true);
            }
        }
        // restore priority sums after any flips
        for listener in &core.listeners {
            for svc in listener.service_list().iter() {
                svc.normal.recompute();
                if let Some(g) = &svc.emergency {
                    g.recompute();
                }
            }
        }
    }
}

async fn session_sweeper(core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        let now = std::time::Instant::now();
        for listener in &core.listeners {
            for svc in listener.service_list().iter() {
                svc.sweep_sessions(now);
            }
        }
    }
}

/// Rebuild the configuration graph and republish service lists on the
/// listeners that survive. Listener sockets live for the process
/// lifetime; adding or removing a bind address needs a restart.
fn reload(core: &Arc<Core>, config_path: &Path, dns_enabled: bool) {
    let rebuilt = load_from_path(config_path).and_then(|cfg| build_core(&cfg, dns_enabled));
    match rebuilt {
        Ok(new_core) => {
            for old in &core.listeners {
                match new_core
                    .listeners
                    .iter()
                    .find(|n| n.name() == old.name())
                {
                    Some(newer) => old.services.store(newer.service_list()),
                    None => warn!(
                        listener = %old.name(),
                        "listener absent from new configuration; keeping old services"
                    ),
                }
            }
            for newer in &new_core.listeners {
                if !core.listeners.iter().any(|o| o.name() == newer.name()) {
                    warn!(
                        listener = %newer.name(),
                        "new listener in configuration needs a restart to take effect"
                    );
                }
            }
            info!("configuration reloaded");
        }
        Err(e) => error!(error = %e, "reload failed, keeping old configuration"),
    }
}

/// The proxy with its sockets bound, ready to serve. Splitting bind from
/// run lets the caller drop privileges in between.
pub struct BoundServer {
    core: Arc<Core>,
    endpoints: Vec<StdEndpoint>,
    config_path: PathBuf,
    dns_enabled: bool,
}

/// Bind every listener socket.
pub fn bind(core: Arc<Core>, config_path: PathBuf, dns_enabled: bool) -> Result<BoundServer> {
    let endpoints: Vec<StdEndpoint> = core
        .listeners
        .iter()
        .map(bind_endpoint)
        .collect::<Result<_>>()?;
    if endpoints.is_empty() {
        return Err(ProxyError::Config("no listeners configured".into()));
    }
    Ok(BoundServer { core, endpoints, config_path, dns_enabled })
}

impl BoundServer {
    /// Local addresses of the bound inet listeners, in configuration
    /// order. Useful when a listener bound port 0.
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.endpoints
            .iter()
            .filter_map(|ep| match ep {
                StdEndpoint::Tcp(sock, _) => sock.local_addr().ok(),
                StdEndpoint::Unix(..) => None,
            })
            .collect()
    }

    /// Serve until a shutdown signal: one dispatcher over all listener
    /// sockets, the worker pool, and the background upkeep tasks.
    pub async fn run(self) -> Result<()> {
        run_inner(self.core, self.endpoints, self.config_path, self.dns_enabled).await
    }
}

async fn run_inner(
    core: Arc<Core>,
    std_endpoints: Vec<StdEndpoint>,
    config_path: PathBuf,
    dns_enabled: bool,
) -> Result<()> {
    let endpoints: Vec<Endpoint> = std_endpoints
        .into_iter()
        .map(|ep| {
            Ok(match ep {
                StdEndpoint::Tcp(sock, l) => {
                    Endpoint::Tcp(TcpListener::from_std(sock).map_err(ProxyError::Io)?, l)
                }
                StdEndpoint::Unix(sock, l) => {
                    Endpoint::Unix(UnixListener::from_std(sock).map_err(ProxyError::Io)?, l)
                }
            })
        })
        .collect::<Result<_>>()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = {
        let core = Arc::clone(&core);
        let shutdown_rx = shutdown_rx.clone();
        WorkerPool::new(
            core.worker_min,
            core.worker_max,
            core.worker_idle_timeout,
            Box::new(move |arg: ThreadArg| {
                let core = Arc::clone(&core);
                let shutdown_rx = shutdown_rx.clone();
                Box::pin(handle_connection(core, arg, shutdown_rx))
            }),
        )
    };

    tokio::spawn(crate::resolver::run(Arc::clone(&core), shutdown_rx.clone()));
    tokio::spawn(health_ticker(Arc::clone(&core), shutdown_rx.clone()));
    tokio::spawn(session_sweeper(Arc::clone(&core), shutdown_rx.clone()));

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ProxyError::Io(io::Error::other(format!("SIGTERM handler: {e}"))))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ProxyError::Io(io::Error::other(format!("SIGINT handler: {e}"))))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| ProxyError::Io(io::Error::other(format!("SIGHUP handler: {e}"))))?;

    for listener in &core.listeners {
        info!(address = %listener.name(), https = listener.is_https(), "listening");
    }

    loop {
        let accept_any = async {
            let futures: Vec<_> = endpoints.iter().map(|ep| Box::pin(ep.accept())).collect();
            select_all(futures).await
        };
        tokio::select! {
            (result, _, _) = accept_any => {
                match result {
                    Ok(arg) => {
                        if !pool.dispatch(arg).await {
                            warn!("worker pool gone, stopping");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, starting graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT, starting graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP, reloading configuration");
                reload(&core, &config_path, dns_enabled);
            }
        }
    }

    // stop accepting, let in-flight requests drain within the grace period
    let _ = shutdown_tx.send(true);
    drop(endpoints);
    if pool.drain(core.grace).await {
        info!("all connections drained, shutdown complete");
    } else {
        warn!(active = pool.busy(), "grace period expired with connections still active");
    }
    Ok(())
}

/// Drop root privileges and optionally chroot, the way a long-lived
/// daemon detaches from its startup identity. Must run after sockets are
/// bound.
pub fn drop_privileges(
    user: Option<&str>,
    group: Option<&str>,
    root_jail: Option<&Path>,
) -> Result<()> {
    use nix::unistd::{chroot, setgid, setuid, Gid, Group as NixGroup, Uid, User as NixUser};

    if let Some(jail) = root_jail {
        chroot(jail)
            .map_err(|e| ProxyError::Config(format!("chroot {}: {e}", jail.display())))?;
        std::env::set_current_dir("/")
            .map_err(|e| ProxyError::Config(format!("chdir after chroot: {e}")))?;
    }
    if let Some(name) = group {
        let grp = NixGroup::from_name(name)
            .map_err(|e| ProxyError::Config(format!("group {name:?}: {e}")))?
            .ok_or_else(|| ProxyError::Config(format!("unknown group {name:?}")))?;
        setgid(Gid::from_raw(grp.gid.as_raw()))
            .map_err(|e| ProxyError::Config(format!("setgid {name:?}: {e}")))?;
    }
    if let Some(name) = user {
        let usr = NixUser::from_name(name)
            .map_err(|e| ProxyError::Config(format!("user {name:?}: {e}")))?
            .ok_or_else(|| ProxyError::Config(format!("unknown user {name:?}")))?;
        setuid(Uid::from_raw(usr.uid.as_raw()))
            .map_err(|e| ProxyError::Config(format!("setuid {name:?}: {e}")))?;
    }
    Ok(())
}
