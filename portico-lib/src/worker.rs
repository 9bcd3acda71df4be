use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::listener::Listener;

/// An accepted client socket on its way to a worker.
pub enum AcceptedSock {
    Tcp(TcpStream, std::net::SocketAddr),
    Unix(UnixStream),
}

/// What the dispatcher hands a worker: the socket, its peer, and the
/// listener it arrived on.
pub struct ThreadArg {
    pub sock: AcceptedSock,
    pub listener: Arc<Listener>,
}

impl ThreadArg {
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match &self.sock {
            AcceptedSock::Tcp(_, peer) => Some(peer.ip()),
            AcceptedSock::Unix(_) => None,
        }
    }

    /// Peer rendering for logs; UNIX peers have no address.
    pub fn peer_label(&self) -> String {
        match &self.sock {
            AcceptedSock::Tcp(_, peer) => peer.ip().to_string(),
            AcceptedSock::Unix(_) => "socket".to_string(),
        }
    }
}

pub type Handler<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct PoolInner<T> {
    rx: Mutex<mpsc::Receiver<T>>,
    handler: Handler<T>,
    min: usize,
    max: usize,
    idle: Duration,
    spawned: AtomicUsize,
    busy: AtomicUsize,
}

/// A bounded worker pool fed from one shared queue. Workers block on the
/// queue; idle workers beyond the minimum exit after the idle timeout;
/// the pool grows by one when every worker is busy and room remains. An
/// accept beyond capacity waits in the queue rather than being lost.
pub struct WorkerPool<T: Send + 'static> {
    tx: mpsc::Sender<T>,
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(
        min: usize,
        max: usize,
        idle: Duration,
        handler: Handler<T>,
    ) -> WorkerPool<T> {
        let min = min.max(1);
        let max = max.max(min);
        let (tx, rx) = mpsc::channel(max);
        let inner = Arc::new(PoolInner {
            rx: Mutex::new(rx),
            handler,
            min,
            max,
            idle,
            spawned: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
        });
        let pool = WorkerPool { tx, inner };
        for _ in 0..min {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        inner.spawned.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                let received = {
                    let mut rx = inner.rx.lock().await;
                    tokio::time::timeout(inner.idle, rx.recv()).await
                };
                match received {
                    Ok(Some(job)) => {
                        inner.busy.fetch_add(1, Ordering::SeqCst);
                        (inner.handler)(job).await;
                        inner.busy.fetch_sub(1, Ordering::SeqCst);
                    }
                    // queue closed: the pool is shutting down
                    Ok(None) => break,
                    Err(_) => {
                        if inner.spawned.load(Ordering::SeqCst) > inner.min {
                            debug!("idle worker exiting");
                            break;
                        }
                    }
                }
            }
            inner.spawned.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Queue a job, growing the pool first if everyone is busy and the
    /// cap allows. Blocks when the queue is full; returns false only when
    /// the pool is gone.
    pub async fn dispatch(&self, job: T) -> bool {
        let spawned = self.inner.spawned.load(Ordering::SeqCst);
        let busy = self.inner.busy.load(Ordering::SeqCst);
        if busy >= spawned && spawned < self.inner.max {
            self.spawn_worker();
        }
        self.tx.send(job).await.is_ok()
    }

    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Wait until in-flight work drains or the grace deadline passes.
    /// Returns true on a clean drain.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.busy() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done: Arc<AtomicUsize>,
        hold: Duration,
    ) -> Handler<u32> {
        Box::new(move |_job| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn pool_runs_all_jobs() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            2,
            4,
            Duration::from_secs(30),
            counting_handler(running, peak, done.clone(), Duration::from_millis(10)),
        );
        for job in 0..20 {
            assert!(pool.dispatch(job).await);
        }
        pool.drain(Duration::from_secs(5)).await;
        // the queue may still hold jobs after the last worker went busy;
        // wait for the counter to settle
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_max() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            1,
            3,
            Duration::from_secs(30),
            counting_handler(running, peak.clone(), done.clone(), Duration::from_millis(30)),
        );
        for job in 0..10 {
            assert!(pool.dispatch(job).await);
        }
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.workers() <= 3);
    }

    #[tokio::test]
    async fn extra_job_waits_instead_of_being_lost() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        // max=1: the queue holds one job while another runs
        let pool = WorkerPool::new(
            1,
            1,
            Duration::from_secs(30),
            counting_handler(running, peak.clone(), done.clone(), Duration::from_millis(20)),
        );
        assert!(pool.dispatch(1).await);
        assert!(pool.dispatch(2).await);
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_workers_above_min_exit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(
            1,
            4,
            Duration::from_millis(20),
            counting_handler(running, peak, done.clone(), Duration::from_millis(5)),
        );
        for job in 0..8 {
            pool.dispatch(job).await;
        }
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // after a few idle periods the pool shrinks back toward min
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.workers() <= 2, "pool kept {} workers", pool.workers());
    }
}
