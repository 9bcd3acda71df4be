use std::sync::Arc;

use crate::listener::Listener;
use crate::metrics::Metrics;

/// The runtime configuration graph: read-only after load apart from the
/// atomics inside. A reload builds a fresh service graph and republishes
/// it through each listener's `ArcSwap`; the old graph is freed when the
/// last in-flight request drops its references.
#[derive(Debug)]
pub struct Core {
    pub listeners: Vec<Arc<Listener>>,
    pub metrics: Arc<Metrics>,
    /// Grace period for draining on shutdown or reload.
    pub grace: std::time::Duration,
    /// Liveness probe period for dead backends.
    pub alive_interval: std::time::Duration,
    pub worker_min: usize,
    pub worker_max: usize,
    pub worker_idle_timeout: std::time::Duration,
}
