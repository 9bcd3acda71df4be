use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::Deserialize;

use crate::backend::Backend;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalanceAlgo {
    /// Priority-weighted random draw.
    #[default]
    Random,
    /// Interleaved weighted round-robin (smooth distribution).
    Iwrr,
}

#[derive(Debug)]
struct GroupInner {
    backends: Vec<Arc<Backend>>,
    /// Sum of priorities over alive, enabled backends.
    tot_pri: u32,
    /// Running weights for the interleaved round-robin, parallel to
    /// `backends`.
    current: Vec<i64>,
}

impl GroupInner {
    fn recompute(&mut self) {
        self.tot_pri = self
            .backends
            .iter()
            .filter(|b| b.eligible())
            .map(|b| b.priority)
            .sum();
        if self.current.len() != self.backends.len() {
            self.current = vec![0; self.backends.len()];
        }
    }
}

/// An ordered set of backends sharing a selection algorithm and a
/// priority sum. Insertion order is selection order for tie-breaking.
#[derive(Debug)]
pub struct BalancerGroup {
    algo: BalanceAlgo,
    inner: Mutex<GroupInner>,
}

impl BalancerGroup {
    pub fn new(algo: BalanceAlgo, backends: Vec<Arc<Backend>>) -> BalancerGroup {
        let mut inner = GroupInner {
            current: vec![0; backends.len()],
            backends,
            tot_pri: 0,
        };
        inner.recompute();
        BalancerGroup { algo, inner: Mutex::new(inner) }
    }

    pub fn algo(&self) -> BalanceAlgo {
        self.algo
    }

    pub fn tot_pri(&self) -> u32 {
        self.inner.lock().expect("balancer lock").tot_pri
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("balancer lock").backends.is_empty()
    }

    /// Recompute the priority sum after an alive/disabled flip.
    pub fn recompute(&self) {
        self.inner.lock().expect("balancer lock").recompute();
    }

    /// True if any backend could be selected right now.
    pub fn has_live(&self) -> bool {
        self.inner
            .lock()
            .expect("balancer lock")
            .backends
            .iter()
            .any(|b| b.eligible())
    }

    /// Snapshot of the member list, in insertion order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.inner.lock().expect("balancer lock").backends.clone()
    }

    pub fn add(&self, be: Arc<Backend>) {
        let mut inner = self.inner.lock().expect("balancer lock");
        inner.backends.push(be);
        inner.current.push(0);
        inner.recompute();
    }

    /// Remove by identity. Returns true when the backend was a member.
    pub fn remove(&self, be: &Arc<Backend>) -> bool {
        let mut inner = self.inner.lock().expect("balancer lock");
        let before = inner.backends.len();
        let keep: Vec<bool> = inner
            .backends
            .iter()
            .map(|b| !Arc::ptr_eq(b, be))
            .collect();
        let mut it = keep.iter();
        inner.backends.retain(|_| *it.next().unwrap_or(&true));
        let mut it = keep.iter();
        inner.current.retain(|_| *it.next().unwrap_or(&true));
        inner.recompute();
        inner.backends.len() != before
    }

    /// Pick a backend. A draw that comes up empty because the priority
    /// sum went stale during a health flap is retried once after a
    /// recompute.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let mut inner = self.inner.lock().expect("balancer lock");
        match self.select_locked(&mut inner) {
            Some(be) => Some(be),
            None => {
                inner.recompute();
                self.select_locked(&mut inner)
            }
        }
    }

    fn select_locked(&self, inner: &mut GroupInner) -> Option<Arc<Backend>> {
        match self.algo {
            BalanceAlgo::Random => Self::select_random(inner),
            BalanceAlgo::Iwrr => Self::select_iwrr(inner),
        }
    }

    fn select_random(inner: &mut GroupInner) -> Option<Arc<Backend>> {
        if inner.tot_pri == 0 {
            return None;
        }
        let draw = rand::thread_rng().gen_range(0..inner.tot_pri);
        let mut acc = 0u32;
        for be in &inner.backends {
            if !be.eligible() {
                continue;
            }
            acc += be.priority;
            if acc > draw {
                return Some(Arc::clone(be));
            }
        }
        None
    }

    /// Smooth weighted round-robin: each eligible backend gains its
    /// priority, the leader is chosen and pays back the total. No backend
    /// is picked twice in a row unless it is the only one eligible.
    fn select_iwrr(inner: &mut GroupInner) -> Option<Arc<Backend>> {
        let mut best: Option<usize> = None;
        let mut total: i64 = 0;
        for (i, be) in inner.backends.iter().enumerate() {
            if !be.eligible() || be.priority == 0 {
                continue;
            }
            inner.current[i] += be.priority as i64;
            total += be.priority as i64;
            if best.map_or(true, |b| inner.current[i] > inner.current[b]) {
                best = Some(i);
            }
        }
        let best = best?;
        inner.current[best] -= total;
        Some(Arc::clone(&inner.backends[best]))
    }
}
