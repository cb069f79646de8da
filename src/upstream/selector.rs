//! Smooth weighted round-robin.
//!
//! Every call adds each usable peer's weight to its running accumulator,
//! picks the largest accumulator and takes the total usable weight off the
//! winner. Weights {5, 1, 1} give `a a b a c a a` rather than five `a`s in a
//! row.

use crate::upstream::PeerRuntime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Selection state for one pool.
///
/// Accumulators are indexed by peer position and updated under a single
/// lock, so two concurrent callers can never both win the same peak.
#[derive(Debug)]
pub struct SmoothWeighted {
    current: Mutex<Vec<i64>>,
}

impl SmoothWeighted {
    pub fn new(peers: usize) -> Self {
        Self {
            current: Mutex::new(vec![0; peers]),
        }
    }

    /// Pick the next peer among the usable ones, or `None` if there are none.
    ///
    /// Ties go to the peer registered first.
    pub fn select<'a>(&self, peers: &'a [Arc<PeerRuntime>]) -> Option<&'a Arc<PeerRuntime>> {
        let mut current = self.current.lock();
        if current.len() < peers.len() {
            current.resize(peers.len(), 0);
        }

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;

        for (i, peer) in peers.iter().enumerate() {
            if !peer.is_usable() {
                continue;
            }

            let weight = i64::from(peer.weight());
            current[i] += weight;
            total += weight;

            if best.is_none_or(|b| current[i] > current[b]) {
                best = Some(i);
            }
        }

        let chosen = best?;
        current[chosen] -= total;
        Some(&peers[chosen])
    }

    /// Current accumulator values, in peer order.
    pub fn accumulators(&self) -> Vec<i64> {
        self.current.lock().clone()
    }
}
