//! Active health checker.
//!
//! Runs one task per peer. Each task sleeps for its interval, probes, applies
//! the result and starts over, so a peer never has two probes in flight and
//! a slow peer does not hold up any other. First probes are spread across the
//! interval instead of all firing at once.

use crate::health::probe;
use crate::upstream::{PeerRuntime, UpstreamPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

/// Spawns and owns the probe tasks for one pool generation.
pub struct HealthChecker {
    pool: Arc<UpstreamPool>,
}

impl HealthChecker {
    /// Create a health checker for `pool`.
    pub fn new(pool: Arc<UpstreamPool>) -> Self {
        Self { pool }
    }

    /// Start one probe task per peer.
    ///
    /// Tasks stop when the pool's shutdown signal fires. Must be called from
    /// within a tokio runtime.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let peers = self.pool.peers();
        let count = peers.len();

        info!(upstream = self.pool.name(), peers = count, "health checker starting");

        peers
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                let offset = stagger(peer.spec().interval, index, count);
                let shutdown = self.pool.shutdown().subscribe();
                tokio::spawn(run_peer(
                    Arc::clone(&self.pool),
                    Arc::clone(peer),
                    offset,
                    shutdown,
                ))
            })
            .collect()
    }
}

/// Delay before the first probe of peer `index` out of `count`.
fn stagger(interval: Duration, index: usize, count: usize) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    interval.mul_f64(index as f64 / count as f64)
}

async fn run_peer(
    pool: Arc<UpstreamPool>,
    peer: Arc<PeerRuntime>,
    first_delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let spec = peer.spec();
    let mut delay = first_delay;

    loop {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => break,
        }

        // Dropping the probe on shutdown closes its connection.
        let result = tokio::select! {
            result = probe(spec.address, spec.check.as_ref(), spec.timeout) => result,
            _ = shutdown.recv() => break,
        };

        match &result {
            Ok(()) => debug!(
                upstream = pool.name(),
                peer = %spec.address,
                check = spec.check.name(),
                "health check passed"
            ),
            Err(e) => debug!(
                upstream = pool.name(),
                peer = %spec.address,
                check = spec.check.name(),
                error = %e,
                "health check failed"
            ),
        }

        pool.record_probe(&peer, result.err().map(|e| e.to_string()));
        delay = spec.interval;
    }

    debug!(upstream = pool.name(), peer = %spec.address, "health check task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::TcpConnect;
    use crate::metrics::MetricsCollector;
    use crate::upstream::{PeerSpec, PeerStatus, PoolConfig};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn pool_for(addresses: &[std::net::SocketAddr], interval: Duration) -> Arc<UpstreamPool> {
        let peers = addresses
            .iter()
            .map(|&address| PeerSpec {
                address,
                weight: 1,
                rise: 2,
                fall: 2,
                interval,
                timeout: Duration::from_millis(200),
                check: Arc::new(TcpConnect),
            })
            .collect();
        Arc::new(UpstreamPool::new(
            PoolConfig::from_peers("pool", peers),
            MetricsCollector::new(),
        ))
    }

    async fn wait_for(peer: &PeerRuntime, status: PeerStatus) {
        timeout(Duration::from_secs(5), async {
            while peer.status() != status {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("peer never became {status}, is {}", peer.status()));
    }

    #[test]
    fn test_stagger_spreads_first_probes() {
        let interval = Duration::from_secs(4);
        assert_eq!(stagger(interval, 0, 4), Duration::ZERO);
        assert_eq!(stagger(interval, 1, 4), Duration::from_secs(1));
        assert_eq!(stagger(interval, 3, 4), Duration::from_secs(3));
        assert_eq!(stagger(interval, 0, 0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_probes_drive_peer_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        // A port with nothing behind it.
        let down = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let pool = pool_for(&[up, down], Duration::from_millis(20));
        let handles = HealthChecker::new(Arc::clone(&pool)).spawn();
        assert_eq!(handles.len(), 2);

        wait_for(&pool.peers()[0], PeerStatus::Healthy).await;
        wait_for(&pool.peers()[1], PeerStatus::Unhealthy).await;
        assert_eq!(pool.select().unwrap().address(), up);

        pool.shutdown().shutdown();
        for handle in handles {
            timeout(Duration::from_secs(2), handle)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_peer_recovers_after_rise() {
        // Reserve a port, leave it closed, then start listening on it later.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let pool = pool_for(&[addr], Duration::from_millis(20));
        let _handles = HealthChecker::new(Arc::clone(&pool)).spawn();
        let peer = Arc::clone(&pool.peers()[0]);

        wait_for(&peer, PeerStatus::Unhealthy).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        wait_for(&peer, PeerStatus::Healthy).await;
        assert!(peer.snapshot().last_error.is_none());

        pool.shutdown().shutdown();
    }
}
