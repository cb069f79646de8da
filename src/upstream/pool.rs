//! Upstream pools and the table that holds them.
//!
//! An [`UpstreamPool`] is one generation of one upstream: its peers, their
//! runtime state and the selector. The [`UpstreamManager`] keeps every pool in
//! an [`ArcSwap`]'d table; a reload builds a complete new table and swaps it
//! in, so a selection sees either the old pools or the new ones.

use crate::config::{Config, ConfigError, HealthCheckDefaults, UpstreamConfig};
use crate::health::HealthChecker;
use crate::metrics::MetricsCollector;
use crate::upstream::{
    ActiveConnection, PeerRuntime, PeerSnapshot, PoolConfig, SmoothWeighted, Transition,
};
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by peer selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no available peer in upstream '{0}'")]
    NoAvailablePeer(String),

    #[error("unknown upstream '{0}'")]
    UnknownUpstream(String),
}

/// One generation of an upstream pool.
#[derive(Debug)]
pub struct UpstreamPool {
    config: PoolConfig,
    peers: Vec<Arc<PeerRuntime>>,
    selector: SmoothWeighted,
    metrics: MetricsCollector,
    /// Stops this generation's health check tasks.
    shutdown: ShutdownSignal,
}

impl UpstreamPool {
    /// Create runtime state for every peer in `config`. All peers start
    /// `unknown`.
    pub fn new(config: PoolConfig, metrics: MetricsCollector) -> Self {
        let name: Arc<str> = Arc::from(config.name());
        let peers: Vec<Arc<PeerRuntime>> = config
            .peers()
            .iter()
            .map(|spec| Arc::new(PeerRuntime::new(Arc::clone(&name), spec.clone())))
            .collect();

        for peer in &peers {
            metrics.set_peer_status(config.name(), peer.address(), peer.status());
        }

        Self {
            selector: SmoothWeighted::new(peers.len()),
            config,
            peers,
            metrics,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Peers in configuration order.
    pub fn peers(&self) -> &[Arc<PeerRuntime>] {
        &self.peers
    }

    pub fn peer(&self, address: SocketAddr) -> Option<&Arc<PeerRuntime>> {
        self.peers.iter().find(|p| p.address() == address)
    }

    /// Select a peer by smooth weighted round-robin.
    ///
    /// Only usable peers are considered. If there are none this fails rather
    /// than falling back to a peer known to be bad.
    pub fn select(&self) -> Result<Arc<PeerRuntime>, SelectError> {
        match self.selector.select(&self.peers) {
            Some(peer) => {
                debug!(upstream = self.name(), peer = %peer.address(), "selected peer");
                self.metrics.record_selection(self.name(), peer.address());
                Ok(Arc::clone(peer))
            }
            None => {
                warn!(upstream = self.name(), "no available peer");
                self.metrics.record_no_peer(self.name());
                Err(SelectError::NoAvailablePeer(self.name().to_string()))
            }
        }
    }

    /// Apply a health probe result to `peer`.
    pub fn record_probe(&self, peer: &PeerRuntime, error: Option<String>) {
        let ok = error.is_none();
        self.metrics.record_health_check(self.name(), peer.address(), ok);
        let transition = peer.record_probe(error);
        self.on_transition(peer, transition, "probe");
    }

    /// Report a failure seen on live traffic.
    pub fn report_failure(&self, peer: &PeerRuntime, reason: &str) -> Option<Transition> {
        debug!(upstream = self.name(), peer = %peer.address(), reason, "traffic failure reported");
        let transition = peer.record_failure(reason);
        self.on_transition(peer, transition, "traffic")
    }

    /// Report a success seen on live traffic.
    pub fn report_success(&self, peer: &PeerRuntime) -> Option<Transition> {
        let transition = peer.record_success();
        self.on_transition(peer, transition, "traffic")
    }

    fn on_transition(
        &self,
        peer: &PeerRuntime,
        transition: Option<Transition>,
        source: &'static str,
    ) -> Option<Transition> {
        let transition = transition?;

        self.metrics
            .set_peer_status(self.name(), peer.address(), transition.to);

        if transition.to.is_usable() {
            info!(
                upstream = self.name(),
                peer = %peer.address(),
                from = %transition.from,
                to = %transition.to,
                source,
                "peer status changed"
            );
        } else {
            warn!(
                upstream = self.name(),
                peer = %peer.address(),
                from = %transition.from,
                to = %transition.to,
                source,
                "peer status changed"
            );
        }

        Some(transition)
    }

    /// Snapshots of every peer, in configuration order.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers.iter().map(|p| p.snapshot()).collect()
    }

    /// Signal this generation's health check tasks to stop.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}

/// A selected peer together with the pool generation it came from.
#[derive(Debug, Clone)]
pub struct Selection {
    pool: Arc<UpstreamPool>,
    peer: Arc<PeerRuntime>,
}

impl Selection {
    pub fn address(&self) -> SocketAddr {
        self.peer.address()
    }

    pub fn peer(&self) -> &Arc<PeerRuntime> {
        &self.peer
    }

    pub fn upstream(&self) -> &str {
        self.pool.name()
    }

    /// Count a connection as active on this peer until the guard drops.
    pub fn track_connection(&self) -> ActiveConnection {
        self.peer.track_connection()
    }

    pub fn report_failure(&self, reason: &str) -> Option<Transition> {
        self.pool.report_failure(&self.peer, reason)
    }

    pub fn report_success(&self) -> Option<Transition> {
        self.pool.report_success(&self.peer)
    }
}

/// All pools of one configuration generation.
#[derive(Debug, Default)]
pub struct UpstreamTable {
    pools: HashMap<String, Arc<UpstreamPool>>,
}

impl UpstreamTable {
    /// Build every pool. Fails on the first upstream that does not load, in
    /// which case nothing has been started.
    pub fn build(
        upstreams: &[UpstreamConfig],
        defaults: &HealthCheckDefaults,
        metrics: &MetricsCollector,
    ) -> Result<Self, ConfigError> {
        let mut pools = HashMap::with_capacity(upstreams.len());
        for upstream in upstreams {
            let config = PoolConfig::load(upstream, defaults)?;
            pools.insert(
                upstream.name.clone(),
                Arc::new(UpstreamPool::new(config, metrics.clone())),
            );
        }
        Ok(Self { pools })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<UpstreamPool>> {
        self.pools.get(name)
    }

    /// Pools sorted by name.
    pub fn pools(&self) -> Vec<&Arc<UpstreamPool>> {
        let mut pools: Vec<_> = self.pools.values().collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }

    fn start_health_checks(&self) {
        for pool in self.pools.values() {
            HealthChecker::new(Arc::clone(pool)).spawn();
        }
    }

    fn stop_health_checks(&self) {
        for pool in self.pools.values() {
            pool.shutdown().shutdown();
        }
    }
}

/// Owns the current [`UpstreamTable`] and swaps it on reload.
pub struct UpstreamManager {
    table: ArcSwap<UpstreamTable>,
    metrics: MetricsCollector,
}

impl UpstreamManager {
    /// Build the pools for `config`. Health checks are not started yet.
    pub fn new(config: &Config, metrics: MetricsCollector) -> Result<Self, ConfigError> {
        let table = UpstreamTable::build(&config.upstreams, &config.health_check_defaults, &metrics)?;
        Ok(Self {
            table: ArcSwap::from_pointee(table),
            metrics,
        })
    }

    /// Spawn health check tasks for the current pools. Needs a tokio runtime.
    pub fn start_health_checks(&self) {
        self.table.load().start_health_checks();
    }

    /// Current table.
    pub fn table(&self) -> Arc<UpstreamTable> {
        self.table.load_full()
    }

    pub fn pool(&self, upstream: &str) -> Option<Arc<UpstreamPool>> {
        self.table.load().get(upstream).cloned()
    }

    /// Select a peer from the named upstream.
    pub fn select_peer(&self, upstream: &str) -> Result<Selection, SelectError> {
        let pool = self
            .pool(upstream)
            .ok_or_else(|| SelectError::UnknownUpstream(upstream.to_string()))?;
        let peer = pool.select()?;
        Ok(Selection { pool, peer })
    }

    /// Replace every pool with ones built from `config`.
    ///
    /// On error the current pools stay in place untouched. On success the
    /// old generation's health checks are stopped, its state is dropped once
    /// in-flight connections let go of it, and checks start for the new one.
    pub fn reload(&self, config: &Config) -> Result<(), ConfigError> {
        let table = Arc::new(UpstreamTable::build(
            &config.upstreams,
            &config.health_check_defaults,
            &self.metrics,
        )?);

        let old = self.table.swap(Arc::clone(&table));
        old.stop_health_checks();
        table.start_health_checks();

        info!(upstreams = table.pools.len(), "upstream pools reloaded");
        Ok(())
    }

    /// Stop all health checks.
    pub fn shutdown(&self) {
        self.table.load().stop_health_checks();
    }
}
