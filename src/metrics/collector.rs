//! Metrics collector using prometheus-client.
//!
//! Provides metrics for connections, bytes, peer selection and peer health.

use crate::upstream::PeerStatus;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionLabels {
    pub frontend: String,
    pub upstream: String,
}

/// Labels for per-peer metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerLabels {
    pub upstream: String,
    pub peer: String,
}

/// Labels for the peer status gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerStatusLabels {
    pub upstream: String,
    pub peer: String,
    pub status: String,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub frontend: String,
    pub upstream: String,
    pub direction: Direction,
}

/// Direction of bytes transfer.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    /// Client to peer.
    Inbound,
    /// Peer to client.
    Outbound,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub upstream: String,
    pub peer: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Labels for frontend-only metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FrontendLabels {
    pub frontend: String,
}

/// Labels for upstream-only metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub upstream: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total connections accepted and allowed.
    connections_total: Family<ConnectionLabels, Counter>,
    /// Connections currently being proxied.
    active_connections: Family<ConnectionLabels, Gauge>,
    /// Proxy session duration histogram (in seconds).
    session_duration_seconds: Family<ConnectionLabels, Histogram>,
    /// Bytes transferred counter.
    bytes_total: Family<BytesLabels, Counter>,
    /// Connections rejected by access rules.
    access_denied_total: Family<FrontendLabels, Counter>,
    /// Selections per peer.
    selections_total: Family<PeerLabels, Counter>,
    /// Selections that found no usable peer.
    no_peer_total: Family<UpstreamLabels, Counter>,
    /// Peer status, 1 for the current status and 0 for the rest.
    peer_status: Family<PeerStatusLabels, Gauge>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<ConnectionLabels, Counter>::default();
        let active_connections = Family::<ConnectionLabels, Gauge>::default();
        let session_duration_seconds =
            Family::<ConnectionLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 10ms up to roughly an hour
                Histogram::new(exponential_buckets(0.01, 3.0, 12))
            });
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let access_denied_total = Family::<FrontendLabels, Counter>::default();
        let selections_total = Family::<PeerLabels, Counter>::default();
        let no_peer_total = Family::<UpstreamLabels, Counter>::default();
        let peer_status = Family::<PeerStatusLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();

        registry.register(
            "tcplb_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "tcplb_active_connections",
            "Number of connections being proxied",
            active_connections.clone(),
        );
        registry.register(
            "tcplb_session_duration_seconds",
            "Proxy session duration in seconds",
            session_duration_seconds.clone(),
        );
        registry.register("tcplb_bytes", "Total bytes transferred", bytes_total.clone());
        registry.register(
            "tcplb_access_denied",
            "Connections rejected by access rules",
            access_denied_total.clone(),
        );
        registry.register(
            "tcplb_peer_selections",
            "Number of times each peer was selected",
            selections_total.clone(),
        );
        registry.register(
            "tcplb_no_available_peer",
            "Selections that found no usable peer",
            no_peer_total.clone(),
        );
        registry.register(
            "tcplb_peer_status",
            "Peer health status (1 for the current status)",
            peer_status.clone(),
        );
        registry.register(
            "tcplb_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                active_connections,
                session_duration_seconds,
                bytes_total,
                access_denied_total,
                selections_total,
                no_peer_total,
                peer_status,
                health_checks_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Count a connection and mark it active.
    pub fn connection_opened(&self, frontend: &str, upstream: &str) {
        let labels = connection_labels(frontend, upstream);
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Mark a connection as no longer active.
    pub fn connection_closed(&self, frontend: &str, upstream: &str) {
        let labels = connection_labels(frontend, upstream);
        self.inner.active_connections.get_or_create(&labels).dec();
    }

    /// Record a finished proxy session.
    pub fn record_tcp_session(
        &self,
        frontend: &str,
        upstream: &str,
        bytes_to_peer: u64,
        bytes_to_client: u64,
        duration: Duration,
    ) {
        self.inner
            .session_duration_seconds
            .get_or_create(&connection_labels(frontend, upstream))
            .observe(duration.as_secs_f64());

        for (direction, bytes) in [
            (Direction::Inbound, bytes_to_peer),
            (Direction::Outbound, bytes_to_client),
        ] {
            let labels = BytesLabels {
                frontend: frontend.to_string(),
                upstream: upstream.to_string(),
                direction,
            };
            self.inner.bytes_total.get_or_create(&labels).inc_by(bytes);
        }
    }

    pub fn record_access_denied(&self, frontend: &str) {
        let labels = FrontendLabels {
            frontend: frontend.to_string(),
        };
        self.inner.access_denied_total.get_or_create(&labels).inc();
    }

    pub fn record_selection(&self, upstream: &str, peer: SocketAddr) {
        self.inner
            .selections_total
            .get_or_create(&peer_labels(upstream, peer))
            .inc();
    }

    pub fn record_no_peer(&self, upstream: &str) {
        let labels = UpstreamLabels {
            upstream: upstream.to_string(),
        };
        self.inner.no_peer_total.get_or_create(&labels).inc();
    }

    /// Set the status gauge for a peer.
    pub fn set_peer_status(&self, upstream: &str, peer: SocketAddr, status: PeerStatus) {
        for candidate in PeerStatus::ALL {
            let labels = PeerStatusLabels {
                upstream: upstream.to_string(),
                peer: peer.to_string(),
                status: candidate.as_str().to_string(),
            };
            self.inner
                .peer_status
                .get_or_create(&labels)
                .set(i64::from(candidate == status));
        }
    }

    /// Record a health check result.
    pub fn record_health_check(&self, upstream: &str, peer: SocketAddr, success: bool) {
        let labels = HealthCheckLabels {
            upstream: upstream.to_string(),
            peer: peer.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }
}

fn connection_labels(frontend: &str, upstream: &str) -> ConnectionLabels {
    ConnectionLabels {
        frontend: frontend.to_string(),
        upstream: upstream.to_string(),
    }
}

fn peer_labels(upstream: &str, peer: SocketAddr) -> PeerLabels {
    PeerLabels {
        upstream: upstream.to_string(),
        peer: peer.to_string(),
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
