//! Peer registry: the static, validated description of an upstream pool.

use crate::config::{ConfigError, HealthCheckConfig, HealthCheckDefaults, UpstreamConfig};
use crate::health::{self, CheckProtocol};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Static attributes of one configured server. Never changes after load.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub address: SocketAddr,
    pub weight: u32,
    /// Consecutive successes that bring a recovering peer back.
    pub rise: u32,
    /// Consecutive failures that take a healthy peer out.
    pub fall: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub check: Arc<dyn CheckProtocol>,
}

/// A validated upstream pool definition.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    name: String,
    peers: Vec<PeerSpec>,
}

impl PoolConfig {
    /// Build a pool definition from configuration.
    ///
    /// Server order is kept as written; selection tie-breaks depend on it.
    pub fn load(
        upstream: &UpstreamConfig,
        defaults: &HealthCheckDefaults,
    ) -> Result<Self, ConfigError> {
        let default_check = HealthCheckConfig::default();
        let check_config = upstream.health_check.as_ref().unwrap_or(&default_check);

        let invalid_check = |reason: String| ConfigError::InvalidHealthCheck {
            upstream: upstream.name.clone(),
            reason,
        };

        let check = health::from_config(check_config).map_err(invalid_check)?;

        let interval = check_config.interval.unwrap_or(defaults.interval);
        let timeout = check_config.timeout.unwrap_or(defaults.timeout);
        let rise = check_config.rise.unwrap_or(defaults.rise);
        let pool_fall = check_config.fall.unwrap_or(defaults.fall);

        if interval.is_zero() || timeout.is_zero() {
            return Err(invalid_check(
                "interval and timeout must be non-zero".to_string(),
            ));
        }
        if rise == 0 {
            return Err(invalid_check("rise must be >= 1".to_string()));
        }

        let mut seen = HashSet::new();
        let mut peers = Vec::with_capacity(upstream.servers.len());

        for server in &upstream.servers {
            let address: SocketAddr =
                server
                    .address
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress {
                        upstream: upstream.name.clone(),
                        address: server.address.clone(),
                    })?;

            let weight = server.weight.unwrap_or(i64::from(defaults.weight));
            let weight = u32::try_from(weight)
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| ConfigError::InvalidWeight {
                    upstream: upstream.name.clone(),
                    address,
                    weight,
                })?;

            let fall = server.max_fails.unwrap_or(pool_fall);
            if fall == 0 {
                return Err(invalid_check(format!(
                    "server {address}: fall / max_fails must be >= 1"
                )));
            }

            if !seen.insert(address) {
                return Err(ConfigError::DuplicateAddress {
                    upstream: upstream.name.clone(),
                    address,
                });
            }

            peers.push(PeerSpec {
                address,
                weight,
                rise,
                fall,
                interval,
                timeout,
                check: Arc::clone(&check),
            });
        }

        Ok(Self {
            name: upstream.name.clone(),
            peers,
        })
    }

    /// Build a pool definition directly from specs.
    pub fn from_peers(name: impl Into<String>, peers: Vec<PeerSpec>) -> Self {
        Self {
            name: name.into(),
            peers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Peers in configuration order.
    pub fn peers(&self) -> &[PeerSpec] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
