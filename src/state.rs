//! Shared application state.

use crate::config::{Config, ConfigError};
use crate::metrics::MetricsCollector;
use crate::upstream::UpstreamManager;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state accessible from all tasks.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration (can be swapped atomically for hot reload).
    config: Arc<ArcSwap<Config>>,

    /// Upstream pools and their peer state.
    upstreams: Arc<UpstreamManager>,

    metrics: MetricsCollector,

    /// Process-wide shutdown signal.
    shutdown: ShutdownSignal,
}

impl AppState {
    /// Build the upstream pools for `config`. Health checks are not started.
    pub fn new(config: Config, metrics: MetricsCollector) -> Result<Self, ConfigError> {
        let upstreams = UpstreamManager::new(&config, metrics.clone())?;
        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            upstreams: Arc::new(upstreams),
            metrics,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Apply a new, already validated configuration.
    ///
    /// Upstream pools are rebuilt first; the configuration is only swapped
    /// if that succeeds, so a bad reload leaves everything as it was.
    /// Listeners are bound once at startup, so a frontend whose listen
    /// address changed keeps its old one until restart.
    pub fn reload(&self, config: Config) -> Result<(), ConfigError> {
        self.upstreams.reload(&config)?;

        let current = self.config.load();
        for frontend in &config.frontends {
            match current.frontend(&frontend.name) {
                Some(old) if old.listen == frontend.listen => {}
                Some(old) => warn!(
                    frontend = %frontend.name,
                    old = %old.listen,
                    new = %frontend.listen,
                    "listen address change requires a restart"
                ),
                None => warn!(
                    frontend = %frontend.name,
                    "new frontend requires a restart"
                ),
            }
        }

        self.config.store(Arc::new(config));
        info!("configuration reloaded");
        Ok(())
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Stop listeners, the metrics server and all health checks.
    pub fn trigger_shutdown(&self) {
        self.shutdown.shutdown();
        self.upstreams.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::frontend::Action;

    fn config(access_default: &str, weight: i64) -> Config {
        parse_config(&format!(
            r#"
frontends:
  - name: edge
    listen: "127.0.0.1:7000"
    upstream: pool
    access:
      default: {access_default}
upstreams:
  - name: pool
    servers:
      - address: "127.0.0.1:9001"
        weight: {weight}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_reload_swaps_config_and_pools() {
        let state = AppState::new(config("deny", 1), MetricsCollector::new()).unwrap();
        let before = state.upstreams().pool("pool").unwrap();
        let ip = "192.0.2.1".parse().unwrap();
        assert_eq!(state.config().frontends[0].access.evaluate(ip), Action::Deny);

        state.reload(config("allow", 3)).unwrap();

        let after = state.upstreams().pool("pool").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.peers()[0].weight(), 3);
        assert_eq!(state.config().frontends[0].access.evaluate(ip), Action::Allow);

        state.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_config() {
        let state = AppState::new(config("deny", 1), MetricsCollector::new()).unwrap();

        let mut bad = config("allow", 1);
        bad.upstreams[0].servers[0].weight = Some(0);
        assert!(state.reload(bad).is_err());

        let ip = "192.0.2.1".parse().unwrap();
        assert_eq!(state.config().frontends[0].access.evaluate(ip), Action::Deny);
        assert_eq!(state.upstreams().pool("pool").unwrap().peers()[0].weight(), 1);
    }
}
