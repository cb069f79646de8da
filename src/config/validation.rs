//! Configuration validation.

use crate::config::Config;
use crate::upstream::PoolConfig;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one frontend and one upstream
/// - Unique frontend and upstream names
/// - Frontend upstream references exist
/// - No duplicate listen addresses
/// - Sane pool-wide defaults
/// - Every upstream builds into a pool (addresses, weights, health checks)
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.frontends.is_empty() {
        errors.push("at least one frontend must be defined".to_string());
    }

    if config.upstreams.is_empty() {
        errors.push("at least one upstream must be defined".to_string());
    }

    let upstream_names: HashSet<&str> =
        config.upstreams.iter().map(|u| u.name.as_str()).collect();

    if upstream_names.len() != config.upstreams.len() {
        errors.push("duplicate upstream names detected".to_string());
    }

    let mut frontend_names = HashSet::new();
    let mut listen_addresses = HashSet::new();

    for frontend in &config.frontends {
        if frontend.name.is_empty() {
            errors.push("frontend name cannot be empty".to_string());
        }

        if !frontend_names.insert(&frontend.name) {
            errors.push(format!("duplicate frontend name: {}", frontend.name));
        }

        // Port 0 asks the OS for a fresh port, so it never collides.
        if frontend.listen.port() != 0 && !listen_addresses.insert(frontend.listen) {
            errors.push(format!(
                "duplicate listen address: {} (frontend: {})",
                frontend.listen, frontend.name
            ));
        }

        if !upstream_names.contains(frontend.upstream.as_str()) {
            errors.push(format!(
                "frontend '{}' references non-existent upstream '{}'",
                frontend.name, frontend.upstream
            ));
        }
    }

    let defaults = &config.health_check_defaults;
    if defaults.rise == 0 || defaults.fall == 0 {
        errors.push("health_check_defaults: rise and fall must be >= 1".to_string());
    }
    if defaults.weight == 0 {
        errors.push("health_check_defaults: weight must be >= 1".to_string());
    }
    if defaults.interval.is_zero() || defaults.timeout.is_zero() {
        errors.push("health_check_defaults: interval and timeout must be non-zero".to_string());
    }

    for upstream in &config.upstreams {
        if upstream.name.is_empty() {
            errors.push("upstream name cannot be empty".to_string());
        }

        if upstream.servers.is_empty() {
            errors.push(format!(
                "upstream '{}' must have at least one server",
                upstream.name
            ));
        }

        if let Err(e) = PoolConfig::load(upstream, defaults) {
            errors.push(e.to_string());
        }
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
