//! tcplb - a TCP load balancer with active health checking
//!
//! Usage:
//!     tcplb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

use tcplb::config::{load_config, Config, ConfigWatcher};
use tcplb::frontend::FrontendListener;
use tcplb::metrics::{MetricsCollector, MetricsServer};
use tcplb::upstream::PoolConfig;
use tcplb::util::init_logging;
use tcplb::AppState;

/// TCP load balancer with weighted peer selection and active health checks.
#[derive(Parser, Debug)]
#[command(name = "tcplb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        print_summary(&config)?;
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        frontends = config.frontends.len(),
        upstreams = config.upstreams.len(),
        "tcplb starting"
    );

    for frontend in &config.frontends {
        info!(
            name = %frontend.name,
            listen = %frontend.listen,
            upstream = %frontend.upstream,
            "configured frontend"
        );
    }

    for upstream in &config.upstreams {
        info!(
            name = %upstream.name,
            servers = upstream.servers.len(),
            "configured upstream"
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config, cli.config))
}

fn print_summary(config: &Config) -> Result<()> {
    println!("Configuration is valid.");
    println!("  Frontends: {}", config.frontends.len());
    for frontend in &config.frontends {
        println!(
            "    - {} ({}) -> {} [{} access rules]",
            frontend.name,
            frontend.listen,
            frontend.upstream,
            frontend.access.rules.len()
        );
    }

    println!("  Upstreams: {}", config.upstreams.len());
    for upstream in &config.upstreams {
        let pool = PoolConfig::load(upstream, &config.health_check_defaults)?;
        println!("    - {}", pool.name());
        for peer in pool.peers() {
            println!(
                "        {} weight={} rise={} fall={} check={}",
                peer.address,
                peer.weight,
                peer.rise,
                peer.fall,
                peer.check.name()
            );
        }
    }
    Ok(())
}

async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let metrics_config = config.global.metrics.clone();
    let frontends = config.frontends.clone();

    let metrics = MetricsCollector::new();
    let state = AppState::new(config, metrics.clone()).context("failed to build upstream pools")?;

    // Bind every listener before starting anything, so a bad address fails
    // startup cleanly.
    let mut listeners = Vec::with_capacity(frontends.len());
    for frontend in &frontends {
        let listener = FrontendListener::bind(frontend, state.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to bind frontend '{}' on {}",
                    frontend.name, frontend.listen
                )
            })?;
        listeners.push(listener);
    }

    state.upstreams().start_health_checks();

    let mut handles = Vec::new();
    for listener in listeners {
        let shutdown = state.shutdown().subscribe();
        handles.push(tokio::spawn(listener.run(shutdown)));
    }

    if metrics_config.enabled {
        let server = MetricsServer::new(
            metrics_config.address,
            metrics_config.path,
            metrics,
            std::sync::Arc::clone(state.upstreams()),
        );
        let shutdown = state.shutdown().subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!(error = %e, address = %metrics_config.address, "metrics server failed");
            }
        }));
    }

    let reload_state = state.clone();
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |config| reload_state.reload(config)),
    );
    handles.push(tokio::spawn(watcher.run(state.shutdown().subscribe())));

    info!("tcplb is running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    state.trigger_shutdown();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "task ended abnormally");
        }
    }

    info!("tcplb shut down complete");
    Ok(())
}
