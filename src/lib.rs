//! tcplb - a TCP load balancer
//!
//! Client connections arriving on a frontend are checked against its access
//! rules and proxied to a peer of the frontend's upstream pool:
//! - Peers are picked by smooth weighted round-robin
//! - Active health checks move peers through a rise/fall state machine
//! - Failures seen on live traffic count like failed checks
//! - Configuration reloads on file change or SIGHUP
//! - Prometheus metrics and a plain-text status page

pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod state;
pub mod upstream;
pub mod util;

pub use config::Config;
pub use state::AppState;
