//! Configuration data types.

use crate::frontend::AccessList;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Defaults applied to every upstream server
    #[serde(default)]
    pub health_check_defaults: HealthCheckDefaults,

    /// Frontend definitions (where we listen)
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,

    /// Upstream pool definitions
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl Config {
    /// Find a frontend by name.
    pub fn frontend(&self, name: &str) -> Option<&FrontendConfig> {
        self.frontends.iter().find(|f| f.name == name)
    }

    /// Find an upstream by name.
    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Pool-wide defaults for servers that do not override them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckDefaults {
    /// How often to probe each server
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on a single probe, connect included
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive successes before a recovering server is usable again
    #[serde(default = "default_rise")]
    pub rise: u32,

    /// Consecutive failures before a healthy server is taken out
    #[serde(default = "default_fall")]
    pub fall: u32,

    /// Weight for servers that do not set one
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            rise: default_rise(),
            fall: default_fall(),
            weight: default_weight(),
        }
    }
}

/// Frontend configuration (listener).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    /// Unique name for this frontend
    pub name: String,

    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Name of the upstream pool to forward to
    pub upstream: String,

    /// Timeout for connecting to the selected server
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Source address rules, checked before a server is selected
    #[serde(default = "AccessList::allow_all")]
    pub access: AccessList,
}

/// Upstream pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Unique name for this pool
    pub name: String,

    /// Servers in selection order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Health check for every server in this pool (TCP connect if omitted)
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Individual server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server address and port, as written in the file
    pub address: String,

    /// Weight for round-robin selection
    #[serde(default)]
    pub weight: Option<i64>,

    /// Consecutive failures before the server is marked down
    #[serde(default)]
    pub max_fails: Option<u32>,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Check protocol
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,

    /// Line sent after connecting (line checks)
    #[serde(default)]
    pub send: Option<String>,

    /// Expected prefix of the first response line (line checks)
    #[serde(default)]
    pub expect: Option<String>,

    /// HTTP path to request (HTTP checks)
    #[serde(default)]
    pub path: Option<String>,

    /// Expected HTTP status code (HTTP checks)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Override interval for this pool
    #[serde(default, with = "option_humantime_serde")]
    pub interval: Option<Duration>,

    /// Override timeout for this pool
    #[serde(default, with = "option_humantime_serde")]
    pub timeout: Option<Duration>,

    /// Override rise count for this pool
    #[serde(default)]
    pub rise: Option<u32>,

    /// Override fall count for this pool
    #[serde(default)]
    pub fall: Option<u32>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Tcp,
            send: None,
            expect: None,
            path: None,
            expected_status: default_expected_status(),
            interval: None,
            timeout: None,
            rise: None,
            fall: None,
        }
    }
}

/// Type of health check.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// Connection established is enough.
    #[default]
    Tcp,
    /// Optional request line, response must start with `expect`.
    Line,
    Http,
    Smtp,
    Pop3,
    Imap,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_rise() -> u32 {
    2
}

fn default_fall() -> u32 {
    3
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_weight() -> u32 {
    1
}

fn default_expected_status() -> u16 {
    200
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = HealthCheckDefaults::default();
        assert_eq!(defaults.rise, 2);
        assert_eq!(defaults.fall, 3);
        assert_eq!(defaults.weight, 1);
        assert_eq!(defaults.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_check_type_serde() {
        let ty: HealthCheckType = serde_yaml::from_str("line").unwrap();
        assert_eq!(ty, HealthCheckType::Line);

        let ty: HealthCheckType = serde_yaml::from_str("pop3").unwrap();
        assert_eq!(ty, HealthCheckType::Pop3);
    }

    #[test]
    fn test_health_check_durations() {
        let yaml = r#"
type: line
send: "PING"
expect: "+PONG"
interval: 500ms
timeout: 1s
rise: 1
"#;
        let hc: HealthCheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hc.check_type, HealthCheckType::Line);
        assert_eq!(hc.interval, Some(Duration::from_millis(500)));
        assert_eq!(hc.timeout, Some(Duration::from_secs(1)));
        assert_eq!(hc.rise, Some(1));
        assert_eq!(hc.fall, None);
    }

    #[test]
    fn test_frontend_without_access_block_allows_all() {
        let yaml = r#"
name: edge
listen: "127.0.0.1:7000"
upstream: pool
"#;
        let frontend: FrontendConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(frontend.connect_timeout, Duration::from_secs(10));
        assert!(frontend.access.check("10.1.2.3".parse().unwrap()).is_ok());
    }
}
