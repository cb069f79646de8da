//! Integration tests for tcplb.
//!
//! These run real listeners, peers and health checks on loopback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tcplb::config::{load_config, parse_config, Config};
use tcplb::frontend::FrontendListener;
use tcplb::metrics::MetricsCollector;
use tcplb::upstream::{PeerStatus, Transition};
use tcplb::AppState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

/// Echo server that prefixes every reply with its name.
async fn start_named_echo(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                // Health checks connect and close without sending anything.
                if let Ok(n) = stream.read(&mut buf).await {
                    if n > 0 {
                        let mut reply = format!("{name}:").into_bytes();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = stream.write_all(&reply).await;
                    }
                }
            });
        }
    });

    addr
}

/// An address with nothing listening on it.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn config(peers: &[(SocketAddr, u32)], access: &str) -> Config {
    let servers: String = peers
        .iter()
        .map(|(addr, weight)| format!("      - address: \"{addr}\"\n        weight: {weight}\n"))
        .collect();

    parse_config(&format!(
        r#"
global:
  metrics:
    enabled: false
health_check_defaults:
  interval: 20ms
  timeout: 200ms
  rise: 1
  fall: 1
frontends:
  - name: edge
    listen: "127.0.0.1:0"
    upstream: pool
    connect_timeout: 1s
{access}
upstreams:
  - name: pool
    servers:
{servers}"#
    ))
    .unwrap()
}

/// Bind the frontend and start everything. Returns the listen address.
async fn start(state: &AppState) -> SocketAddr {
    let frontend = state.config().frontends[0].clone();
    let listener = FrontendListener::bind(&frontend, state.clone()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    state.upstreams().start_health_checks();
    tokio::spawn(listener.run(state.shutdown().subscribe()));
    addr
}

async fn wait_for_status(state: &AppState, peer: SocketAddr, status: PeerStatus) {
    timeout(Duration::from_secs(5), async {
        loop {
            let pool = state.upstreams().pool("pool").unwrap();
            if pool.peer(peer).map(|p| p.status()) == Some(status) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{peer} never became {status}"));
}

/// Assert the balancer closes a fresh connection without sending anything.
async fn expect_closed(addr: SocketAddr) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    // A reset is as good as a clean close here.
    match timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("connection was not closed")
    {
        Ok(n) => assert_eq!(n, 0),
        Err(_) => {}
    }
}

/// Send one message through the balancer and return the reply.
async fn round_trip(addr: SocketAddr, msg: &str) -> String {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(msg.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = String::new();
    timeout(Duration::from_secs(5), client.read_to_string(&mut reply))
        .await
        .expect("no reply")
        .unwrap();
    reply
}

#[tokio::test]
async fn test_weighted_proxying_end_to_end() {
    let a = start_named_echo("a").await;
    let b = start_named_echo("b").await;

    let state = AppState::new(config(&[(a, 2), (b, 1)], ""), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, a, PeerStatus::Healthy).await;
    wait_for_status(&state, b, PeerStatus::Healthy).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..30 {
        let reply = round_trip(addr, &format!("ping{i}")).await;
        let (name, echoed) = reply.split_once(':').expect("malformed reply");
        assert_eq!(echoed, format!("ping{i}"));
        *counts.entry(name.to_string()).or_default() += 1;
    }

    assert_eq!(counts["a"], 20);
    assert_eq!(counts["b"], 10);

    let metrics = state.metrics().encode().unwrap();
    assert!(metrics.contains(r#"tcplb_connections_total{frontend="edge",upstream="pool"} 30"#));

    state.trigger_shutdown();
}

#[tokio::test]
async fn test_unhealthy_peer_receives_no_traffic() {
    let up = start_named_echo("up").await;
    let down = closed_port().await;

    let state = AppState::new(config(&[(up, 1), (down, 5)], ""), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, up, PeerStatus::Healthy).await;
    wait_for_status(&state, down, PeerStatus::Unhealthy).await;

    for _ in 0..10 {
        assert!(round_trip(addr, "x").await.starts_with("up:"));
    }

    state.trigger_shutdown();
}

#[tokio::test]
async fn test_no_available_peer_closes_client() {
    let down = closed_port().await;

    let state = AppState::new(config(&[(down, 1)], ""), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, down, PeerStatus::Unhealthy).await;

    expect_closed(addr).await;

    let metrics = state.metrics().encode().unwrap();
    assert!(metrics.contains(r#"tcplb_no_available_peer_total{upstream="pool"} 1"#));

    state.trigger_shutdown();
}

#[tokio::test]
async fn test_access_rules_reject_before_selection() {
    let peer = start_named_echo("a").await;
    let access = r#"    access:
      default: allow
      rules:
        - action: deny
          source: 127.0.0.0/8
"#;

    let state = AppState::new(config(&[(peer, 1)], access), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, peer, PeerStatus::Healthy).await;

    expect_closed(addr).await;

    let metrics = state.metrics().encode().unwrap();
    assert!(metrics.contains(r#"tcplb_access_denied_total{frontend="edge"} 1"#));
    assert!(!metrics.contains("tcplb_peer_selections_total{"));

    state.trigger_shutdown();
}

#[tokio::test]
async fn test_reload_moves_traffic_and_access_rules() {
    let old = start_named_echo("old").await;
    let new = start_named_echo("new").await;

    let state = AppState::new(config(&[(old, 1)], ""), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, old, PeerStatus::Healthy).await;
    assert!(round_trip(addr, "x").await.starts_with("old:"));

    state.reload(config(&[(new, 1)], "")).unwrap();
    wait_for_status(&state, new, PeerStatus::Healthy).await;
    assert!(round_trip(addr, "x").await.starts_with("new:"));

    // Access rules apply from the next connection on.
    let deny_all = "    access:\n      default: deny\n";
    state.reload(config(&[(new, 1)], deny_all)).unwrap();
    expect_closed(addr).await;

    state.trigger_shutdown();
}

#[tokio::test]
async fn test_traffic_failure_and_recovery() {
    let peer = start_named_echo("a").await;

    let state = AppState::new(config(&[(peer, 1)], ""), MetricsCollector::new()).unwrap();
    let addr = start(&state).await;
    wait_for_status(&state, peer, PeerStatus::Healthy).await;

    // With fall = 1 one failure reported by traffic is enough.
    let pool = state.upstreams().pool("pool").unwrap();
    let transition = pool.report_failure(pool.peer(peer).unwrap(), "connection reset");
    assert_eq!(
        transition,
        Some(Transition {
            from: PeerStatus::Healthy,
            to: PeerStatus::Unhealthy
        })
    );

    // Health checks bring it back.
    wait_for_status(&state, peer, PeerStatus::Healthy).await;
    assert!(round_trip(addr, "x").await.starts_with("a:"));

    state.trigger_shutdown();
}

#[test]
fn test_config_parsing() {
    use std::io::Write;
    use tempfile::NamedTempFile;

    let config_content = r#"
global:
  log_level: info

health_check_defaults:
  interval: 2s
  rise: 3

frontends:
  - name: mail
    listen: "127.0.0.1:2525"
    upstream: smtp
    access:
      rules:
        - action: allow
          source: 10.0.0.0/8

upstreams:
  - name: smtp
    health_check:
      type: smtp
      fall: 2
    servers:
      - address: "127.0.0.1:25"
        weight: 3
      - address: "127.0.0.2:25"
        max_fails: 5
"#;

    let mut temp_file = NamedTempFile::new().expect("failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("failed to write config");

    let config = load_config(temp_file.path()).expect("failed to load config");

    assert_eq!(config.frontends.len(), 1);
    assert_eq!(config.frontends[0].upstream, "smtp");
    assert_eq!(config.upstreams[0].servers.len(), 2);

    let state = AppState::new(config, MetricsCollector::new()).unwrap();
    let pool = state.upstreams().pool("smtp").unwrap();
    let peers = pool.config().peers();
    assert_eq!(peers[0].weight, 3);
    assert_eq!(peers[0].rise, 3);
    assert_eq!(peers[0].fall, 2);
    assert_eq!(peers[0].interval, Duration::from_secs(2));
    assert_eq!(peers[1].weight, 1);
    assert_eq!(peers[1].fall, 5);
    assert_eq!(peers[1].check.name(), "smtp");
}

#[test]
fn test_config_validation_missing_upstream() {
    let result = parse_config(
        r#"
frontends:
  - name: test
    listen: "127.0.0.1:0"
    upstream: nonexistent
upstreams:
  - name: pool
    servers:
      - address: "127.0.0.1:9000"
"#,
    );
    assert!(result.is_err());
}
