//! Benchmarks for tcplb components.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tcplb::config::parse_config;
use tcplb::frontend::{AccessList, AccessRule, Action};
use tcplb::health::TcpConnect;
use tcplb::metrics::MetricsCollector;
use tcplb::upstream::{PeerRuntime, PeerSpec, PeerStatus, UpstreamManager};
use tcplb::util::ConnectionId;

fn create_manager(weights: &[u32]) -> UpstreamManager {
    let servers: String = weights
        .iter()
        .enumerate()
        .map(|(i, w)| format!("      - address: \"127.0.0.1:{}\"\n        weight: {w}\n", 9000 + i))
        .collect();

    let config = parse_config(&format!(
        r#"
frontends:
  - name: edge
    listen: "127.0.0.1:7000"
    upstream: pool
upstreams:
  - name: pool
    servers:
{servers}"#
    ))
    .unwrap();

    let manager = UpstreamManager::new(&config, MetricsCollector::new()).unwrap();
    let pool = manager.pool("pool").unwrap();
    for peer in pool.peers() {
        pool.record_probe(peer, None);
    }
    manager
}

fn benchmark_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_peer");

    for size in [3usize, 10, 50] {
        let weights: Vec<u32> = (1..=size as u32).collect();
        let manager = create_manager(&weights);

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{size}_peers"), |b| {
            b.iter(|| {
                black_box(manager.select_peer("pool").unwrap());
            })
        });
    }

    group.finish();
}

fn benchmark_select_with_unhealthy(c: &mut Criterion) {
    let manager = create_manager(&[1; 10]);
    let pool = manager.pool("pool").unwrap();
    for peer in pool.peers().iter().step_by(2) {
        pool.record_probe(peer, Some("down".to_string()));
    }

    c.bench_function("select_peer_half_unhealthy", |b| {
        b.iter(|| {
            black_box(manager.select_peer("pool").unwrap());
        })
    });
}

fn benchmark_peer_state(c: &mut Criterion) {
    let peer = PeerRuntime::new(
        Arc::from("pool"),
        PeerSpec {
            address: "127.0.0.1:9000".parse().unwrap(),
            weight: 1,
            rise: 2,
            fall: 3,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            check: Arc::new(TcpConnect),
        },
    );

    c.bench_function("peer_record_probe_success", |b| {
        b.iter(|| {
            black_box(peer.record_probe(None));
        })
    });

    c.bench_function("peer_status", |b| {
        b.iter(|| {
            black_box(peer.status() == PeerStatus::Healthy);
        })
    });
}

fn benchmark_acl(c: &mut Criterion) {
    let rules: Vec<AccessRule> = (0..32u8)
        .map(|i| AccessRule::deny(format!("10.{i}.0.0/16").parse().unwrap()))
        .chain(std::iter::once(AccessRule::allow("all".parse().unwrap())))
        .collect();
    let acl = AccessList::new(rules, Action::Deny);

    let last_rule: IpAddr = "192.0.2.10".parse().unwrap();
    let first_rule: IpAddr = "10.0.1.1".parse().unwrap();
    let mapped: IpAddr = "::ffff:192.0.2.10".parse().unwrap();

    c.bench_function("acl_evaluate_first_rule", |b| {
        b.iter(|| black_box(acl.evaluate(black_box(first_rule))))
    });

    c.bench_function("acl_evaluate_fallthrough", |b| {
        b.iter(|| black_box(acl.evaluate(black_box(last_rule))))
    });

    c.bench_function("acl_evaluate_v4_mapped", |b| {
        b.iter(|| black_box(acl.evaluate(black_box(mapped))))
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new();
    let peer = "127.0.0.1:9000".parse().unwrap();

    c.bench_function("metrics_record_selection", |b| {
        b.iter(|| {
            collector.record_selection(black_box("pool"), black_box(peer));
        })
    });

    c.bench_function("metrics_record_tcp_session", |b| {
        b.iter(|| {
            collector.record_tcp_session(
                black_box("edge"),
                black_box("pool"),
                black_box(1024),
                black_box(4096),
                black_box(Duration::from_millis(50)),
            );
        })
    });
}

fn benchmark_connection_id(c: &mut Criterion) {
    c.bench_function("connection_id_next", |b| {
        b.iter(|| black_box(ConnectionId::next()))
    });
}

criterion_group!(
    benches,
    benchmark_select,
    benchmark_select_with_unhealthy,
    benchmark_peer_state,
    benchmark_acl,
    benchmark_metrics,
    benchmark_connection_id,
);
criterion_main!(benches);
