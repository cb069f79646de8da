//! Metrics and status HTTP server.
//!
//! Serves Prometheus metrics, a liveness probe and a plain-text table of
//! every peer's current state.

use crate::metrics::MetricsCollector;
use crate::upstream::UpstreamManager;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// HTTP endpoint for metrics and peer status.
pub struct MetricsServer {
    address: SocketAddr,
    /// Path for the Prometheus endpoint.
    path: String,
    collector: MetricsCollector,
    upstreams: Arc<UpstreamManager>,
}

impl MetricsServer {
    pub fn new(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
        upstreams: Arc<UpstreamManager>,
    ) -> Self {
        Self {
            address,
            path,
            collector,
            upstreams,
        }
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        let address = listener.local_addr().unwrap_or(self.address);
        info!(address = %address, path = %self.path, "metrics server started");

        let context = Arc::new(Context {
            path: self.path,
            collector: self.collector,
            upstreams: self.upstreams,
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let context = Arc::clone(&context);
                                    async move { Ok::<_, Infallible>(context.handle(&req)) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

struct Context {
    path: String,
    collector: MetricsCollector,
    upstreams: Arc<UpstreamManager>,
}

impl Context {
    fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        debug!(path = %path, method = %req.method(), "metrics request");

        if req.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n".to_string());
        }

        match path {
            p if p == self.path => match self.collector.encode() {
                Ok(body) => {
                    let mut response = text(StatusCode::OK, body);
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
                    response
                }
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics\n".to_string(),
                    )
                }
            },
            "/health" | "/healthz" => text(StatusCode::OK, "OK\n".to_string()),
            "/status" => text(StatusCode::OK, render_status(&self.upstreams)),
            "/" => text(
                StatusCode::OK,
                format!(
                    "tcplb metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /status - Peer status\n  /health - Health check\n",
                    self.path
                ),
            ),
            _ => text(StatusCode::NOT_FOUND, "Not found\n".to_string()),
        }
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// One line per peer, grouped by upstream in name order.
fn render_status(upstreams: &UpstreamManager) -> String {
    let table = upstreams.table();
    let mut out = String::new();

    for pool in table.pools() {
        let _ = writeln!(out, "upstream {}", pool.name());
        for peer in pool.snapshot() {
            let checked = peer
                .last_check
                .map(|at| format!("{}s ago", at.elapsed().as_secs()))
                .unwrap_or_else(|| "never".to_string());
            let _ = write!(
                out,
                "  {:<24} {:<10} weight={} active={} rise={} fall={} checked={}",
                peer.address,
                peer.status,
                peer.weight,
                peer.active_connections,
                peer.consecutive_successes,
                peer.consecutive_failures,
                checked,
            );
            if let Some(error) = &peer.last_error {
                let _ = write!(out, " error=\"{error}\"");
            }
            out.push('\n');
        }
    }

    out
}
