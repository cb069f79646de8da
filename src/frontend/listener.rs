//! Frontend listener implementation.
//!
//! Accepts incoming connections and hands each one to a proxy session task.

use crate::config::FrontendConfig;
use crate::proxy::{TcpProxy, TcpProxyError};
use crate::state::AppState;
use crate::util::ConnectionId;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    listener: TcpListener,
    proxy: TcpProxy,
}

impl FrontendListener {
    /// Bind the frontend's listen address.
    pub async fn bind(config: &FrontendConfig, state: AppState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(
            name = %config.name,
            listen = %config.listen,
            upstream = %config.upstream,
            rules = config.access.rules.len(),
            "frontend listener bound"
        );

        Ok(Self {
            listener,
            proxy: TcpProxy::new(config.name.clone(), state),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all, fields(frontend = %self.proxy.frontend()))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let proxy = self.proxy.clone();
        let id = ConnectionId::next();

        tokio::spawn(async move {
            // The client stream is dropped, and so closed, on every error path.
            match proxy.handle(stream, client_addr, id.clone()).await {
                Ok(_) => debug!(client = %client_addr, conn = %id, "connection completed"),
                Err(TcpProxyError::AccessDenied(e)) => info!(
                    frontend = proxy.frontend(),
                    conn = %id,
                    error = %e,
                    "connection rejected"
                ),
                Err(e) => warn!(
                    frontend = proxy.frontend(),
                    client = %client_addr,
                    conn = %id,
                    error = %e,
                    "connection handling failed"
                ),
            }
        });
    }
}
