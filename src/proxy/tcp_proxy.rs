//! TCP proxy sessions.
//!
//! A session checks the client against the frontend's access rules, asks the
//! upstream pool for a peer, connects and copies bytes both ways until both
//! sides are done. Connect failures and errors on the peer side of the copy
//! are reported back to the pool as traffic failures; errors on the client
//! side are not the peer's fault and are only logged.

use crate::frontend::AccessDenied;
use crate::metrics::MetricsCollector;
use crate::state::AppState;
use crate::upstream::{SelectError, Selection};
use crate::util::ConnectionId;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Result of a proxy operation.
#[derive(Debug)]
pub struct ProxyResult {
    /// Bytes sent from client to peer.
    pub bytes_to_peer: u64,
    /// Bytes sent from peer to client.
    pub bytes_to_client: u64,
    /// First I/O error seen on the peer's side of the copy.
    pub peer_error: Option<io::Error>,
}

/// TCP proxy error.
#[derive(Debug, thiserror::Error)]
pub enum TcpProxyError {
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error(transparent)]
    NoPeer(#[from] SelectError),

    #[error("unknown frontend '{0}'")]
    UnknownFrontend(String),

    #[error("failed to connect to peer {0}: {1}")]
    PeerConnect(SocketAddr, io::Error),

    #[error("connection timeout to peer {0}")]
    PeerTimeout(SocketAddr),
}

/// Connect to a peer with timeout.
pub async fn connect_to_peer(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, TcpProxyError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %addr, error = %e, "failed to set TCP_NODELAY on peer connection");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(TcpProxyError::PeerConnect(addr, e)),
        Err(_) => Err(TcpProxyError::PeerTimeout(addr)),
    }
}

/// Which end of a copy failed.
#[derive(Debug)]
enum Side {
    Client,
    Peer,
}

/// Copy `reader` into `writer` until EOF, then half-close `writer`.
///
/// Errors are tagged with the side they came from.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    reader_side: Side,
    writer_side: Side,
) -> (u64, Option<(Side, io::Error)>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return (total, Some((reader_side, e))),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (total, Some((writer_side, e)));
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        return (total, Some((writer_side, e)));
    }
    (total, None)
}

/// Proxy data bidirectionally between two streams.
///
/// Each direction runs until its reader hits EOF or either side errors.
/// Client-side errors are logged; the first peer-side error is returned in
/// the result.
pub async fn proxy_bidirectional<C, P>(client: C, peer: P) -> ProxyResult
where
    C: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (peer_read, peer_write) = tokio::io::split(peer);

    let ((bytes_to_peer, upstream_err), (bytes_to_client, downstream_err)) = tokio::join!(
        pump(client_read, peer_write, Side::Client, Side::Peer),
        pump(peer_read, client_write, Side::Peer, Side::Client),
    );

    let mut peer_error = None;
    for (side, error) in [upstream_err, downstream_err].into_iter().flatten() {
        match side {
            Side::Peer => {
                peer_error.get_or_insert(error);
            }
            Side::Client => debug!(error = %error, "client side of session failed"),
        }
    }

    ProxyResult {
        bytes_to_peer,
        bytes_to_client,
        peer_error,
    }
}

/// Runs proxy sessions for one frontend.
#[derive(Clone)]
pub struct TcpProxy {
    frontend: String,
    state: AppState,
}

impl TcpProxy {
    pub fn new(frontend: impl Into<String>, state: AppState) -> Self {
        Self {
            frontend: frontend.into(),
            state,
        }
    }

    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    fn metrics(&self) -> &MetricsCollector {
        self.state.metrics()
    }

    /// Handle one accepted client connection to completion.
    ///
    /// Access rules and the upstream name are read from the configuration
    /// current at accept time.
    #[instrument(skip_all, fields(frontend = %self.frontend, client = %client_addr, conn = %id))]
    pub async fn handle(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
        id: ConnectionId,
    ) -> Result<ProxyResult, TcpProxyError> {
        let (upstream, connect_timeout) = {
            let config = self.state.config();
            let frontend = config
                .frontend(&self.frontend)
                .ok_or_else(|| TcpProxyError::UnknownFrontend(self.frontend.clone()))?;

            if let Err(denied) = frontend.access.check(client_addr.ip()) {
                self.metrics().record_access_denied(&self.frontend);
                return Err(denied.into());
            }

            (frontend.upstream.clone(), frontend.connect_timeout)
        };

        let selection = self.state.upstreams().select_peer(&upstream)?;
        let _active = selection.track_connection();

        self.metrics().connection_opened(&self.frontend, &upstream);
        let start = Instant::now();
        let result = self.run_session(client, &selection, connect_timeout).await;
        self.metrics().connection_closed(&self.frontend, &upstream);

        let proxy_result = result?;
        let duration = start.elapsed();
        self.metrics().record_tcp_session(
            &self.frontend,
            &upstream,
            proxy_result.bytes_to_peer,
            proxy_result.bytes_to_client,
            duration,
        );

        info!(
            upstream = %upstream,
            peer = %selection.address(),
            bytes_to_peer = proxy_result.bytes_to_peer,
            bytes_to_client = proxy_result.bytes_to_client,
            duration_ms = duration.as_millis(),
            "TCP proxy session completed"
        );

        Ok(proxy_result)
    }

    async fn run_session(
        &self,
        client: TcpStream,
        selection: &Selection,
        connect_timeout: Duration,
    ) -> Result<ProxyResult, TcpProxyError> {
        debug!(peer = %selection.address(), "connecting to peer");

        let peer = match connect_to_peer(selection.address(), connect_timeout).await {
            Ok(peer) => peer,
            Err(e) => {
                selection.report_failure(&e.to_string());
                return Err(e);
            }
        };

        let result = proxy_bidirectional(client, peer).await;
        match &result.peer_error {
            Some(e) => {
                warn!(peer = %selection.address(), error = %e, "peer connection failed mid-session");
                selection.report_failure(&e.to_string());
            }
            None => {
                selection.report_success();
            }
        }

        Ok(result)
    }
}
