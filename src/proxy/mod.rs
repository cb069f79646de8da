//! Layer 4 proxying between clients and upstream peers.

mod tcp_proxy;

pub use tcp_proxy::{connect_to_peer, proxy_bidirectional, ProxyResult, TcpProxy, TcpProxyError};
