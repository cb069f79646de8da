//! Upstream pool management: peer registry, runtime state and selection.

mod peer;
mod pool;
mod registry;
mod selector;

pub use peer::{ActiveConnection, PeerRuntime, PeerSnapshot, PeerStatus, Transition};
pub use pool::{SelectError, Selection, UpstreamManager, UpstreamPool, UpstreamTable};
pub use registry::{PeerSpec, PoolConfig};
pub use selector::SmoothWeighted;
