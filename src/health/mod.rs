//! Active health checking for upstream peers.

mod checker;
mod protocol;

pub use checker::HealthChecker;
pub use protocol::{
    from_config, probe, CheckProtocol, HttpStatus, LineMatch, ProbeError, TcpConnect,
};
