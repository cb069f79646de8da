//! Connection IDs for log correlation.
//!
//! Every accepted client connection gets an ID that is attached to its
//! tracing span, so the accept, selection and close lines can be tied
//! together. IDs are only unique within one process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of one client connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Next ID from the process-wide counter.
    ///
    /// Format: `conn-{counter}` with the counter zero-padded to 16 hex digits.
    pub fn next() -> Self {
        let count = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{count:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
