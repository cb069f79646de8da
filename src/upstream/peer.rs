//! Per-peer runtime state and the rise/fall state machine.
//!
//! Health fields sit behind one mutex per peer, so a reader never sees a
//! status that disagrees with the counters next to it. The active connection
//! count is a plain atomic since nothing else depends on it.

use crate::upstream::PeerSpec;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// No probe has completed yet.
    Unknown,
    Healthy,
    /// Failing, but not yet `fall` times in a row.
    Falling,
    Unhealthy,
    /// Succeeding again, but not yet `rise` times in a row.
    Rising,
}

impl PeerStatus {
    pub const ALL: [PeerStatus; 5] = [
        PeerStatus::Unknown,
        PeerStatus::Healthy,
        PeerStatus::Falling,
        PeerStatus::Unhealthy,
        PeerStatus::Rising,
    ];

    /// Whether the selector may hand this peer out.
    pub fn is_usable(self) -> bool {
        matches!(self, PeerStatus::Healthy | PeerStatus::Falling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Unknown => "unknown",
            PeerStatus::Healthy => "healthy",
            PeerStatus::Falling => "falling",
            PeerStatus::Unhealthy => "unhealthy",
            PeerStatus::Rising => "rising",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status change caused by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PeerStatus,
    pub to: PeerStatus,
}

/// Mutable health fields, guarded together.
#[derive(Debug)]
struct PeerHealth {
    status: PeerStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_check: Option<Instant>,
    last_error: Option<String>,
}

impl PeerHealth {
    fn new() -> Self {
        Self {
            status: PeerStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
        }
    }

    /// Apply one observation and return the status change, if any.
    fn observe(&mut self, ok: bool, rise: u32, fall: u32) -> Option<Transition> {
        let from = self.status;

        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);

            self.status = match from {
                PeerStatus::Unknown | PeerStatus::Healthy | PeerStatus::Falling => {
                    PeerStatus::Healthy
                }
                PeerStatus::Unhealthy | PeerStatus::Rising => {
                    if self.consecutive_successes >= rise {
                        PeerStatus::Healthy
                    } else {
                        PeerStatus::Rising
                    }
                }
            };
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);

            self.status = match from {
                PeerStatus::Healthy | PeerStatus::Falling => {
                    if self.consecutive_failures >= fall {
                        PeerStatus::Unhealthy
                    } else {
                        PeerStatus::Falling
                    }
                }
                PeerStatus::Unknown | PeerStatus::Unhealthy | PeerStatus::Rising => {
                    PeerStatus::Unhealthy
                }
            };
        }

        (self.status != from).then_some(Transition {
            from,
            to: self.status,
        })
    }

    /// Apply a clean session seen on live traffic.
    ///
    /// Only clears a pending fall. A peer that is out of rotation comes back
    /// through probes alone.
    fn observe_traffic_success(&mut self) -> Option<Transition> {
        let from = self.status;
        match from {
            PeerStatus::Healthy | PeerStatus::Falling => {
                self.consecutive_failures = 0;
                self.status = PeerStatus::Healthy;
            }
            PeerStatus::Unknown | PeerStatus::Unhealthy | PeerStatus::Rising => {}
        }

        (self.status != from).then_some(Transition {
            from,
            to: self.status,
        })
    }
}

/// Point-in-time copy of a peer's state.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub weight: u32,
    pub status: PeerStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub active_connections: u32,
    pub last_check: Option<Instant>,
    pub last_error: Option<String>,
}

/// Runtime state of one configured peer.
#[derive(Debug)]
pub struct PeerRuntime {
    spec: PeerSpec,
    upstream: Arc<str>,
    health: Mutex<PeerHealth>,
    active_connections: AtomicU32,
}

impl PeerRuntime {
    /// Create runtime state for a peer. Every peer starts out `unknown`.
    pub fn new(upstream: Arc<str>, spec: PeerSpec) -> Self {
        Self {
            spec,
            upstream,
            health: Mutex::new(PeerHealth::new()),
            active_connections: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.spec.address
    }

    pub fn weight(&self) -> u32 {
        self.spec.weight
    }

    pub fn spec(&self) -> &PeerSpec {
        &self.spec
    }

    /// Name of the upstream pool this peer belongs to.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn status(&self) -> PeerStatus {
        self.health.lock().status
    }

    pub fn is_usable(&self) -> bool {
        self.status().is_usable()
    }

    /// Record the outcome of a health probe.
    pub fn record_probe(&self, error: Option<String>) -> Option<Transition> {
        let mut health = self.health.lock();
        health.last_check = Some(Instant::now());
        let ok = error.is_none();
        health.last_error = error;
        health.observe(ok, self.spec.rise, self.spec.fall)
    }

    /// Record a success seen on live traffic.
    ///
    /// Resets the failure count of a usable peer and nothing else; it never
    /// moves a peer from `unknown`, `unhealthy` or `rising`.
    pub fn record_success(&self) -> Option<Transition> {
        self.health.lock().observe_traffic_success()
    }

    /// Record a failure seen on live traffic. Counts exactly like a failed probe.
    pub fn record_failure(&self, reason: impl Into<String>) -> Option<Transition> {
        let mut health = self.health.lock();
        health.last_error = Some(reason.into());
        health.observe(false, self.spec.rise, self.spec.fall)
    }

    /// Count a connection as active until the returned guard is dropped.
    pub fn track_connection(self: &Arc<Self>) -> ActiveConnection {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            peer: Arc::clone(self),
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let health = self.health.lock();
        PeerSnapshot {
            address: self.spec.address,
            weight: self.spec.weight,
            status: health.status,
            consecutive_successes: health.consecutive_successes,
            consecutive_failures: health.consecutive_failures,
            active_connections: self.active_connections(),
            last_check: health.last_check,
            last_error: health.last_error.clone(),
        }
    }
}

/// Keeps a peer's active connection count raised while alive.
#[derive(Debug)]
pub struct ActiveConnection {
    peer: Arc<PeerRuntime>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.peer.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
