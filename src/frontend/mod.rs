//! Client-facing side: listeners and the access rules applied to them.

mod acl;
mod listener;

pub use acl::{AccessDenied, AccessList, AccessRule, Action, Network, NetworkParseError};
pub use listener::FrontendListener;
