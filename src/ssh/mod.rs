//! SSH Pool: bounded, reusable authenticated sessions per target server.
//!
//! Generalizes the connection-caching discipline of a single-session-per-
//! address manager into an N-per-server semaphore-guarded pool, since the
//! collector needs several commands in flight against the same host at
//! once (spec §4.2).

pub mod known_hosts;
pub mod pool;
pub mod security;
pub mod session;

pub use known_hosts::KnownHosts;
pub use pool::{Lease, SshPool};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use session::SshSession;
