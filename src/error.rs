//! Error taxonomy for the collection-and-distribution core.
//!
//! Each component owns a tagged error enum; [`CoreError`] aggregates them at
//! the runtime boundary. Library code returns the component-specific type
//! wherever possible so callers can match on the taxonomy instead of strings.

use thiserror::Error;

use crate::vault::VaultError;

/// Errors raised while acquiring, using, or tearing down SSH sessions.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool exhausted for server {0}")]
    PoolExhausted(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("ssh handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key does not match known_hosts entry for {0}")]
    HostKeyMismatch(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("no usable credential for server {0}")]
    CredentialError(String, #[source] VaultError),

    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}

/// Errors raised while executing a registered command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("command exited with status {exit}: {stderr_excerpt}")]
    CommandFailed { exit: i32, stderr_excerpt: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Non-fatal parser warning, attached to a [`crate::models::MetricRecord`]
/// rather than propagated as an error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParseWarning {
    pub field: String,
    pub message: String,
}

impl ParseWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the Sample Store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sample timestamp {0} is out of order for this server/metric")]
    OutOfOrder(i64),

    #[error("durable sink write failed, retryable: {0}")]
    SinkRetryable(String),

    #[error("durable sink write failed, fatal: {0}")]
    SinkFatal(String),

    #[error("no data recorded for server {0}")]
    NoData(String),
}

/// Errors raised by the Push Fabric; all of these close the offending
/// connection without affecting any other connection.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("send queue overflow, frame dropped")]
    QueueOverflow,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("slow consumer, too many dropped frames")]
    SlowConsumer,

    #[error("message exceeds maximum size")]
    Oversize,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("connection limit reached: {0}")]
    ConnectionLimitReached(String),
}

/// Top-level error aggregate, used only at the runtime/binary boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error("configuration invalid: {0}")]
    InvalidConfig(String),
}
