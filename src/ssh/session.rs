//! A single authenticated SSH session to one server.

use std::time::{Duration, Instant};

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::Config as SshClientConfig;
use log::{debug, trace};

use crate::error::PoolError;
use crate::models::{AuthKind, ServerId};

use super::security::ConnectionSecurityOptions;

/// Raw stdout/stderr/exit-status/elapsed result of one command execution,
/// before parsing.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
    pub elapsed: Duration,
}

/// One authenticated channel to a [`ServerId`]. Owned exclusively by the
/// Pool; never shared across leases at the same time (invariant (a)).
pub struct SshSession {
    server_id: ServerId,
    client: Client,
    last_used: Instant,
}

impl SshSession {
    /// Opens a new session: TCP connect (bounded by `connect_timeout`), SSH
    /// handshake, and authentication. Strict host-key policy is whatever
    /// `security` carries — the caller (the Pool) is responsible for
    /// refusing to even attempt this when the known-hosts store is empty
    /// and TOFU isn't enabled.
    pub async fn open(
        server_id: ServerId,
        host: &str,
        port: u16,
        username: &str,
        auth_kind: AuthKind,
        secret: &str,
        security: &ConnectionSecurityOptions,
        connect_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let auth = match auth_kind {
            AuthKind::Password => AuthMethod::with_password(secret),
            AuthKind::Key => AuthMethod::with_key_file(secret, None),
        };

        let config = SshClientConfig {
            preferred: security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let connect_fut = Client::connect_with_config(
            (host, port),
            username,
            auth,
            security.server_check.clone(),
            config,
        );

        let client = tokio::time::timeout(connect_timeout, connect_fut)
            .await
            .map_err(|_| PoolError::ConnectFailed(format!("{host}:{port} connect timed out")))?
            .map_err(|e| classify_connect_error(&server_id, e))?;

        debug!("opened ssh session to {server_id} ({host}:{port})");

        Ok(Self {
            server_id,
            client,
            last_used: Instant::now(),
        })
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    /// Age since the session was last used for a command, used by the Pool
    /// to decide whether a cheap health check is needed before reuse.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Runs one non-interactive command to completion or timeout.
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<RawOutput, PoolError> {
        let start = Instant::now();
        trace!("{} exec: {command}", self.server_id);

        let result = tokio::time::timeout(timeout, self.client.execute(command))
            .await
            .map_err(|_| PoolError::SessionLost(format!("command timed out: {command}")))?
            .map_err(|e| PoolError::SessionLost(e.to_string()))?;

        self.last_used = Instant::now();

        Ok(RawOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit: result.exit_status as i32,
            elapsed: start.elapsed(),
        })
    }

    /// A cheap no-op used to validate a cached idle session before handing
    /// it out again (spec: "health-checked before reuse").
    pub async fn health_check(&mut self) -> bool {
        self.exec("true", Duration::from_secs(3)).await.is_ok()
    }

    pub async fn close(mut self) {
        let _ = self.client.disconnect().await;
    }
}

fn classify_connect_error(server_id: &ServerId, err: async_ssh2_tokio::Error) -> PoolError {
    let message = err.to_string();
    let lowercased = message.to_lowercase();
    if lowercased.contains("key") && (lowercased.contains("mismatch") || lowercased.contains("host")) {
        PoolError::HostKeyMismatch(server_id.to_string())
    } else if lowercased.contains("auth") {
        PoolError::AuthFailed(message)
    } else {
        PoolError::ConnectFailed(message)
    }
}
