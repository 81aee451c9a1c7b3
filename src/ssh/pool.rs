//! Bounded per-server pool of SSH sessions.
//!
//! Grounded on the teacher's `SshConnectionManager`: a cache keyed by server
//! identity holds per-server state, lazily created on first use. Where the
//! teacher caches exactly one client per address, CWatcher guards a small
//! pool of up to `max_per_server` clients behind a semaphore, because the
//! collector needs several commands running concurrently against one host.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use moka::future::Cache;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::error::PoolError;
use crate::models::{AuthKind, ServerId};
use crate::vault::Vault;

use super::known_hosts::KnownHosts;
use super::security::ConnectionSecurityOptions;
use super::session::SshSession;

/// Everything the Pool needs to know about a server to open a session,
/// supplied by the caller on each `Acquire` rather than cached, so a
/// credential rotation takes effect on the very next acquire.
#[derive(Debug, Clone)]
pub struct ServerConnectInfo {
    pub server_id: ServerId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub secret: crate::vault::EncryptedSecret,
}

/// A reason a session was invalidated, used only for logging/backoff
/// bookkeeping — it never reaches a log line with secret material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateReason {
    Io,
    Timeout,
    AuthFailed,
    ConnectFailed,
    HostKeyMismatch,
}

struct BackoffState {
    failures: VecDeque<Instant>,
    next_attempt_at: Option<Instant>,
    attempt: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            next_attempt_at: None,
            attempt: 0,
        }
    }

    fn record_failure(&mut self) {
        let now = Instant::now();
        self.failures.push_back(now);
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.attempt += 1;
        let secs = [2u64, 4, 8].get(self.attempt as usize - 1).copied().unwrap_or(60);
        self.next_attempt_at = Some(now + Duration::from_secs(secs));
    }

    fn record_success(&mut self) {
        self.failures.clear();
        self.next_attempt_at = None;
        self.attempt = 0;
    }

    /// `>= 3` failures within 60s escalates from "transient" to "offline".
    fn should_escalate_offline(&self) -> bool {
        self.failures.len() >= 3
    }

    fn blocked_until(&self) -> Option<Instant> {
        self.next_attempt_at.filter(|t| *t > Instant::now())
    }
}

struct ServerPoolState {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<SshSession>>,
    backoff: Mutex<BackoffState>,
    closing: std::sync::atomic::AtomicBool,
}

impl ServerPoolState {
    fn new(max_per_server: u8) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_per_server as usize)),
            idle: Mutex::new(VecDeque::new()),
            backoff: Mutex::new(BackoffState::new()),
            closing: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// A checked-out session, good for exactly one command before it must be
/// returned via [`SshPool::release`] or [`SshPool::invalidate`].
pub struct Lease {
    server_id: ServerId,
    session: SshSession,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn session_mut(&mut self) -> &mut SshSession {
        &mut self.session
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }
}

/// Pool of bounded, reusable authenticated sessions, one semaphore-guarded
/// idle set per server.
pub struct SshPool {
    states: Cache<ServerId, Arc<ServerPoolState>>,
    vault: Arc<Vault>,
    known_hosts: KnownHosts,
    allow_tofu: bool,
    max_per_server: u8,
    idle_ttl: Duration,
}

impl SshPool {
    pub fn new(vault: Arc<Vault>, known_hosts: KnownHosts, allow_tofu: bool, max_per_server: u8, idle_ttl: Duration) -> Self {
        assert!((1..=8).contains(&max_per_server), "ssh_max_per_server must be 1..=8");
        Self {
            states: Cache::builder().max_capacity(10_000).build(),
            vault,
            known_hosts,
            allow_tofu,
            max_per_server,
            idle_ttl,
        }
    }

    async fn state_for(&self, server_id: &ServerId) -> Arc<ServerPoolState> {
        let max_per_server = self.max_per_server;
        self.states
            .get_with(server_id.clone(), async move { Arc::new(ServerPoolState::new(max_per_server)) })
            .await
    }

    /// Checks out a session for `info.server_id`, opening a new one if the
    /// idle set is empty and the semaphore allows it. Blocks up to
    /// `timeout`.
    pub async fn acquire(&self, info: &ServerConnectInfo, timeout: Duration) -> Result<Lease, PoolError> {
        let state = self.state_for(&info.server_id).await;

        if state.closing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PoolError::ConnectFailed(format!("{} is closing", info.server_id)));
        }

        if let Some(until) = state.backoff.lock().await.blocked_until() {
            return Err(PoolError::ConnectFailed(format!(
                "{} is backing off for {:?}",
                info.server_id,
                until.saturating_duration_since(Instant::now())
            )));
        }

        let permit = tokio::time::timeout(timeout, state.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::PoolExhausted(info.server_id.to_string()))?
            .expect("semaphore never closed while pool is alive");

        let session = match self.take_healthy_idle(&state).await {
            Some(session) => session,
            None => self.open_new_session(info, &state).await?,
        };

        Ok(Lease {
            server_id: info.server_id.clone(),
            session,
            _permit: permit,
        })
    }

    async fn take_healthy_idle(&self, state: &ServerPoolState) -> Option<SshSession> {
        loop {
            let mut idle = state.idle.lock().await;
            let mut session = idle.pop_front()?;
            drop(idle);

            if !session.is_connected() {
                continue;
            }
            if session.idle_for() >= self.idle_ttl {
                session.close().await;
                continue;
            }
            if session.idle_for() < Duration::from_secs(30) || session.health_check().await {
                return Some(session);
            }
            session.close().await;
        }
    }

    async fn open_new_session(&self, info: &ServerConnectInfo, state: &ServerPoolState) -> Result<SshSession, PoolError> {
        if !self.allow_tofu && self.known_hosts.is_empty() {
            let mut backoff = state.backoff.lock().await;
            backoff.record_failure();
            return Err(PoolError::HostKeyMismatch(info.server_id.to_string()));
        }
        if !self.allow_tofu && !self.known_hosts.has_entry_for(&info.host, info.port) {
            let mut backoff = state.backoff.lock().await;
            backoff.record_failure();
            return Err(PoolError::HostKeyMismatch(info.server_id.to_string()));
        }

        let security = if self.allow_tofu {
            ConnectionSecurityOptions::tofu()
        } else {
            ConnectionSecurityOptions::strict(self.known_hosts.path().to_path_buf())
        };

        let secret = self
            .vault
            .decrypt(&info.secret)
            .map_err(|e| PoolError::CredentialError(info.server_id.to_string(), e))?;

        let result = SshSession::open(
            info.server_id.clone(),
            &info.host,
            info.port,
            &info.username,
            info.auth_kind,
            secret.as_str(),
            &security,
            Duration::from_secs(10),
        )
        .await;

        let mut backoff = state.backoff.lock().await;
        match result {
            Ok(session) => {
                backoff.record_success();
                Ok(session)
            }
            Err(err) => {
                backoff.record_failure();
                if backoff.should_escalate_offline() {
                    warn!("{} exceeded failure threshold, treating as offline", info.server_id);
                }
                Err(err)
            }
        }
    }

    /// Returns a session to the idle set.
    pub async fn release(&self, lease: Lease) {
        let state = self.state_for(&lease.server_id).await;
        if lease.session.is_connected() {
            state.idle.lock().await.push_back(lease.session);
        } else {
            lease.session.close().await;
        }
    }

    /// Marks a session unusable; it will not be returned to the idle set.
    /// A future `acquire` for this server will open a fresh session.
    pub async fn invalidate(&self, lease: Lease, reason: InvalidateReason) {
        debug!("invalidating session for {}: {:?}", lease.server_id, reason);
        let state = self.state_for(&lease.server_id).await;
        let mut backoff = state.backoff.lock().await;
        backoff.record_failure();
        drop(backoff);
        lease.session.close().await;
    }

    /// Drains and closes all sessions for `server_id`. In-flight leases are
    /// given `grace` to complete before being dropped regardless.
    pub async fn close_server(&self, server_id: &ServerId, grace: Duration) {
        let state = self.state_for(server_id).await;
        state.closing.store(true, std::sync::atomic::Ordering::SeqCst);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if state.semaphore.available_permits() == self.max_per_server as usize {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut idle = state.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            session.close().await;
        }
        self.states.invalidate(server_id).await;
    }

    /// Global teardown; idempotent.
    pub async fn close(&self) {
        for (server_id, state) in self.states.iter() {
            state.closing.store(true, std::sync::atomic::Ordering::SeqCst);
            let mut idle = state.idle.lock().await;
            while let Some(session) = idle.pop_front() {
                session.close().await;
            }
            self.states.invalidate(&server_id).await;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_spec() {
        let mut backoff = BackoffState::new();
        backoff.record_failure();
        assert!(backoff.blocked_until().is_some());
        backoff.record_success();
        assert!(backoff.blocked_until().is_none());
    }

    #[test]
    fn three_failures_within_window_escalates() {
        let mut backoff = BackoffState::new();
        backoff.record_failure();
        backoff.record_failure();
        assert!(!backoff.should_escalate_offline());
        backoff.record_failure();
        assert!(backoff.should_escalate_offline());
    }

    #[tokio::test]
    async fn acquire_refuses_when_known_hosts_store_is_empty() {
        let vault = Arc::new(Vault::new(Some([0u8; 32])));
        let known_hosts = KnownHosts::load("/nonexistent/known_hosts");
        let pool = SshPool::new(vault.clone(), known_hosts, false, 3, Duration::from_secs(300));

        let secret = vault.encrypt("hunter2").unwrap();
        let info = ServerConnectInfo {
            server_id: ServerId::from("srv-1"),
            host: "203.0.113.1".to_string(),
            port: 22,
            username: "root".to_string(),
            auth_kind: AuthKind::Password,
            secret,
        };

        match pool.acquire(&info, Duration::from_secs(1)).await {
            Err(PoolError::HostKeyMismatch(id)) => assert_eq!(id, "srv-1"),
            other => panic!("expected HostKeyMismatch, got {other:?}"),
        }
    }
}
