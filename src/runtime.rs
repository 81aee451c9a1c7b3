//! Top-level wiring: constructs every component from a [`Config`] and a
//! server list, and owns the ordered startup/shutdown sequence.
//!
//! Replaces the teacher's `pub static MANAGER: Lazy<SshConnectionManager>`
//! singleton with explicit dependency injection — every component is built
//! once in [`Runtime::start`] and handed to the pieces that need it, rather
//! than reached for through a global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::collector::{worker_pool_size, CommandTimeouts, Scheduler, SchedulerHandle};
use crate::config::Config;
use crate::error::PoolError;
use crate::models::{MetricKind, MetricsSample, Server, ServerId};
use crate::push::{PushFabric, PushFabricConfig};
use crate::ssh::known_hosts::KnownHosts;
use crate::ssh::pool::ServerConnectInfo;
use crate::ssh::SshPool;
use crate::store::sink::{LoggingSink, MetricsSink};
use crate::store::Store;
use crate::threshold::ThresholdEvaluator;
use crate::vault::Vault;

/// Everything the running process owns, assembled once at startup.
pub struct Runtime {
    pub pool: Arc<SshPool>,
    pub store: Arc<Store>,
    pub evaluator: Arc<ThresholdEvaluator>,
    pub push: Arc<PushFabric>,
    scheduler: Scheduler,
    server_handles: HashMap<ServerId, SchedulerHandle>,
    servers: HashMap<ServerId, Server>,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Builds every long-lived component and starts the background tasks
    /// (sink flusher, push fan-out, heartbeat) without yet scheduling any
    /// server for collection — call [`Self::add_server`] for each one.
    pub fn start(config: &Config, servers: &[Server], sink: Option<Arc<dyn MetricsSink>>) -> Self {
        let shutdown = CancellationToken::new();

        let vault = Arc::new(Vault::new(config.master_key));
        let known_hosts = KnownHosts::load(&config.known_hosts_path);
        let pool = Arc::new(SshPool::new(
            vault.clone(),
            known_hosts,
            config.allow_tofu,
            config.ssh_max_per_server,
            config.ssh_idle_ttl(),
        ));

        let sink = sink.unwrap_or_else(|| Arc::new(LoggingSink));
        let store = Arc::new(Store::new(
            config.sample_ring_capacity,
            sink,
            config.sink_batch_size,
            config.sink_batch_flush(),
            shutdown.child_token(),
        ));

        let evaluator = Arc::new(ThresholdEvaluator::new(config.threshold_defaults.clone()));

        let (sample_tx, _) = broadcast::channel(1024);
        let (event_tx, _) = broadcast::channel(1024);

        let command_workers = Arc::new(Semaphore::new(worker_pool_size(servers.len())));
        let scheduler = Scheduler::new(
            pool.clone(),
            store.clone(),
            evaluator.clone(),
            sample_tx.clone(),
            event_tx.clone(),
            config.collection_period(),
            config.ssh_connect_timeout(),
            CommandTimeouts::from_config(config),
            command_workers,
        );

        let push = PushFabric::new(
            PushFabricConfig {
                max_connections: config.ws_max_connections,
                max_per_ip: config.ws_max_per_ip,
                send_queue_depth: config.ws_send_queue,
                max_message_bytes: config.ws_max_message_bytes,
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout_misses: config.heartbeat_timeout_misses,
            },
            store.clone(),
        );
        push.clone().spawn_sample_forwarder(sample_tx.subscribe(), shutdown.child_token());
        push.clone().spawn_event_forwarder(event_tx.subscribe(), shutdown.child_token());
        push.clone().spawn_heartbeat_task(shutdown.child_token());

        let mut runtime = Self {
            pool,
            store,
            evaluator,
            push,
            scheduler,
            server_handles: HashMap::new(),
            servers: HashMap::new(),
            shutdown,
        };

        for server in servers {
            runtime.servers.insert(server.id.clone(), server.clone());
            if server.monitoring_enabled && !server.deleted {
                runtime.add_server(server);
            }
        }

        runtime
    }

    /// Begins collection for one server. Idempotent: re-adding an
    /// already-scheduled server restarts its loop with fresh state.
    pub fn add_server(&mut self, server: &Server) {
        if let Some(existing) = self.server_handles.remove(&server.id) {
            existing.shutdown();
        }
        let info = ServerConnectInfo {
            server_id: server.id.clone(),
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            auth_kind: server.auth_kind,
            secret: server.secret.clone(),
        };
        let handle = self.scheduler.spawn_server(info, &self.shutdown);
        self.server_handles.insert(server.id.clone(), handle);
        info!("scheduled collection for {}", server.id);
    }

    /// Stops collection for one server without tearing down the rest of the
    /// runtime; its SSH sessions are closed with `grace` to finish any
    /// in-flight command.
    pub async fn remove_server(&mut self, server_id: &ServerId, grace: std::time::Duration) {
        if let Some(handle) = self.server_handles.remove(server_id) {
            handle.shutdown();
            handle.join().await;
        }
        self.pool.close_server(server_id, grace).await;
        self.evaluator.forget_server(server_id);
    }

    /// Registers a new server and, if monitoring is enabled, starts its
    /// collection loop. The in-process counterpart of the REST adapter's
    /// create-server call (spec §6).
    pub fn create_server(&mut self, server: Server) {
        let enabled = server.monitoring_enabled && !server.deleted;
        self.servers.insert(server.id.clone(), server.clone());
        if enabled {
            self.add_server(&server);
        }
    }

    /// Replaces a registered server's record, rescheduling or stopping
    /// collection to match its new `monitoring_enabled`/`deleted` flags.
    pub async fn update_server(&mut self, server: Server) {
        let should_run = server.monitoring_enabled && !server.deleted;
        self.servers.insert(server.id.clone(), server.clone());
        if should_run {
            self.add_server(&server);
        } else {
            self.remove_server(&server.id, Duration::from_secs(5)).await;
        }
    }

    /// Soft-deletes a server: stops collection but leaves its historical
    /// samples queryable, matching [`Server::deleted`]'s documented meaning.
    pub async fn delete_server(&mut self, server_id: &ServerId, grace: Duration) {
        self.remove_server(server_id, grace).await;
        if let Some(server) = self.servers.get_mut(server_id) {
            server.deleted = true;
        }
    }

    /// Lists every registered server, including soft-deleted ones (the
    /// adapter decides whether to filter those out of its response).
    pub fn list_servers(&self) -> Vec<Server> {
        self.servers.values().cloned().collect()
    }

    /// Opens a short-lived session against `server_id` and runs a health
    /// check over it, without disturbing the pool's cached idle sessions.
    /// Used by the adapter's "test connection" action before a server is
    /// saved or re-enabled.
    pub async fn test_connection(&self, server_id: &ServerId) -> Result<(), PoolError> {
        let server = self
            .servers
            .get(server_id)
            .ok_or_else(|| PoolError::ConnectFailed(format!("unknown server {server_id}")))?;
        let info = ServerConnectInfo {
            server_id: server.id.clone(),
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            auth_kind: server.auth_kind,
            secret: server.secret.clone(),
        };
        let mut lease = self.pool.acquire(&info, Duration::from_secs(10)).await?;
        let healthy = lease.session_mut().health_check().await;
        self.pool.release(lease).await;
        if healthy {
            Ok(())
        } else {
            Err(PoolError::SessionLost(server_id.to_string()))
        }
    }

    /// Returns the most recent sample recorded for a server, or `None` if
    /// nothing has been collected yet.
    pub fn get_latest_sample(&self, server_id: &ServerId) -> Option<MetricsSample> {
        self.store.query_latest(server_id)
    }

    /// Returns samples in `[from_ms, to_ms]` that carry data for `metric`,
    /// oldest first. The adapter projects the requested series out of each
    /// returned [`MetricsSample`].
    pub fn get_sample_history(&self, server_id: &ServerId, metric: MetricKind, from_ms: i64, to_ms: i64) -> Vec<MetricsSample> {
        self.store
            .query_range(server_id, from_ms, to_ms)
            .into_iter()
            .filter(|s| !s.metric_missing(metric))
            .collect()
    }

    /// Orderly shutdown: stop scheduling new collection cycles, let the
    /// Push Fabric finish flushing, close SSH sessions, then drain the
    /// durable-sink queue.
    pub async fn shutdown(self) {
        info!("runtime shutdown initiated");
        self.shutdown.cancel();
        for (_, handle) in self.server_handles {
            handle.join().await;
        }
        self.push.shutdown().await;
        self.pool.close().await;
        info!("runtime shutdown complete");
    }
}
