//! `cwatcherd` — the CWatcher fleet-monitoring daemon.
//!
//! Reads a JSON config file and a JSON server list, starts the runtime, and
//! serves the Push Fabric's WebSocket endpoint until interrupted.
//!
//! Exit codes (spec §6):
//!   0 — normal shutdown (SIGINT/SIGTERM received, runtime drained)
//!   1 — configuration invalid
//!   2 — master key missing or unreadable
//!   3 — persistent storage unavailable at startup

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cwatcher_core::config::Config;
use cwatcher_core::models::Server;
use cwatcher_core::runtime::Runtime;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log::error!("cwatcherd exiting: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        1
    } else if err.downcast_ref::<MasterKeyError>().is_some() {
        2
    } else {
        3
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ConfigError(String);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MasterKeyError(String);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct StorageError(String);

async fn run() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "cwatcher.json".to_string());
    let servers_path = std::env::args().nth(2).unwrap_or_else(|| "servers.json".to_string());

    let config = load_config(&config_path).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;
    let servers = load_servers(&servers_path).map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;

    config.validate().map_err(|e| anyhow::Error::new(ConfigError(e)))?;

    if config.master_key.is_none() {
        return Err(anyhow::Error::new(MasterKeyError(
            "no master key configured (set CWATCHER_MASTER_KEY to a 64-character hex string)".to_string(),
        )));
    }

    let bind_addr: SocketAddr = std::env::var("CWATCHER_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("CWATCHER_BIND is not a valid socket address")
        .map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;

    log::info!("starting cwatcherd with {} registered server(s)", servers.len());

    let runtime = Runtime::start(&config, &servers, None);
    let router = runtime.push.clone().router();

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::Error::new(StorageError(format!("failed to bind {bind_addr}: {e}"))))?;

    log::info!("push fabric listening on {bind_addr}");

    let serve = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = serve => {
            result.map_err(|e| anyhow::Error::new(StorageError(e.to_string())))?;
        }
        _ = shutdown_signal() => {
            log::info!("shutdown signal received");
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let path = PathBuf::from(path);
    if !path.exists() {
        log::warn!("{} not found, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut config: Config = serde_json::from_str(&raw)?;
    if let Ok(hex_key) = std::env::var("CWATCHER_MASTER_KEY") {
        config.master_key = Some(parse_master_key(&hex_key)?);
    }
    Ok(config)
}

fn parse_master_key(hex_key: &str) -> Result<[u8; 32], Box<dyn std::error::Error>> {
    if hex_key.len() != 64 {
        return Err("CWATCHER_MASTER_KEY must be 64 hex characters (32 bytes)".into());
    }
    let mut key = [0u8; 32];
    for i in 0..32 {
        key[i] = u8::from_str_radix(&hex_key[i * 2..i * 2 + 2], 16)?;
    }
    Ok(key)
}

fn load_servers(path: &str) -> Result<Vec<Server>, Box<dyn std::error::Error>> {
    let path = PathBuf::from(path);
    if !path.exists() {
        log::warn!("{} not found, starting with no registered servers", path.display());
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}
