//! # cwatcher-core — fleet monitoring over SSH
//!
//! `cwatcher-core` collects CPU, memory, disk, and network metrics from a
//! fleet of Linux hosts over SSH, evaluates them against configurable
//! thresholds, and streams accepted samples to subscribed clients over a
//! WebSocket gateway.
//!
//! ## Main components
//!
//! - [`vault`] — encrypts server credentials at rest
//! - [`ssh`] — bounded per-server pool of authenticated SSH sessions
//! - [`collector`] — the closed command registry, parser suite, and
//!   per-server periodic Scheduler that drives collection
//! - [`store`] — the in-memory sample ring plus durable-sink flushing
//! - [`threshold`] — debounced band evaluation and derived server status
//! - [`push`] — the WebSocket gateway that streams samples to subscribers
//! - [`runtime`] — wires every component together and owns startup/shutdown
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cwatcher_core::config::Config;
//! use cwatcher_core::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let runtime = Runtime::start(&config, &[], None);
//!     // ... register servers, run the push fabric's axum router, etc.
//!     runtime.shutdown().await;
//! }
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod push;
pub mod runtime;
pub mod ssh;
pub mod store;
pub mod threshold;
pub mod vault;
