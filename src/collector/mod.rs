//! Command Executor and Parser Suite: the closed registry of collection
//! commands and the pure functions that turn their output into typed
//! records, plus the per-server periodic Scheduler that drives them.

mod executor;
mod parsers;
mod registry;
mod scheduler;

pub use executor::{worker_pool_size, Executor};
pub use parsers::PrevSampleState;
pub use registry::{CommandKey, CommandSpec, CommandTimeouts, REGISTRY};
pub use scheduler::{Scheduler, SchedulerHandle};
