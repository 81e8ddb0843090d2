// src/lib.rs
//! Warden Agent Engine
//!
//! This library runs untrusted agent code inside a restricted execution
//! boundary and mediates every interaction that code has with the host.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **boundary**: execution backends (direct in-process, isolated
//!   out-of-process) behind one invoke/inject/dispose contract
//! - **gateway**: the capability surface injected into the boundary —
//!   events, domain-gated fetch, scheduling, resource ids
//! - **log**: the Universal Log contract plus memory and SQLite
//!   implementations (append-only events, continuations)
//! - **aggregation**: incremental, checkpointed folds over the log
//! - **scheduler**: deferred-job runner with bounded retry and cron re-arm
//! - **agent**: the composition root wiring one agent together
//! - **observability**: tracing setup
//! - **utils**: errors and configuration

// Public module exports
pub mod agent;
pub mod aggregation;
pub mod boundary;
pub mod gateway;
pub mod log;
pub mod observability;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use agent::{Agent, AgentSetup, AgentSource};
pub use boundary::{AgentDefinition, AgentManifest, ExecutionBackend, IsolatedConfig, Trigger};
pub use gateway::{CapabilityGateway, DomainPolicy, EventMeta};
pub use log::{MemoryLog, SqliteLog, UniversalLog};
pub use scheduler::{JobManager, LocalJobManager, SchedulerOptions, TaskRunner};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
