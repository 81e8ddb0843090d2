// src/boundary/mod.rs
//! Execution boundary
//!
//! This module hosts untrusted agent code and mediates every value that
//! crosses into or out of it:
//!
//! - **Backend**: the `ExecutionBackend` contract (describe/invoke/inject/
//!   release/dispose) both strategies implement
//! - **Direct**: in-process backend for natively-defined agents
//! - **Isolated**: out-of-process backend speaking a JSON wire protocol
//! - **Protocol**: the frame types shared by host and boundary
//!
//! # Architecture
//!
//! ```text
//! Agent / Aggregator / Gateway
//!        │ invoke(entry, args)            inject(name, host_fn)
//!        ▼                                        │
//! ┌─────────────────── ExecutionBackend ──────────┼──────────┐
//! │  DirectBackend            IsolatedBackend     ▼          │
//! │  native handlers          child process ⇄ host_call      │
//! │  (no marshalling)         (json frames over stdio)       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Selection happens once, at agent load time; no caller may branch on the
//! active strategy.

pub mod backend;
pub mod direct;
pub mod isolated;
pub mod protocol;

// Re-export commonly used types
pub use backend::{
    AgentManifest, AggregationStage, BackendKind, BoundaryArg, CapabilityScope, EntryPoint,
    ExecutionBackend, HostFn, Trigger, ValueHandle,
};
pub use direct::{AgentContext, AgentDefinition, AgentDefinitionBuilder, AggregationDef, DirectBackend};
pub use isolated::{IsolatedBackend, IsolatedConfig};
pub use protocol::Frame;
