// src/boundary/backend.rs
//! Execution backend contract
//!
//! An execution backend hosts one agent's code behind an isolation boundary
//! and exposes its entry points by name. Two interchangeable strategies
//! implement the contract: a direct in-process backend (no isolation, no
//! marshalling cost) and an isolated out-of-process backend (fault and
//! security isolation, copied arguments). Nothing outside this module may
//! depend on which strategy is active.
//!
//! Values cross the boundary by deep copy. Where a value must be threaded
//! through successive calls without copying (an aggregation accumulator),
//! the backend returns an opaque [`ValueHandle`]; the host holds only the
//! token, never the value. A handle passed as a call argument is consumed
//! by that call.

use crate::utils::errors::{EngineError, EntryKind, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Which backend strategy is hosting the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process, no isolation
    Direct,

    /// Out-of-process, marshalled
    Isolated,
}

/// Host-capability visibility for a running entry point.
///
/// Views see only the read-side capabilities; actions and automations see
/// the full gateway; aggregation stages are pure folds with no host access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityScope {
    Action,
    View,
    Fold,
}

impl CapabilityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityScope::Action => "action",
            CapabilityScope::View => "view",
            CapabilityScope::Fold => "fold",
        }
    }
}

/// The three functions of a named aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStage {
    Initialize,
    Reducer,
    Serialize,
}

impl AggregationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStage::Initialize => "initialize",
            AggregationStage::Reducer => "reducer",
            AggregationStage::Serialize => "serialize",
        }
    }
}

/// A named entry point inside the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPoint {
    Action { name: String },
    View { name: String },
    Automation { name: String },
    Aggregation { name: String, stage: AggregationStage },
}

impl EntryPoint {
    pub fn action(name: impl Into<String>) -> Self {
        EntryPoint::Action { name: name.into() }
    }

    pub fn view(name: impl Into<String>) -> Self {
        EntryPoint::View { name: name.into() }
    }

    pub fn automation(name: impl Into<String>) -> Self {
        EntryPoint::Automation { name: name.into() }
    }

    pub fn aggregation(name: impl Into<String>, stage: AggregationStage) -> Self {
        EntryPoint::Aggregation {
            name: name.into(),
            stage,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EntryPoint::Action { name }
            | EntryPoint::View { name }
            | EntryPoint::Automation { name }
            | EntryPoint::Aggregation { name, .. } => name,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPoint::Action { .. } => EntryKind::Action,
            EntryPoint::View { .. } => EntryKind::View,
            EntryPoint::Automation { .. } => EntryKind::Automation,
            EntryPoint::Aggregation { .. } => EntryKind::Aggregation,
        }
    }

    /// The capability scope this entry point runs under.
    pub fn scope(&self) -> CapabilityScope {
        match self {
            EntryPoint::Action { .. } | EntryPoint::Automation { .. } => CapabilityScope::Action,
            EntryPoint::View { .. } => CapabilityScope::View,
            EntryPoint::Aggregation { .. } => CapabilityScope::Fold,
        }
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPoint::Aggregation { name, stage } => {
                write!(f, "aggregation {} ({})", name, stage.as_str())
            }
            other => write!(f, "{} {}", other.kind(), other.name()),
        }
    }
}

/// Token for a value retained inside the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueHandle(pub u64);

/// An argument crossing into the boundary: either a deep-copied value or a
/// handle to a value already resident there (consumed by the call).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryArg {
    Value(serde_json::Value),
    Handle(ValueHandle),
}

/// What condition runs an automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Event type that fires this automation
    pub run_on: String,
}

impl Trigger {
    pub fn event(run_on: impl Into<String>) -> Self {
        Self { run_on: run_on.into() }
    }
}

/// The loaded agent's entry-point inventory. Immutable after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    pub description: String,
    pub actions: BTreeSet<String>,
    pub views: BTreeSet<String>,
    pub automations: BTreeMap<String, Trigger>,
    pub aggregations: BTreeSet<String>,
}

impl AgentManifest {
    /// Check that an entry point of the given kind is registered.
    pub fn resolve(&self, kind: EntryKind, name: &str) -> Result<()> {
        let known = match kind {
            EntryKind::Action => self.actions.contains(name),
            EntryKind::View => self.views.contains(name),
            EntryKind::Automation => self.automations.contains_key(name),
            EntryKind::Aggregation => self.aggregations.contains(name),
        };
        if known {
            Ok(())
        } else {
            Err(EngineError::UnknownEntryPoint {
                kind,
                name: name.to_string(),
            })
        }
    }
}

/// A host function reachable from inside the boundary under a stable name.
///
/// The scope argument is the scope of the entry point the call originates
/// from; implementations reject calls from scopes they are not exposed to.
pub type HostFn = Arc<
    dyn Fn(CapabilityScope, Vec<serde_json::Value>) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// The execution-boundary contract.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Which strategy is active. Used only to decide which capabilities are
    /// installable (the `notify` side channel is direct-only).
    fn kind(&self) -> BackendKind;

    /// Read the agent's entry-point inventory.
    async fn describe(&self) -> Result<AgentManifest>;

    /// Invoke an entry point; the result is deep-copied out.
    async fn invoke(&self, entry: &EntryPoint, args: Vec<BoundaryArg>)
        -> Result<serde_json::Value>;

    /// Invoke an entry point; the result stays boundary-resident and is
    /// returned as an opaque handle.
    async fn invoke_retained(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
    ) -> Result<ValueHandle>;

    /// Install a host function, reachable from inside the boundary.
    async fn inject(&self, name: &str, host_fn: HostFn) -> Result<()>;

    /// Drop a retained value without invoking anything.
    async fn release(&self, handle: ValueHandle) -> Result<()>;

    /// Release all boundary resources. Idempotent; after the first call
    /// every other operation fails with [`EngineError::Disposed`].
    async fn dispose(&self) -> Result<()>;
}
