// src/utils/errors.rs
//! Engine error types
//!
//! One crate-wide error enum covering the full failure taxonomy, from
//! recoverable agent-code errors up to fatal boundary failures.

use thiserror::Error;

/// Kind of agent entry point, used in lookup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Action,
    View,
    Automation,
    Aggregation,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Action => "action",
            EntryKind::View => "view",
            EntryKind::Automation => "automation",
            EntryKind::Aggregation => "aggregation",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unrecoverable execution-boundary failure. Terminates the owning
    /// agent instance; never swallowed.
    #[error("fatal boundary failure: {0}")]
    BoundaryFatal(String),

    /// An action/view/automation/aggregation name is not registered.
    #[error("unknown {kind}: {name}")]
    UnknownEntryPoint { kind: EntryKind, name: String },

    /// Views owned by other agents cannot be resolved yet.
    #[error("views from other agents are not yet supported")]
    CrossAgentUnsupported,

    /// Fetch target rejected by the agent's domain allowlist.
    #[error("illegal fetch: domain {host} not on allowed list")]
    DomainNotAllowed { host: String },

    /// An exception raised inside agent-supplied code, wrapped with the
    /// entry point that failed. Recoverable; never retried automatically.
    #[error("error in {entry}: {message}")]
    AgentCode { entry: String, message: String },

    /// A reducer fault aborted an aggregation run; no checkpoint was saved.
    #[error("aggregation {name} aborted: {message}")]
    AggregationAborted { name: String, message: String },

    /// A capability was called from an execution scope it is not exposed to.
    #[error("capability {name} not available in {scope} scope")]
    CapabilityUnavailable { name: String, scope: &'static str },

    /// A value could not be carried across the execution boundary.
    #[error("marshalling failed: {0}")]
    MarshallingFailed(String),

    /// A boundary call did not complete within the configured timeout.
    #[error("execution timed out")]
    ExecutionTimeout,

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("storage failure: {0}")]
    StorageFailed(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid cron schedule {schedule}: {message}")]
    InvalidSchedule { schedule: String, message: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The agent instance (or its backend) has been disposed.
    #[error("agent instance disposed")]
    Disposed,
}

impl EngineError {
    /// Wrap a failure from agent-supplied code with its entry point.
    pub fn agent_code(entry: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::AgentCode {
            entry: entry.into(),
            message: message.to_string(),
        }
    }

    /// True for errors that must terminate the agent instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::BoundaryFatal(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_entry_point_display() {
        let err = EngineError::UnknownEntryPoint {
            kind: EntryKind::View,
            name: "totals".to_string(),
        };
        assert_eq!(err.to_string(), "unknown view: totals");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::BoundaryFatal("oom".into()).is_fatal());
        assert!(!EngineError::Disposed.is_fatal());
        assert!(!EngineError::agent_code("action add", "boom").is_fatal());
    }

    #[test]
    fn test_domain_not_allowed_display() {
        let err = EngineError::DomainNotAllowed {
            host: "api.example.com".to_string(),
        };
        assert!(err.to_string().contains("api.example.com"));
        assert!(err.to_string().contains("not on allowed list"));
    }
}
