// src/boundary/protocol.rs
//! Wire protocol for the isolated backend
//!
//! One JSON frame per line, both directions. The host originates
//! `describe`/`invoke`/`release`/`dispose`; the boundary originates
//! `host_call`, tagged with the id of the invoke it is servicing so the
//! host can resolve the active capability scope for nested calls. Either
//! side answers a request with `result` or `error` carrying the same id.
//!
//! ```text
//! host → boundary   {"op":"invoke","id":4,"entry":{"kind":"action","name":"add"},
//!                    "args":[{"value":{"n":2}}],"retain":false}
//! boundary → host   {"op":"host_call","id":901,"invoke":4,
//!                    "name":"push_event","args":["expense",{"n":2},{}]}
//! host → boundary   {"op":"result","id":901,"value":null}
//! boundary → host   {"op":"result","id":4,"value":{"ok":true}}
//! ```
//!
//! An `error` frame with `"fatal":true`, a malformed frame, or transport
//! EOF is a boundary-fatal condition: every in-flight call fails and the
//! agent instance is dead.

use crate::boundary::backend::{BoundaryArg, EntryPoint, ValueHandle};
use serde::{Deserialize, Serialize};

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// Host → boundary: report the agent manifest.
    Describe { id: u64 },

    /// Host → boundary: run an entry point. With `retain` the result stays
    /// boundary-resident and comes back as a handle.
    Invoke {
        id: u64,
        entry: EntryPoint,
        args: Vec<BoundaryArg>,
        retain: bool,
    },

    /// Host → boundary: drop a retained value.
    Release { id: u64, handle: ValueHandle },

    /// Host → boundary: shut down.
    Dispose { id: u64 },

    /// Boundary → host: call an injected capability. `invoke` is the id of
    /// the host-originated invoke this call happens inside.
    HostCall {
        id: u64,
        invoke: u64,
        name: String,
        args: Vec<serde_json::Value>,
    },

    /// Successful answer to a request with the same id.
    Result {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<ValueHandle>,
    },

    /// Failed answer to a request with the same id. `fatal` marks an
    /// unrecoverable boundary condition rather than an agent-code error.
    Error {
        id: u64,
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

impl Frame {
    pub fn ok(id: u64, value: serde_json::Value) -> Self {
        Frame::Result {
            id,
            value: Some(value),
            handle: None,
        }
    }

    pub fn retained(id: u64, handle: ValueHandle) -> Self {
        Frame::Result {
            id,
            value: None,
            handle: Some(handle),
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            message: message.into(),
            fatal: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_frame_shape() {
        let frame = Frame::Invoke {
            id: 4,
            entry: EntryPoint::action("add"),
            args: vec![BoundaryArg::Value(json!({"n": 2}))],
            retain: false,
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            line,
            r#"{"op":"invoke","id":4,"entry":{"kind":"action","name":"add"},"args":[{"value":{"n":2}}],"retain":false}"#
        );
    }

    #[test]
    fn test_result_roundtrip() {
        let frame = Frame::retained(7, ValueHandle(3));
        let line = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&line).unwrap();
        match parsed {
            Frame::Result { id, value, handle } => {
                assert_eq!(id, 7);
                assert!(value.is_none());
                assert_eq!(handle, Some(ValueHandle(3)));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_error_defaults_nonfatal() {
        let parsed: Frame =
            serde_json::from_str(r#"{"op":"error","id":1,"message":"nope"}"#).unwrap();
        match parsed {
            Frame::Error { fatal, .. } => assert!(!fatal),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_host_call_roundtrip() {
        let frame = Frame::HostCall {
            id: 901,
            invoke: 4,
            name: "push_event".to_string(),
            args: vec![json!("expense"), json!({"n": 2})],
        };
        let line = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&line).unwrap();
        match parsed {
            Frame::HostCall { invoke, name, .. } => {
                assert_eq!(invoke, 4);
                assert_eq!(name, "push_event");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
