// src/boundary/isolated.rs
//! Isolated out-of-process execution backend
//!
//! Runs agent code in a child process and speaks the line-delimited JSON
//! protocol from [`crate::boundary::protocol`] over its stdin/stdout.
//! Arguments and results are deep-copied across the pipe; aggregation
//! accumulators stay resident in the child and travel as opaque handles.
//!
//! The transport is pluggable: production attaches to a spawned child,
//! tests attach to an in-memory duplex stream. A transport error, EOF, a
//! malformed frame, or an `error` frame marked fatal kills the instance:
//! every in-flight call fails with a boundary-fatal error.

use crate::boundary::backend::{
    AgentManifest, BackendKind, BoundaryArg, CapabilityScope, EntryPoint, ExecutionBackend, HostFn,
    ValueHandle,
};
use crate::boundary::protocol::Frame;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, warn};

/// Configuration for spawning an isolated agent process.
#[derive(Debug, Clone)]
pub struct IsolatedConfig {
    /// Program hosting the agent bundle
    pub program: String,

    /// Arguments (typically the shim and bundle paths)
    pub args: Vec<String>,

    /// Environment variables
    pub env: Vec<(String, String)>,

    /// Working directory
    pub work_dir: Option<String>,

    /// Per-call timeout in seconds
    pub call_timeout_secs: u64,

    /// Grace period before a SIGTERM escalates to SIGKILL
    pub kill_grace_secs: u64,
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec![],
            env: vec![],
            work_dir: None,
            call_timeout_secs: 300,
            kill_grace_secs: 5,
        }
    }
}

/// Successful answer to a host request.
#[derive(Debug)]
struct Reply {
    value: Option<serde_json::Value>,
    handle: Option<ValueHandle>,
}

/// Why a host request did not produce a reply.
#[derive(Debug, Clone)]
enum ReplyError {
    /// The boundary reported an ordinary (recoverable) error.
    Remote(String),

    /// The boundary is dead.
    Fatal(String),

    /// Backend disposed before or during the call.
    Disposed,

    /// No answer within the configured timeout.
    TimedOut,
}

type PendingReply = std::result::Result<Reply, ReplyError>;

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<PendingReply>>>,
    scopes: Mutex<HashMap<u64, CapabilityScope>>,
    injected: RwLock<Arc<HashMap<String, HostFn>>>,
    outbound: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU64,
    fatal: Mutex<Option<String>>,
    disposed: AtomicBool,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn complete(&self, id: u64, reply: PendingReply) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(reply);
        } else {
            warn!(id, "Reply for unknown request id");
        }
    }

    /// Mark the boundary dead and fail every in-flight call.
    fn fail_all(&self, message: &str) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(message.to_string());
            }
        }
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            error!(message, in_flight = drained.len(), "Boundary failure");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(ReplyError::Fatal(message.to_string())));
        }
    }

    fn drain_disposed(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(ReplyError::Disposed));
        }
    }
}

/// Isolated out-of-process execution backend
pub struct IsolatedBackend {
    shared: Arc<Shared>,
    config: IsolatedConfig,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IsolatedBackend {
    /// Spawn the agent process and attach to its stdio.
    pub fn launch(config: IsolatedConfig) -> Result<Self> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("Failed to spawn {}: {}", config.program, e))
        })?;

        debug!(program = %config.program, pid = ?child.id(), "Agent process spawned");

        let stdin = child.stdin.take().ok_or_else(|| {
            EngineError::ProcessSpawnFailed("Failed to capture stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::ProcessSpawnFailed("Failed to capture stdout".to_string())
        })?;
        let stderr = child.stderr.take();

        let backend = Self::start(Box::new(stdout), Box::new(stdin), Some(child), config);

        if let Some(stderr) = stderr {
            let handle = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agent_stderr", "{}", line);
                }
            });
            backend.tasks.lock().push(handle);
        }

        Ok(backend)
    }

    /// Attach to an already-established transport (used by tests and by
    /// embedders with their own process management).
    pub fn from_transport<R, W>(read: R, write: W, config: IsolatedConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(Box::new(read), Box::new(write), None, config)
    }

    fn start(
        read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        child: Option<Child>,
        config: IsolatedConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            scopes: Mutex::new(HashMap::new()),
            injected: RwLock::new(Arc::new(HashMap::new())),
            outbound: outbound_tx,
            next_id: AtomicU64::new(1),
            fatal: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(reader_loop(Arc::clone(&shared), read));
        let writer = tokio::spawn(writer_loop(Arc::clone(&shared), write, outbound_rx));

        Self {
            shared,
            config,
            child: Mutex::new(child),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Send a request frame and wait for its reply.
    async fn request(&self, id: u64, frame: Frame) -> PendingReply {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(ReplyError::Disposed);
        }
        if let Some(message) = self.shared.fatal.lock().clone() {
            return Err(ReplyError::Fatal(message));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        if self.shared.outbound.send(frame).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(ReplyError::Fatal("boundary writer closed".to_string()));
        }

        let timeout = Duration::from_secs(self.config.call_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(ReplyError::TimedOut)
            }
            Ok(Err(_)) => match self.shared.fatal.lock().clone() {
                Some(message) => Err(ReplyError::Fatal(message)),
                None => Err(ReplyError::Disposed),
            },
            Ok(Ok(reply)) => reply,
        }
    }

    async fn call_entry(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
        retain: bool,
    ) -> Result<Reply> {
        let id = self.shared.next_id();
        self.shared.scopes.lock().insert(id, entry.scope());

        let result = self
            .request(
                id,
                Frame::Invoke {
                    id,
                    entry: entry.clone(),
                    args,
                    retain,
                },
            )
            .await;

        self.shared.scopes.lock().remove(&id);

        result.map_err(|err| match err {
            ReplyError::Remote(message) => EngineError::agent_code(entry.to_string(), message),
            ReplyError::Fatal(message) => EngineError::BoundaryFatal(message),
            ReplyError::Disposed => EngineError::Disposed,
            ReplyError::TimedOut => EngineError::ExecutionTimeout,
        })
    }
}

#[async_trait]
impl ExecutionBackend for IsolatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Isolated
    }

    async fn describe(&self) -> Result<AgentManifest> {
        let id = self.shared.next_id();
        let reply = self
            .request(id, Frame::Describe { id })
            .await
            .map_err(|err| match err {
                ReplyError::Disposed => EngineError::Disposed,
                ReplyError::TimedOut => EngineError::ExecutionTimeout,
                ReplyError::Remote(message) | ReplyError::Fatal(message) => {
                    EngineError::BoundaryFatal(format!("manifest request failed: {}", message))
                }
            })?;

        let value = reply.value.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| EngineError::BoundaryFatal(format!("malformed manifest: {}", e)))
    }

    async fn invoke(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
    ) -> Result<serde_json::Value> {
        let reply = self.call_entry(entry, args, false).await?;
        Ok(reply.value.unwrap_or(serde_json::Value::Null))
    }

    async fn invoke_retained(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
    ) -> Result<ValueHandle> {
        let reply = self.call_entry(entry, args, true).await?;
        reply.handle.ok_or_else(|| {
            EngineError::MarshallingFailed("boundary returned no handle for retained call".into())
        })
    }

    async fn inject(&self, name: &str, host_fn: HostFn) -> Result<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        let mut injected = self.shared.injected.write();
        let mut table: HashMap<String, HostFn> = (**injected).clone();
        table.insert(name.to_string(), host_fn);
        *injected = Arc::new(table);
        Ok(())
    }

    async fn release(&self, handle: ValueHandle) -> Result<()> {
        let id = self.shared.next_id();
        // Best-effort: a dead or disposed boundary has nothing to release.
        let _ = self.request(id, Frame::Release { id, handle }).await;
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Disposing isolated backend");

        // Polite shutdown: ask the boundary to exit, bounded wait.
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        let _ = self.shared.outbound.send(Frame::Dispose { id });
        let _ = tokio::time::timeout(Duration::from_secs(self.config.kill_grace_secs), rx).await;

        let child = self.child.lock().take();
        if let Some(child) = child {
            terminate(child, self.config.kill_grace_secs).await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.drain_disposed();

        Ok(())
    }
}

impl Drop for IsolatedBackend {
    fn drop(&mut self) {
        // Best-effort cleanup; the child (if any) dies via kill_on_drop.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// SIGTERM, bounded wait, SIGKILL.
async fn terminate(mut child: Child, grace_secs: u64) {
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!(pid, "Sending SIGTERM to agent process");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match tokio::time::timeout(Duration::from_secs(grace_secs), child.wait()).await {
        Ok(Ok(status)) => debug!("Agent process exited with {}", status),
        Ok(Err(e)) => warn!("Error waiting for agent process: {}", e),
        Err(_) => {
            warn!("Agent process did not exit in time, forcing kill");
            let _ = child.kill().await;
        }
    }
}

async fn reader_loop(shared: Arc<Shared>, read: Box<dyn AsyncRead + Send + Unpin>) {
    let mut frames = FramedRead::new(read, LinesCodec::new());

    while let Some(item) = frames.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                shared.fail_all(&format!("transport error: {}", e));
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                shared.fail_all(&format!("protocol violation: {}", e));
                return;
            }
        };

        match frame {
            Frame::Result { id, value, handle } => {
                shared.complete(id, Ok(Reply { value, handle }));
            }
            Frame::Error { id, message, fatal } => {
                if fatal {
                    shared.fail_all(&message);
                    return;
                }
                shared.complete(id, Err(ReplyError::Remote(message)));
            }
            Frame::HostCall {
                id,
                invoke,
                name,
                args,
            } => {
                let scope = shared.scopes.lock().get(&invoke).copied();
                let host_fn = shared.injected.read().get(&name).cloned();
                let outbound = shared.outbound.clone();

                tokio::spawn(async move {
                    let reply = match (scope, host_fn) {
                        (Some(scope), Some(host_fn)) => match host_fn(scope, args).await {
                            Ok(value) => Frame::ok(id, value),
                            Err(e) => Frame::err(id, e.to_string()),
                        },
                        (None, _) => Frame::err(id, "host call outside an active invocation"),
                        (_, None) => Frame::err(id, format!("capability {} not available", name)),
                    };
                    let _ = outbound.send(reply);
                });
            }
            other => {
                shared.fail_all(&format!("unexpected frame from boundary: {:?}", other));
                return;
            }
        }
    }

    shared.fail_all("boundary closed");
}

async fn writer_loop(
    shared: Arc<Shared>,
    write: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let mut sink = FramedWrite::new(write, LinesCodec::new());

    while let Some(frame) = outbound.recv().await {
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                shared.fail_all(&format!("frame encoding failed: {}", e));
                return;
            }
        };
        if let Err(e) = sink.send(line).await {
            shared.fail_all(&format!("write failed: {}", e));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::backend::AggregationStage;
    use futures::FutureExt;
    use serde_json::{json, Value};

    fn test_config() -> IsolatedConfig {
        IsolatedConfig {
            call_timeout_secs: 5,
            kill_grace_secs: 1,
            ..Default::default()
        }
    }

    fn manifest_json() -> Value {
        json!({
            "name": "remote",
            "description": "remote test agent",
            "actions": ["echo", "mint", "boom", "die"],
            "views": [],
            "automations": {},
            "aggregations": ["sum"]
        })
    }

    /// Minimal in-memory agent speaking the boundary side of the protocol.
    async fn fake_agent(stream: tokio::io::DuplexStream) {
        let (read, write) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read, LinesCodec::new());
        let mut writer = FramedWrite::new(write, LinesCodec::new());

        let mut retained: HashMap<u64, Value> = HashMap::new();
        let mut next_handle = 1u64;
        let mut next_call = 9001u64;

        macro_rules! reply {
            ($frame:expr) => {
                if writer
                    .send(serde_json::to_string(&$frame).unwrap())
                    .await
                    .is_err()
                {
                    return;
                }
            };
        }

        while let Some(Ok(line)) = reader.next().await {
            let frame: Frame = serde_json::from_str(&line).unwrap();
            match frame {
                Frame::Describe { id } => reply!(Frame::ok(id, manifest_json())),
                Frame::Release { id, handle } => {
                    retained.remove(&handle.0);
                    reply!(Frame::ok(id, Value::Null));
                }
                Frame::Dispose { id } => {
                    reply!(Frame::ok(id, Value::Null));
                    return;
                }
                Frame::Invoke {
                    id,
                    entry,
                    mut args,
                    retain,
                } => {
                    let resolve = |arg: BoundaryArg, retained: &mut HashMap<u64, Value>| match arg
                    {
                        BoundaryArg::Value(value) => value,
                        BoundaryArg::Handle(handle) => {
                            retained.remove(&handle.0).unwrap_or(Value::Null)
                        }
                    };

                    let result = match &entry {
                        EntryPoint::Action { name } if name == "echo" => {
                            Ok(resolve(args.remove(0), &mut retained))
                        }
                        EntryPoint::Action { name } if name == "boom" => {
                            reply!(Frame::err(id, "exploded"));
                            continue;
                        }
                        EntryPoint::Action { name } if name == "die" => return,
                        EntryPoint::Action { name } if name == "mint" => {
                            let call_id = next_call;
                            next_call += 1;
                            reply!(Frame::HostCall {
                                id: call_id,
                                invoke: id,
                                name: "create_resource".to_string(),
                                args: vec![],
                            });
                            // Wait for the host's answer to our call.
                            let mut answer = Value::Null;
                            while let Some(Ok(line)) = reader.next().await {
                                match serde_json::from_str::<Frame>(&line).unwrap() {
                                    Frame::Result { id: rid, value, .. } if rid == call_id => {
                                        answer = value.unwrap_or(Value::Null);
                                        break;
                                    }
                                    Frame::Error { id: rid, message, .. } if rid == call_id => {
                                        answer = json!({ "host_error": message });
                                        break;
                                    }
                                    _ => continue,
                                }
                            }
                            Ok(answer)
                        }
                        EntryPoint::Aggregation { name, stage } if name == "sum" => match stage {
                            AggregationStage::Initialize => {
                                let prior = resolve(args.remove(0), &mut retained);
                                Ok(if prior.is_null() { json!(0) } else { prior })
                            }
                            AggregationStage::Reducer => {
                                let acc = resolve(args.remove(0), &mut retained);
                                let event = resolve(args.remove(0), &mut retained);
                                Ok(json!(
                                    acc.as_i64().unwrap_or(0) + event.as_i64().unwrap_or(0)
                                ))
                            }
                            AggregationStage::Serialize => {
                                Ok(resolve(args.remove(0), &mut retained))
                            }
                        },
                        _ => Err("unknown entry".to_string()),
                    };

                    match result {
                        Err(message) => reply!(Frame::err(id, message)),
                        Ok(value) if retain => {
                            let handle = ValueHandle(next_handle);
                            next_handle += 1;
                            retained.insert(handle.0, value);
                            reply!(Frame::retained(id, handle));
                        }
                        Ok(value) => reply!(Frame::ok(id, value)),
                    }
                }
                _ => {}
            }
        }
    }

    fn connect() -> IsolatedBackend {
        let (host_side, agent_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_agent(agent_side));
        let (read, write) = tokio::io::split(host_side);
        IsolatedBackend::from_transport(read, write, test_config())
    }

    #[tokio::test]
    async fn test_describe_roundtrip() {
        let backend = connect();
        let manifest = backend.describe().await.unwrap();
        assert_eq!(manifest.name, "remote");
        assert!(manifest.actions.contains("echo"));
        assert!(manifest.aggregations.contains("sum"));
    }

    #[tokio::test]
    async fn test_invoke_copies_values() {
        let backend = connect();
        let result = backend
            .invoke(
                &EntryPoint::action("echo"),
                vec![BoundaryArg::Value(json!({"n": 2}))],
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_host_call_bridging() {
        let backend = connect();

        let seen_scope = Arc::new(Mutex::new(None));
        let scope_probe = Arc::clone(&seen_scope);
        backend
            .inject(
                "create_resource",
                Arc::new(move |scope, _args| {
                    let probe = Arc::clone(&scope_probe);
                    async move {
                        *probe.lock() = Some(scope);
                        Ok(json!("r-99"))
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let result = backend
            .invoke(&EntryPoint::action("mint"), vec![BoundaryArg::Value(json!({}))])
            .await
            .unwrap();
        assert_eq!(result, json!("r-99"));
        assert_eq!(*seen_scope.lock(), Some(CapabilityScope::Action));
    }

    #[tokio::test]
    async fn test_remote_error_is_agent_code() {
        let backend = connect();
        let err = backend
            .invoke(&EntryPoint::action("boom"), vec![])
            .await
            .unwrap_err();
        match err {
            EngineError::AgentCode { entry, message } => {
                assert_eq!(entry, "action boom");
                assert!(message.contains("exploded"));
            }
            other => panic!("expected AgentCode, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retained_fold_over_protocol() {
        let backend = connect();

        let mut acc = backend
            .invoke_retained(
                &EntryPoint::aggregation("sum", AggregationStage::Initialize),
                vec![BoundaryArg::Value(Value::Null)],
            )
            .await
            .unwrap();

        for n in [4, 6] {
            acc = backend
                .invoke_retained(
                    &EntryPoint::aggregation("sum", AggregationStage::Reducer),
                    vec![BoundaryArg::Handle(acc), BoundaryArg::Value(json!(n))],
                )
                .await
                .unwrap();
        }

        let result = backend
            .invoke(
                &EntryPoint::aggregation("sum", AggregationStage::Serialize),
                vec![BoundaryArg::Handle(acc)],
            )
            .await
            .unwrap();
        assert_eq!(result, json!(10));
    }

    #[tokio::test]
    async fn test_boundary_death_is_fatal() {
        let backend = connect();
        let err = backend
            .invoke(&EntryPoint::action("die"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BoundaryFatal(_)));

        // Every later call fails the same way.
        let err = backend
            .invoke(&EntryPoint::action("echo"), vec![BoundaryArg::Value(json!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BoundaryFatal(_)));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let backend = connect();
        backend.dispose().await.unwrap();
        backend.dispose().await.unwrap();

        let err = backend
            .invoke(&EntryPoint::action("echo"), vec![BoundaryArg::Value(json!(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
    }
}
