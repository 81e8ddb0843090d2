// src/boundary/direct.rs
//! Direct in-process execution backend
//!
//! Hosts an agent defined as native Rust handlers. No isolation and no
//! marshalling cost; behaviorally identical to the isolated backend apart
//! from fault containment. Handlers never receive references to the log,
//! scheduler, or network — only the [`AgentContext`] of injected host
//! capabilities.

use crate::boundary::backend::{
    AgentManifest, AggregationStage, BackendKind, BoundaryArg, CapabilityScope, EntryPoint,
    ExecutionBackend, HostFn, Trigger, ValueHandle,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Async handler for an action, view, or automation.
pub type Handler =
    Arc<dyn Fn(Value, AgentContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

type FoldFn1 = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;
type FoldFn2 = Arc<dyn Fn(Value, Value) -> anyhow::Result<Value> + Send + Sync>;

/// The three functions of an aggregation: `initialize(prior)`,
/// `reducer(accumulator, event)`, `serialize(accumulator)`. Pure folds;
/// they run without host capabilities.
#[derive(Clone)]
pub struct AggregationDef {
    initialize: FoldFn1,
    reducer: FoldFn2,
    serialize: FoldFn1,
}

impl AggregationDef {
    pub fn new<I, R, S>(initialize: I, reducer: R, serialize: S) -> Self
    where
        I: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
        R: Fn(Value, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
        S: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            initialize: Arc::new(initialize),
            reducer: Arc::new(reducer),
            serialize: Arc::new(serialize),
        }
    }
}

/// A native agent: the in-process equivalent of a loaded code bundle.
#[derive(Clone, Default)]
pub struct AgentDefinition {
    name: String,
    description: String,
    actions: HashMap<String, Handler>,
    views: HashMap<String, Handler>,
    automations: HashMap<String, (Trigger, Handler)>,
    aggregations: HashMap<String, AggregationDef>,
}

impl AgentDefinition {
    pub fn builder(name: impl Into<String>) -> AgentDefinitionBuilder {
        AgentDefinitionBuilder {
            definition: AgentDefinition {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    fn manifest(&self) -> AgentManifest {
        AgentManifest {
            name: self.name.clone(),
            description: self.description.clone(),
            actions: self.actions.keys().cloned().collect(),
            views: self.views.keys().cloned().collect(),
            automations: self
                .automations
                .iter()
                .map(|(name, (trigger, _))| (name.clone(), trigger.clone()))
                .collect(),
            aggregations: self.aggregations.keys().cloned().collect(),
        }
    }
}

/// Builder for [`AgentDefinition`].
pub struct AgentDefinitionBuilder {
    definition: AgentDefinition,
}

impl AgentDefinitionBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = description.into();
        self
    }

    pub fn action<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.definition
            .actions
            .insert(name.into(), wrap_handler(handler));
        self
    }

    pub fn view<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.definition
            .views
            .insert(name.into(), wrap_handler(handler));
        self
    }

    pub fn automation<F, Fut>(
        mut self,
        name: impl Into<String>,
        trigger: Trigger,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.definition
            .automations
            .insert(name.into(), (trigger, wrap_handler(handler)));
        self
    }

    pub fn aggregation(mut self, name: impl Into<String>, def: AggregationDef) -> Self {
        self.definition.aggregations.insert(name.into(), def);
        self
    }

    pub fn build(self) -> AgentDefinition {
        self.definition
    }
}

fn wrap_handler<F, Fut>(handler: F) -> Handler
where
    F: Fn(Value, AgentContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |params, ctx| handler(params, ctx).boxed())
}

/// The capability surface visible to a running handler: exactly the host
/// functions injected into the backend, nothing else.
#[derive(Clone)]
pub struct AgentContext {
    scope: CapabilityScope,
    calls: Arc<HashMap<String, HostFn>>,
}

impl AgentContext {
    /// Call an injected host capability by name.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let host_fn = self.calls.get(name).cloned().ok_or_else(|| {
            EngineError::CapabilityUnavailable {
                name: name.to_string(),
                scope: self.scope.as_str(),
            }
        })?;
        host_fn(self.scope, args).await
    }

    pub fn scope(&self) -> CapabilityScope {
        self.scope
    }
}

/// Direct in-process execution backend
pub struct DirectBackend {
    definition: AgentDefinition,
    injected: RwLock<Arc<HashMap<String, HostFn>>>,
    retained: DashMap<u64, Value>,
    next_handle: AtomicU64,
    disposed: AtomicBool,
}

impl DirectBackend {
    pub fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            injected: RwLock::new(Arc::new(HashMap::new())),
            retained: DashMap::new(),
            next_handle: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Resolve arguments, consuming any handles.
    fn resolve_args(&self, args: Vec<BoundaryArg>) -> Result<Vec<Value>> {
        args.into_iter()
            .map(|arg| match arg {
                BoundaryArg::Value(value) => Ok(value),
                BoundaryArg::Handle(handle) => self
                    .retained
                    .remove(&handle.0)
                    .map(|(_, value)| value)
                    .ok_or_else(|| {
                        EngineError::MarshallingFailed(format!("unknown handle {}", handle.0))
                    }),
            })
            .collect()
    }

    fn retain(&self, value: Value) -> ValueHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.retained.insert(id, value);
        ValueHandle(id)
    }

    async fn run_entry(&self, entry: &EntryPoint, args: Vec<BoundaryArg>) -> Result<Value> {
        self.check_live()?;
        let mut args = self.resolve_args(args)?;

        match entry {
            EntryPoint::Action { name } => {
                let handler = self
                    .definition
                    .actions
                    .get(name)
                    .cloned()
                    .ok_or_else(|| entry_missing(entry))?;
                self.run_handler(entry, handler, take_first(&mut args)).await
            }
            EntryPoint::View { name } => {
                let handler = self
                    .definition
                    .views
                    .get(name)
                    .cloned()
                    .ok_or_else(|| entry_missing(entry))?;
                self.run_handler(entry, handler, take_first(&mut args)).await
            }
            EntryPoint::Automation { name } => {
                let handler = self
                    .definition
                    .automations
                    .get(name)
                    .map(|(_, handler)| handler.clone())
                    .ok_or_else(|| entry_missing(entry))?;
                self.run_handler(entry, handler, take_first(&mut args)).await
            }
            EntryPoint::Aggregation { name, stage } => {
                let def = self
                    .definition
                    .aggregations
                    .get(name)
                    .cloned()
                    .ok_or_else(|| entry_missing(entry))?;
                run_fold(entry, &def, *stage, args)
            }
        }
    }

    async fn run_handler(
        &self,
        entry: &EntryPoint,
        handler: Handler,
        params: Value,
    ) -> Result<Value> {
        let ctx = AgentContext {
            scope: entry.scope(),
            calls: self.injected.read().clone(),
        };

        debug!(entry = %entry, "Invoking handler");

        match AssertUnwindSafe(handler(params, ctx)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_agent_err(entry, err)),
            Err(panic) => Err(EngineError::agent_code(
                entry.to_string(),
                format!("panicked: {}", panic_message(&panic)),
            )),
        }
    }
}

fn take_first(args: &mut Vec<Value>) -> Value {
    if args.is_empty() {
        Value::Null
    } else {
        args.remove(0)
    }
}

fn entry_missing(entry: &EntryPoint) -> EngineError {
    EngineError::UnknownEntryPoint {
        kind: entry.kind(),
        name: entry.name().to_string(),
    }
}

/// Propagate typed engine errors untouched; wrap everything else with the
/// failing entry point.
fn map_agent_err(entry: &EntryPoint, err: anyhow::Error) -> EngineError {
    match err.downcast::<EngineError>() {
        Ok(engine) => engine,
        Err(other) => EngineError::agent_code(entry.to_string(), other),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_fold(
    entry: &EntryPoint,
    def: &AggregationDef,
    stage: AggregationStage,
    mut args: Vec<Value>,
) -> Result<Value> {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| match stage {
        AggregationStage::Initialize => (def.initialize)(take_first(&mut args)),
        AggregationStage::Reducer => {
            let acc = take_first(&mut args);
            let event = take_first(&mut args);
            (def.reducer)(acc, event)
        }
        AggregationStage::Serialize => (def.serialize)(take_first(&mut args)),
    }));

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(map_agent_err(entry, err)),
        Err(panic) => Err(EngineError::agent_code(
            entry.to_string(),
            format!("panicked: {}", panic_message(&panic)),
        )),
    }
}

#[async_trait]
impl ExecutionBackend for DirectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn describe(&self) -> Result<AgentManifest> {
        self.check_live()?;
        Ok(self.definition.manifest())
    }

    async fn invoke(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
    ) -> Result<serde_json::Value> {
        self.run_entry(entry, args).await
    }

    async fn invoke_retained(
        &self,
        entry: &EntryPoint,
        args: Vec<BoundaryArg>,
    ) -> Result<ValueHandle> {
        let value = self.run_entry(entry, args).await?;
        Ok(self.retain(value))
    }

    async fn inject(&self, name: &str, host_fn: HostFn) -> Result<()> {
        self.check_live()?;
        let mut injected = self.injected.write();
        let mut table: HashMap<String, HostFn> = (**injected).clone();
        table.insert(name.to_string(), host_fn);
        *injected = Arc::new(table);
        Ok(())
    }

    async fn release(&self, handle: ValueHandle) -> Result<()> {
        self.retained.remove(&handle.0);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.retained.clear();
        *self.injected.write() = Arc::new(HashMap::new());
        debug!(agent = %self.definition.name, "Direct backend disposed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sum_aggregation() -> AggregationDef {
        AggregationDef::new(
            |prior| Ok(if prior.is_null() { json!(0) } else { prior }),
            |acc, event| {
                let n = event["payload"]["n"].as_i64().unwrap_or(0);
                Ok(json!(acc.as_i64().unwrap_or(0) + n))
            },
            |acc| Ok(acc),
        )
    }

    fn definition() -> AgentDefinition {
        AgentDefinition::builder("expenses")
            .description("expense tracker")
            .action("echo", |params, _ctx| async move { Ok(params) })
            .action("mint", |_params, ctx| async move {
                let id = ctx.call("create_resource", vec![]).await?;
                Ok(id)
            })
            .view("nothing", |_params, _ctx| async move { Ok(json!(null)) })
            .automation("on_expense", Trigger::event("expense"), |_p, _c| async {
                Ok(json!(null))
            })
            .aggregation("sum", sum_aggregation())
            .build()
    }

    #[tokio::test]
    async fn test_describe_manifest() {
        let backend = DirectBackend::new(definition());
        let manifest = backend.describe().await.unwrap();

        assert_eq!(manifest.name, "expenses");
        assert!(manifest.actions.contains("echo"));
        assert!(manifest.views.contains("nothing"));
        assert_eq!(
            manifest.automations.get("on_expense").unwrap().run_on,
            "expense"
        );
        assert!(manifest.aggregations.contains("sum"));
    }

    #[tokio::test]
    async fn test_invoke_action_copies_params() {
        let backend = DirectBackend::new(definition());
        let result = backend
            .invoke(
                &EntryPoint::action("echo"),
                vec![BoundaryArg::Value(json!({"a": 1}))],
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let backend = DirectBackend::new(definition());
        let err = backend
            .invoke(&EntryPoint::action("missing"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntryPoint { .. }));
    }

    #[tokio::test]
    async fn test_injected_capability_reachable() {
        let backend = DirectBackend::new(definition());
        backend
            .inject(
                "create_resource",
                Arc::new(|_scope, _args| async { Ok(json!("r-1")) }.boxed()),
            )
            .await
            .unwrap();

        let result = backend
            .invoke(&EntryPoint::action("mint"), vec![BoundaryArg::Value(json!({}))])
            .await
            .unwrap();
        assert_eq!(result, json!("r-1"));
    }

    #[tokio::test]
    async fn test_uninjected_capability_unavailable() {
        let backend = DirectBackend::new(definition());
        let err = backend
            .invoke(&EntryPoint::action("mint"), vec![BoundaryArg::Value(json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_retained_fold_threading() {
        let backend = DirectBackend::new(definition());

        let acc = backend
            .invoke_retained(
                &EntryPoint::aggregation("sum", AggregationStage::Initialize),
                vec![BoundaryArg::Value(Value::Null)],
            )
            .await
            .unwrap();

        let mut acc = acc;
        for n in [2, 3, 5] {
            acc = backend
                .invoke_retained(
                    &EntryPoint::aggregation("sum", AggregationStage::Reducer),
                    vec![
                        BoundaryArg::Handle(acc),
                        BoundaryArg::Value(json!({"payload": {"n": n}})),
                    ],
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

        // The handle was consumed by the serialize call.
        let err = backend
            .invoke(
                &EntryPoint::aggregation("sum", AggregationStage::Serialize),
                vec![BoundaryArg::Handle(acc)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MarshallingFailed(_)));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let definition = AgentDefinition::builder("panicky")
            .action("boom", |_p, _c| async { panic!("kaboom") })
            .build();
        let backend = DirectBackend::new(definition);

        let err = backend
            .invoke(&EntryPoint::action("boom"), vec![])
            .await
            .unwrap_err();
        match err {
            EngineError::AgentCode { message, .. } => assert!(message.contains("kaboom")),
            other => panic!("expected AgentCode, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typed_errors_pass_through() {
        let definition = AgentDefinition::builder("fetcher")
            .action("call_home", |_p, _c| async {
                Err(EngineError::DomainNotAllowed {
                    host: "evil.example".to_string(),
                }
                .into())
            })
            .build();
        let backend = DirectBackend::new(definition);

        let err = backend
            .invoke(&EntryPoint::action("call_home"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DomainNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let backend = DirectBackend::new(definition());
        backend.dispose().await.unwrap();
        backend.dispose().await.unwrap();

        let err = backend
            .invoke(&EntryPoint::action("echo"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
        assert!(matches!(
            backend.describe().await.unwrap_err(),
            EngineError::Disposed
        ));
    }
}
