// src/gateway/capability.rs
//! Capability gateway
//!
//! The only channel between agent code and host resources. One gateway is
//! bound per agent instance, capturing that agent's identity, its domain
//! policy, and references to the log and job manager. Each capability is
//! injected into the execution backend as a named host function; agent
//! code never holds a direct reference to the log, scheduler, or network
//! client.
//!
//! Capabilities are scope-gated the way entry points run: actions and
//! automations see the full surface, views see only `get_view` and
//! `get_aggregation`, aggregation folds see nothing. Every mutating call
//! completes (or fails) before control returns to the boundary.

use crate::boundary::backend::{BackendKind, CapabilityScope, ExecutionBackend, HostFn};
use crate::boundary::direct::AgentContext;
use crate::gateway::fetch::{FetchInit, FetchParse, Fetcher};
use crate::log::contract::{AppendEvent, UniversalLog, TAG_RESOURCE_ID, TAG_TYPE};
use crate::scheduler::job::{AddJobRequest, SchedulerOptions};
use crate::scheduler::job_manager::JobManager;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Stable injection names for the capability surface.
pub mod names {
    pub const GET_VIEW: &str = "get_view";
    pub const GET_AGGREGATION: &str = "get_aggregation";
    pub const PUSH_EVENT: &str = "push_event";
    pub const FETCH: &str = "fetch";
    pub const SCHEDULE_ACTION: &str = "schedule_action";
    pub const UNSCHEDULE_ACTION: &str = "unschedule_action";
    pub const CREATE_RESOURCE: &str = "create_resource";
    pub const NOTIFY: &str = "notify";
}

const ACTION_ONLY: &[CapabilityScope] = &[CapabilityScope::Action];
const ACTION_AND_VIEW: &[CapabilityScope] = &[CapabilityScope::Action, CapabilityScope::View];
const VIEW_ONLY: &[CapabilityScope] = &[CapabilityScope::View];

/// Optional metadata attached to a pushed event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMeta {
    pub resource_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Back-reference into the owning agent, used by the capabilities that
/// re-enter it (`get_view`, `get_aggregation`). Held weakly so disposal
/// is never kept alive by injected closures.
#[async_trait]
pub trait ViewHost: Send + Sync {
    async fn view(&self, name: &str, params: Value) -> Result<Value>;
    async fn aggregation(&self, name: &str, tags: BTreeMap<String, String>) -> Result<Value>;
}

/// Capability gateway bound to one agent instance.
pub struct CapabilityGateway {
    agent_id: String,
    log: Arc<dyn UniversalLog>,
    jobs: Arc<dyn JobManager>,
    fetcher: Fetcher,
    host: Weak<dyn ViewHost>,
}

impl CapabilityGateway {
    pub fn new(
        agent_id: impl Into<String>,
        log: Arc<dyn UniversalLog>,
        jobs: Arc<dyn JobManager>,
        fetcher: Fetcher,
        host: Weak<dyn ViewHost>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            log,
            jobs,
            fetcher,
            host,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn host(&self) -> Result<Arc<dyn ViewHost>> {
        self.host.upgrade().ok_or(EngineError::Disposed)
    }

    /// Resolve a view of the current agent. Agent-qualified names
    /// (`other-agent/view`) are recognized and rejected as unsupported.
    pub async fn get_view(&self, name: &str, params: Value) -> Result<Value> {
        if name.contains('/') {
            return Err(EngineError::CrossAgentUnsupported);
        }
        self.host()?.view(name, params).await
    }

    pub async fn get_aggregation(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Value> {
        self.host()?.aggregation(name, tags).await
    }

    /// Append an event, merging caller tags with `_type` and, when a
    /// resource id is given, `_resourceId`.
    pub async fn push_event(&self, event_type: &str, payload: Value, meta: EventMeta) -> Result<()> {
        let mut tags = meta.tags;
        tags.insert(TAG_TYPE.to_string(), event_type.to_string());
        if let Some(resource_id) = &meta.resource_id {
            tags.insert(TAG_RESOURCE_ID.to_string(), resource_id.clone());
        }

        self.log
            .append_to_log(AppendEvent {
                agent_id: self.agent_id.clone(),
                event_type: event_type.to_string(),
                payload,
                tags,
                resource_id: meta.resource_id,
            })
            .await
    }

    pub async fn fetch(&self, url: &str, init: FetchInit, parse: FetchParse) -> Result<Value> {
        self.fetcher.fetch(url, init, parse).await
    }

    pub async fn schedule_action(
        &self,
        action_key: &str,
        params: Value,
        run_at: DateTime<Utc>,
        options: Option<SchedulerOptions>,
    ) -> Result<String> {
        self.jobs
            .add_job(
                &self.agent_id,
                AddJobRequest {
                    action_key: action_key.to_string(),
                    params,
                    run_at,
                    options,
                },
            )
            .await
    }

    pub async fn unschedule_action(&self, job_key: &str) -> Result<()> {
        self.jobs.remove_job(job_key).await
    }

    pub async fn create_resource(&self) -> Result<String> {
        self.log.create_resource().await
    }

    pub async fn notify(&self, message: &str) -> Result<()> {
        self.log.create_notification(&self.agent_id, message).await
    }
}

/// Wrap a capability body with its scope gate.
fn scoped<F>(name: &'static str, allowed: &'static [CapabilityScope], call: F) -> HostFn
where
    F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
{
    Arc::new(move |scope, args| {
        if !allowed.contains(&scope) {
            return futures::future::ready(Err(EngineError::CapabilityUnavailable {
                name: name.to_string(),
                scope: scope.as_str(),
            }))
            .boxed();
        }
        call(args)
    })
}

fn required<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T> {
    let value = args.get(index).cloned().ok_or_else(|| {
        EngineError::MarshallingFailed(format!("missing argument {} ({})", index, name))
    })?;
    serde_json::from_value(value).map_err(|e| {
        EngineError::MarshallingFailed(format!("argument {} ({}): {}", index, name, e))
    })
}

fn optional<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<Option<T>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            EngineError::MarshallingFailed(format!("argument {} ({}): {}", index, name, e))
        }),
    }
}

fn value_at(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

/// Inject the full capability surface into a backend. The `notify` side
/// channel is a direct-backend extra.
pub async fn install_capabilities(
    gateway: &Arc<CapabilityGateway>,
    backend: &dyn ExecutionBackend,
) -> Result<()> {
    let g = Arc::clone(gateway);
    backend
        .inject(
            names::GET_VIEW,
            scoped(names::GET_VIEW, ACTION_AND_VIEW, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let name: String = required(&args, 0, "view name")?;
                    g.get_view(&name, value_at(&args, 1)).await
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::GET_AGGREGATION,
            scoped(names::GET_AGGREGATION, VIEW_ONLY, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let name: String = required(&args, 0, "aggregation name")?;
                    let tags: Option<BTreeMap<String, String>> = optional(&args, 1, "tags")?;
                    g.get_aggregation(&name, tags.unwrap_or_default()).await
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::PUSH_EVENT,
            scoped(names::PUSH_EVENT, ACTION_ONLY, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let event_type: String = required(&args, 0, "event type")?;
                    let payload = value_at(&args, 1);
                    let meta: Option<EventMeta> = optional(&args, 2, "metadata")?;
                    g.push_event(&event_type, payload, meta.unwrap_or_default())
                        .await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::FETCH,
            scoped(names::FETCH, ACTION_ONLY, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let url: String = required(&args, 0, "url")?;
                    let init: Option<FetchInit> = optional(&args, 1, "init")?;
                    let mode: Option<String> = optional(&args, 2, "parse mode")?;
                    g.fetch(
                        &url,
                        init.unwrap_or_default(),
                        FetchParse::from_mode(mode.as_deref()),
                    )
                    .await
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::SCHEDULE_ACTION,
            scoped(names::SCHEDULE_ACTION, ACTION_ONLY, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let action_key: String = required(&args, 0, "action key")?;
                    let params = value_at(&args, 1);
                    let run_at: DateTime<Utc> = required(&args, 2, "run at")?;
                    let options: Option<SchedulerOptions> = optional(&args, 3, "options")?;
                    let key = g.schedule_action(&action_key, params, run_at, options).await?;
                    Ok(Value::String(key))
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::UNSCHEDULE_ACTION,
            scoped(names::UNSCHEDULE_ACTION, ACTION_ONLY, move |args| {
                let g = Arc::clone(&g);
                async move {
                    let job_key: String = required(&args, 0, "job key")?;
                    g.unschedule_action(&job_key).await?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        )
        .await?;

    let g = Arc::clone(gateway);
    backend
        .inject(
            names::CREATE_RESOURCE,
            scoped(names::CREATE_RESOURCE, ACTION_ONLY, move |_args| {
                let g = Arc::clone(&g);
                async move { Ok(Value::String(g.create_resource().await?)) }.boxed()
            }),
        )
        .await?;

    if backend.kind() == BackendKind::Direct {
        let g = Arc::clone(gateway);
        backend
            .inject(
                names::NOTIFY,
                scoped(names::NOTIFY, ACTION_ONLY, move |args| {
                    let g = Arc::clone(&g);
                    async move {
                        let message: String = required(&args, 0, "message")?;
                        g.notify(&message).await?;
                        Ok(Value::Null)
                    }
                    .boxed()
                }),
            )
            .await?;
    }

    Ok(())
}

/// Typed convenience surface over [`AgentContext::call`] for natively
/// defined agents. Mirrors the capability names one-to-one.
impl AgentContext {
    pub async fn get_view(&self, name: &str, params: Value) -> Result<Value> {
        self.call(names::GET_VIEW, vec![Value::String(name.to_string()), params])
            .await
    }

    pub async fn get_aggregation(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Value> {
        self.call(
            names::GET_AGGREGATION,
            vec![Value::String(name.to_string()), to_value(&tags)?],
        )
        .await
    }

    pub async fn push_event(
        &self,
        event_type: &str,
        payload: Value,
        meta: EventMeta,
    ) -> Result<()> {
        self.call(
            names::PUSH_EVENT,
            vec![Value::String(event_type.to_string()), payload, to_value(&meta)?],
        )
        .await
        .map(|_| ())
    }

    pub async fn fetch(&self, url: &str, init: FetchInit, parse_mode: &str) -> Result<Value> {
        self.call(
            names::FETCH,
            vec![
                Value::String(url.to_string()),
                to_value(&init)?,
                Value::String(parse_mode.to_string()),
            ],
        )
        .await
    }

    pub async fn schedule_action(
        &self,
        action_key: &str,
        params: Value,
        run_at: DateTime<Utc>,
        options: Option<SchedulerOptions>,
    ) -> Result<String> {
        let key = self
            .call(
                names::SCHEDULE_ACTION,
                vec![
                    Value::String(action_key.to_string()),
                    params,
                    to_value(&run_at)?,
                    options.map(|o| to_value(&o)).transpose()?.unwrap_or(Value::Null),
                ],
            )
            .await?;
        serde_json::from_value(key)
            .map_err(|e| EngineError::MarshallingFailed(format!("job key: {}", e)))
    }

    pub async fn unschedule_action(&self, job_key: &str) -> Result<()> {
        self.call(
            names::UNSCHEDULE_ACTION,
            vec![Value::String(job_key.to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn create_resource(&self) -> Result<String> {
        let id = self.call(names::CREATE_RESOURCE, vec![]).await?;
        serde_json::from_value(id)
            .map_err(|e| EngineError::MarshallingFailed(format!("resource id: {}", e)))
    }

    pub async fn notify(&self, message: &str) -> Result<()> {
        self.call(names::NOTIFY, vec![Value::String(message.to_string())])
            .await
            .map(|_| ())
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::MarshallingFailed(e.to_string()))
}
