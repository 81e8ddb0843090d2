// src/agent/agent.rs
//! Agent composition root
//!
//! Wires one loaded agent together: execution backend (chosen at load
//! time), manifest, capability gateway, aggregation engine, log and job
//! manager references. External callers reach the agent only through
//! `run_action`/`get_view`/`run_automation`/`get_aggregation`.

use crate::aggregation::engine::Aggregator;
use crate::boundary::backend::{
    AgentManifest, BoundaryArg, EntryPoint, ExecutionBackend,
};
use crate::boundary::direct::{AgentDefinition, DirectBackend};
use crate::boundary::isolated::{IsolatedBackend, IsolatedConfig};
use crate::gateway::capability::{install_capabilities, CapabilityGateway, ViewHost};
use crate::gateway::domain_policy::DomainPolicy;
use crate::gateway::fetch::Fetcher;
use crate::log::contract::UniversalLog;
use crate::scheduler::job_manager::JobManager;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EntryKind, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Where the agent's code comes from.
pub enum AgentSource {
    /// Natively defined handlers, hosted in-process.
    Module(AgentDefinition),

    /// A code bundle hosted out-of-process.
    Isolated(IsolatedConfig),

    /// A pre-built backend (embedder-managed transport or strategy).
    Backend(Arc<dyn ExecutionBackend>),
}

/// Everything needed to load one agent.
pub struct AgentSetup {
    pub agent_id: String,
    pub source: AgentSource,
    pub log: Arc<dyn UniversalLog>,
    pub job_manager: Arc<dyn JobManager>,

    /// Hosts this agent may fetch from. Immutable after load.
    pub allowed_domains: Vec<String>,

    pub config: EngineConfig,
}

struct AgentInner {
    agent_id: String,
    manifest: AgentManifest,
    backend: Arc<dyn ExecutionBackend>,
    log: Arc<dyn UniversalLog>,
    aggregator: Aggregator,
}

impl AgentInner {
    async fn run_entry(&self, entry: EntryPoint, params: Value) -> Result<Value> {
        self.manifest.resolve(entry.kind(), entry.name())?;
        self.backend
            .invoke(&entry, vec![BoundaryArg::Value(params)])
            .await
    }
}

#[async_trait]
impl ViewHost for AgentInner {
    async fn view(&self, name: &str, params: Value) -> Result<Value> {
        self.run_entry(EntryPoint::view(name), params).await
    }

    async fn aggregation(&self, name: &str, tags: BTreeMap<String, String>) -> Result<Value> {
        self.manifest.resolve(EntryKind::Aggregation, name)?;
        self.aggregator
            .run(
                self.backend.as_ref(),
                self.log.as_ref(),
                &self.agent_id,
                name,
                tags,
            )
            .await
    }
}

/// A loaded agent instance.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Load an agent: select the backend, read the manifest once, and
    /// install the capability gateway.
    pub async fn initialize(setup: AgentSetup) -> Result<Self> {
        let backend: Arc<dyn ExecutionBackend> = match setup.source {
            AgentSource::Module(definition) => Arc::new(DirectBackend::new(definition)),
            AgentSource::Isolated(config) => Arc::new(IsolatedBackend::launch(config)?),
            AgentSource::Backend(backend) => backend,
        };

        let manifest = backend.describe().await?;

        info!(
            agent_id = %setup.agent_id,
            name = %manifest.name,
            actions = manifest.actions.len(),
            views = manifest.views.len(),
            "Agent loaded"
        );

        let inner = Arc::new(AgentInner {
            agent_id: setup.agent_id.clone(),
            manifest,
            backend,
            log: Arc::clone(&setup.log),
            aggregator: Aggregator::new(),
        });

        let host = Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn ViewHost>));
        let gateway = Arc::new(CapabilityGateway::new(
            setup.agent_id,
            setup.log,
            setup.job_manager,
            Fetcher::new(
                DomainPolicy::new(setup.allowed_domains),
                setup.config.fetch.timeout_secs,
            )?,
            host,
        ));

        install_capabilities(&gateway, inner.backend.as_ref()).await?;

        Ok(Self { inner })
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn manifest(&self) -> &AgentManifest {
        &self.inner.manifest
    }

    /// Run a registered action with the full capability surface.
    pub async fn run_action(&self, name: &str, params: Value) -> Result<Value> {
        self.inner
            .run_entry(EntryPoint::action(name), params)
            .await
    }

    /// Evaluate a registered view (read-side capabilities only).
    pub async fn get_view(&self, name: &str, params: Value) -> Result<Value> {
        self.inner.view(name, params).await
    }

    /// Run a registered automation. Results are discarded.
    pub async fn run_automation(&self, name: &str, params: Value) -> Result<()> {
        self.inner
            .run_entry(EntryPoint::automation(name), params)
            .await?;
        Ok(())
    }

    /// Host-side aggregation read, without going through a view.
    pub async fn get_aggregation(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Value> {
        self.inner.aggregation(name, tags).await
    }

    /// Release execution-backend resources. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.backend.dispose().await
    }
}
