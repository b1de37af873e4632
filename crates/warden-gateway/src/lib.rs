use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use warden_common::WardenConfig;
use warden_common::path_guard::canonicalize_existing_dir;
use warden_core::{ApprovalLedger, ApprovalStatus, ModelClient};
use warden_memory::MemoryStore;
use warden_tools::builtin::{namespace_digest, standard_tools};
use warden_tools::{AuditRecorder, PolicyEngine, ToolContext, ToolRegistry};

pub mod agent;
pub mod instructions;
pub mod llm;
pub mod scheduler;
pub mod subagent;
pub mod tools;

pub use agent::{AgentLoop, AgentSettings, FALLBACK_REPLY, Governance, ProgressSink, ProgressStep};
pub use instructions::Instructions;
pub use llm::OpenAiCompatClient;
pub use scheduler::{CronService, JobHandler};
pub use subagent::{SUBAGENT_EXHAUSTED_REPLY, SUBAGENT_MAX_ITERATIONS, SubagentSpawner};
pub use tools::{ManageCronTool, SpawnSubagentTool};

const SYSTEM_ACTOR: &str = "system";

/// Where scheduled results go once a job's turn completes.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Fully wired runtime: store, governance, tools, agent loop and scheduler.
pub struct WardenRuntime {
    config: WardenConfig,
    workspace: PathBuf,
    store: Arc<MemoryStore>,
    policy: Arc<PolicyEngine>,
    audit: AuditRecorder,
    agent: Arc<AgentLoop>,
    cron: Arc<CronService>,
}

impl WardenRuntime {
    /// Builds the runtime against the configured OpenAI-compatible endpoint.
    pub fn from_config(config: WardenConfig) -> Result<Self> {
        let model: Arc<dyn ModelClient> = Arc::new(OpenAiCompatClient::from_config(&config.model)?);
        Self::build(config, model)
    }

    pub fn build(config: WardenConfig, model: Arc<dyn ModelClient>) -> Result<Self> {
        fs::create_dir_all(&config.workspace_dir).with_context(|| {
            format!(
                "failed to create workspace {}",
                config.workspace_dir.display()
            )
        })?;
        let workspace = canonicalize_existing_dir(&config.workspace_dir)?;
        let store = Arc::new(MemoryStore::open(&config.db_path)?);
        let cron = Arc::new(CronService::new(
            Arc::clone(&store),
            Duration::from_secs(config.scheduler.tick_secs.max(1)),
        ));

        let mut registry = ToolRegistry::new();
        for tool in standard_tools(Arc::clone(&store), &config.security) {
            registry.register(tool);
        }
        registry.register(Arc::new(ManageCronTool::new(
            Arc::clone(&cron),
            config.scheduler.min_interval_secs,
        )));

        let ledger: Arc<dyn ApprovalLedger> = store.clone();
        let policy = Arc::new(
            PolicyEngine::new(ledger, workspace.clone())?
                .with_contained_tools(registry.filesystem_tool_names()),
        );
        let audit = AuditRecorder::new(Arc::clone(&store));
        let governance = Governance {
            policy: Arc::clone(&policy),
            audit: audit.clone(),
        };
        let instructions = Arc::new(Instructions::load(&config));

        let spawner = Arc::new(SubagentSpawner::new(
            Arc::clone(&model),
            &registry,
            governance.clone(),
            Arc::clone(&instructions),
        ));
        registry.register(Arc::new(SpawnSubagentTool::new(spawner)));

        for def in registry.definitions() {
            policy.register(&def.name, &def.description)?;
            if config.security.auto_approve_builtin
                && store.tool_status(&def.name)? == ApprovalStatus::Pending
            {
                policy.approve(&def.name, Some(SYSTEM_ACTOR))?;
            }
        }

        let agent = Arc::new(AgentLoop::new(
            model,
            registry,
            governance,
            instructions,
            Arc::clone(&store),
            workspace.clone(),
            AgentSettings {
                max_iterations: config.agent.max_iterations,
                memory_window: config.agent.memory_window,
            },
        ));
        tracing::info!(
            workspace = %workspace.display(),
            tools = agent.registry().len(),
            "runtime ready"
        );

        Ok(Self {
            config,
            workspace,
            store,
            policy,
            audit,
            agent,
            cron,
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    pub fn cron(&self) -> &Arc<CronService> {
        &self.cron
    }

    /// Starts the tick loop when the scheduler is enabled.
    pub fn start_scheduler(&self, delivery: Arc<dyn DeliverySink>) -> Option<JoinHandle<()>> {
        if !self.config.scheduler.enabled {
            tracing::info!("scheduler disabled by configuration");
            return None;
        }
        let handler: Arc<dyn JobHandler> = Arc::new(AgentJobHandler {
            agent: Arc::clone(&self.agent),
            store: Arc::clone(&self.store),
            delivery,
        });
        Some(self.cron.start(handler))
    }
}

/// Runs a due job as an agent turn in the job's own memory namespace and delivers the reply.
pub struct AgentJobHandler {
    agent: Arc<AgentLoop>,
    store: Arc<MemoryStore>,
    delivery: Arc<dyn DeliverySink>,
}

impl AgentJobHandler {
    pub fn new(
        agent: Arc<AgentLoop>,
        store: Arc<MemoryStore>,
        delivery: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            agent,
            store,
            delivery,
        }
    }
}

#[async_trait]
impl JobHandler for AgentJobHandler {
    async fn run_job(&self, job_id: &str, message: &str, chat_id: &str) -> Result<Option<String>> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let session_key = format!("cron:{job_id}:{}", &nonce[..8]);
        let ctx = ToolContext::for_session(&session_key, self.agent.workspace().clone())
            .with_chat_id(chat_id);

        let digest = namespace_digest(&self.store, &ctx.memory_namespace)?;
        let prompt = if digest.is_empty() {
            message.to_string()
        } else {
            format!("{message}\n\n[Memory from previous runs]\n{digest}")
        };

        let reply = self.agent.process_with_context(&prompt, ctx, None).await?;
        self.delivery
            .deliver(chat_id, &reply)
            .await
            .with_context(|| format!("failed to deliver result of job {job_id}"))?;
        Ok(Some(reply))
    }
}
