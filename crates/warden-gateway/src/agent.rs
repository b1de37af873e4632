use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use warden_core::{ChatMessage, ModelClient, Role, ToolCall, ToolDefinition, truncate_chars};
use warden_memory::MemoryStore;
use warden_tools::{AuditRecorder, PolicyEngine, ToolContext, ToolRegistry, canonical_json};

use crate::instructions::Instructions;

pub const FALLBACK_REPLY: &str =
    "I reached the maximum number of reasoning steps. Please try a simpler request.";
const PROGRESS_PREVIEW_CHARS: usize = 200;

/// One executed or rejected tool invocation, as reported to a front end.
#[derive(Debug, Clone)]
pub struct ProgressStep {
    pub tool_name: String,
    pub arguments: String,
    pub result: String,
    pub allowed: bool,
}

/// Best-effort observer of tool steps. Errors and panics are logged and discarded.
pub trait ProgressSink: Send + Sync {
    fn on_step(&self, step: &ProgressStep) -> Result<()>;
}

/// Policy engine and audit trail shared by the top-level loop and its subagents.
#[derive(Clone)]
pub struct Governance {
    pub policy: Arc<PolicyEngine>,
    pub audit: AuditRecorder,
}

#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub memory_window: usize,
}

pub(crate) enum TurnOutcome {
    Final(String),
    Exhausted { last_text: Option<String> },
}

pub(crate) struct TurnResult {
    pub outcome: TurnOutcome,
    pub tools_used: Vec<String>,
}

/// Drives model calls and governed tool dispatch for a single conversation.
pub(crate) struct Turn<'a> {
    pub model: &'a dyn ModelClient,
    pub registry: &'a ToolRegistry,
    pub governance: &'a Governance,
    pub ctx: &'a ToolContext,
    pub progress: Option<&'a dyn ProgressSink>,
}

impl Turn<'_> {
    pub async fn run(
        &self,
        mut conversation: Vec<ChatMessage>,
        max_iterations: usize,
    ) -> Result<TurnResult> {
        let definitions: Vec<ToolDefinition> = self.registry.definitions();
        let tools = (!definitions.is_empty()).then_some(definitions.as_slice());
        let mut tools_used: Vec<String> = Vec::new();
        let mut last_text: Option<String> = None;

        for iteration in 1..=max_iterations {
            tracing::debug!(session = %self.ctx.session_key, iteration, max_iterations, "model call");
            let response = self.model.chat(&conversation, tools).await?;
            // Only the most recent response counts when the ceiling is hit.
            last_text = response
                .content
                .clone()
                .filter(|text| !text.trim().is_empty());

            if response.tool_calls.is_empty() {
                return Ok(TurnResult {
                    outcome: TurnOutcome::Final(response.content.unwrap_or_default()),
                    tools_used,
                });
            }

            conversation.push(ChatMessage::assistant_with_calls(
                response.content.unwrap_or_default(),
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let (result, executed) = self.invoke(&call).await?;
                if executed && !tools_used.contains(&call.name) {
                    tools_used.push(call.name.clone());
                }
                conversation.push(ChatMessage::tool_result(call.id, result));
            }
        }

        Ok(TurnResult {
            outcome: TurnOutcome::Exhausted { last_text },
            tools_used,
        })
    }

    /// Pre-check, dispatch, audit and report one call. Returns the result text and whether the
    /// tool actually ran.
    async fn invoke(&self, call: &ToolCall) -> Result<(String, bool)> {
        let verdict = self
            .governance
            .policy
            .pre_check(&call.name, &call.arguments);
        let result = if verdict.allowed {
            self.registry
                .execute(&call.name, call.arguments.clone(), self.ctx)
                .await
        } else {
            format!(
                "[BLOCKED] {}",
                verdict.reason.as_deref().unwrap_or("rejected by policy")
            )
        };

        self.governance.audit.record(
            Some(&self.ctx.session_key),
            &call.name,
            &call.arguments,
            &result,
            &verdict,
        )?;

        if let Some(sink) = self.progress {
            let step = ProgressStep {
                tool_name: call.name.clone(),
                arguments: truncate_chars(
                    &canonical_json(&call.arguments).unwrap_or_else(|| call.arguments.to_string()),
                    PROGRESS_PREVIEW_CHARS,
                ),
                result: truncate_chars(&result, PROGRESS_PREVIEW_CHARS),
                allowed: verdict.allowed,
            };
            notify(sink, &step);
        }
        Ok((result, verdict.allowed))
    }
}

fn notify(sink: &dyn ProgressSink, step: &ProgressStep) {
    match catch_unwind(AssertUnwindSafe(|| sink.on_step(step))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(tool = %step.tool_name, error = %err, "progress sink failed");
        }
        Err(_) => {
            tracing::warn!(tool = %step.tool_name, "progress sink panicked");
        }
    }
}

/// Top-level orchestration loop: loads history, runs a governed turn and persists the
/// final user/assistant pair.
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    registry: ToolRegistry,
    governance: Governance,
    instructions: Arc<Instructions>,
    store: Arc<MemoryStore>,
    workspace: PathBuf,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: ToolRegistry,
        governance: Governance,
        instructions: Arc<Instructions>,
        store: Arc<MemoryStore>,
        workspace: PathBuf,
        settings: AgentSettings,
    ) -> Self {
        Self {
            model,
            registry,
            governance,
            instructions,
            store,
            workspace,
            settings,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub async fn process(
        &self,
        message: &str,
        session_key: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<String> {
        let ctx = ToolContext::for_session(session_key, self.workspace.clone());
        self.process_with_context(message, ctx, progress).await
    }

    pub async fn process_with_context(
        &self,
        message: &str,
        ctx: ToolContext,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<String> {
        let history = self
            .store
            .get_history(&ctx.session_key, self.settings.memory_window)?;
        let system = self.instructions.system_prompt(
            &self.registry.names(),
            &ctx.workspace,
            Utc::now(),
        );

        let mut conversation = Vec::with_capacity(history.len() + 2);
        conversation.push(ChatMessage::system(system));
        conversation.extend(history.into_iter().filter_map(|stored| {
            Role::parse(&stored.role).map(|role| ChatMessage::new(role, stored.content))
        }));
        conversation.push(ChatMessage::user(message));

        let turn = Turn {
            model: self.model.as_ref(),
            registry: &self.registry,
            governance: &self.governance,
            ctx: &ctx,
            progress,
        };
        let result = turn.run(conversation, self.settings.max_iterations).await?;
        let reply = match result.outcome {
            TurnOutcome::Final(text) => text,
            TurnOutcome::Exhausted { last_text } => {
                tracing::warn!(
                    session = %ctx.session_key,
                    max_iterations = self.settings.max_iterations,
                    "iteration ceiling reached"
                );
                last_text.unwrap_or_else(|| FALLBACK_REPLY.to_string())
            }
        };

        self.store
            .add_message(&ctx.session_key, Role::User, message, None)?;
        self.store.add_message(
            &ctx.session_key,
            Role::Assistant,
            &reply,
            Some(result.tools_used.as_slice()),
        )?;
        tracing::info!(
            session = %ctx.session_key,
            tools = result.tools_used.len(),
            "turn complete"
        );
        Ok(reply)
    }
}
