use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use warden_core::{ChatMessage, ModelClient};
use warden_tools::{ToolContext, ToolRegistry};

use crate::agent::{Governance, Turn, TurnOutcome};
use crate::instructions::Instructions;

pub const SUBAGENT_TOOL_NAME: &str = "spawn_subagent";
pub const SUBAGENT_MAX_ITERATIONS: usize = 5;
pub const SUBAGENT_EXHAUSTED_REPLY: &str =
    "Subagent reached iteration limit without a final answer.";

/// Runs single-task workers that share governance with the parent but keep no transcript.
pub struct SubagentSpawner {
    model: Arc<dyn ModelClient>,
    registry: ToolRegistry,
    governance: Governance,
    instructions: Arc<Instructions>,
}

impl SubagentSpawner {
    /// `registry` is reduced to exclude the delegation tool itself.
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: &ToolRegistry,
        governance: Governance,
        instructions: Arc<Instructions>,
    ) -> Self {
        Self {
            model,
            registry: registry.without(SUBAGENT_TOOL_NAME),
            governance,
            instructions,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Audit rows are written under the parent's session key carried by `parent`.
    pub async fn spawn(&self, task: &str, parent: &ToolContext) -> Result<String> {
        tracing::info!(parent = %parent.session_key, "spawning subagent");
        let system = self.instructions.system_prompt(
            &self.registry.names(),
            &parent.workspace,
            Utc::now(),
        );
        let conversation = vec![ChatMessage::system(system), ChatMessage::user(task)];
        let turn = Turn {
            model: self.model.as_ref(),
            registry: &self.registry,
            governance: &self.governance,
            ctx: parent,
            progress: None,
        };
        let result = turn.run(conversation, SUBAGENT_MAX_ITERATIONS).await?;
        Ok(match result.outcome {
            TurnOutcome::Final(text) => text,
            TurnOutcome::Exhausted { .. } => SUBAGENT_EXHAUSTED_REPLY.to_string(),
        })
    }
}
