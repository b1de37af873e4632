use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use warden_core::ToolDefinition;

use crate::{CapabilityClass, Tool, ToolContext};

/// Name-keyed set of tools. Dispatch never returns an error: unknown names, tool failures and
/// tool panics all come back as text the model can read.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tool`, replacing any tool already registered under the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "replaced registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Model-facing definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Names of tools whose arguments are subject to workspace containment.
    pub fn filesystem_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|tool| tool.capability().touches_filesystem())
            .map(|tool| tool.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn capability_of(&self, name: &str) -> Option<CapabilityClass> {
        self.tools.get(name).map(|tool| tool.capability())
    }

    /// A copy of this registry without `name`. Tool instances are shared, not cloned.
    pub fn without(&self, name: &str) -> Self {
        let mut reduced = self.clone();
        reduced.tools.remove(name);
        reduced
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.get(name) else {
            tracing::warn!(tool = %name, "model requested unknown tool");
            return format!(
                "Error: unknown tool '{name}'. Available tools: {}",
                self.names().join(", ")
            );
        };

        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { tool.execute(&task_ctx, args).await });
        match handle.await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                tracing::warn!(tool = %name, error = %err, "tool execution failed");
                format!("Error: {err:#}")
            }
            Err(join_err) => {
                tracing::error!(tool = %name, error = %join_err, "tool task aborted");
                if join_err.is_panic() {
                    format!("Error: tool '{name}' crashed during execution")
                } else {
                    format!("Error: tool '{name}' was cancelled")
                }
            }
        }
    }
}
