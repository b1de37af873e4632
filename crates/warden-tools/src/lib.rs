use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod audit;
pub mod builtin;
pub mod policy;
pub mod registry;

pub use audit::AuditRecorder;
pub use policy::{PolicyEngine, canonical_json};
pub use registry::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityClass {
    Read,
    Write,
    Exec,
    Net,
    System,
}

impl CapabilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exec => "exec",
            Self::Net => "net",
            Self::System => "system",
        }
    }

    /// Classes whose arguments can name filesystem locations.
    pub fn touches_filesystem(&self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::Exec)
    }
}

/// Per-call execution context. Built fresh for every invocation so concurrent sessions never
/// observe each other's namespace or delivery target.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_key: String,
    pub chat_id: String,
    pub memory_namespace: String,
    pub workspace: PathBuf,
}

impl ToolContext {
    /// Derives chat id and memory namespace from the session key.
    pub fn for_session(session_key: &str, workspace: PathBuf) -> Self {
        Self {
            session_key: session_key.to_string(),
            chat_id: session_key.to_string(),
            memory_namespace: memory_namespace_for(session_key),
            workspace,
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }
}

/// `cron:<job>:<nonce>` maps to `job:<job>`, `<channel>:<id>[:...]` to `user:<id>`,
/// anything else to `global`.
pub fn memory_namespace_for(session_key: &str) -> String {
    let mut parts = session_key.split(':');
    match (parts.next(), parts.next()) {
        (Some("cron"), Some(job_id)) if !job_id.is_empty() => format!("job:{job_id}"),
        (Some(channel), Some(id)) if !channel.is_empty() && !id.is_empty() => {
            format!("user:{id}")
        }
        _ => "global".to_string(),
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments object.
    fn parameters(&self) -> Value;

    fn capability(&self) -> CapabilityClass;

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String>;
}

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    str_arg(args, key).ok_or_else(|| anyhow::anyhow!("missing required string argument '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_follow_session_shape() {
        assert_eq!(memory_namespace_for("cron:abc123:9f"), "job:abc123");
        assert_eq!(memory_namespace_for("telegram:4242"), "user:4242");
        assert_eq!(memory_namespace_for("cli:direct:extra"), "user:direct");
        assert_eq!(memory_namespace_for("standalone"), "global");
        assert_eq!(memory_namespace_for(":"), "global");
    }

    #[test]
    fn context_defaults_chat_to_session() {
        let ctx = ToolContext::for_session("telegram:7", PathBuf::from("/ws"));
        assert_eq!(ctx.chat_id, "telegram:7");
        let ctx = ctx.with_chat_id("telegram:8");
        assert_eq!(ctx.chat_id, "telegram:8");
        assert_eq!(ctx.memory_namespace, "user:7");
    }
}
