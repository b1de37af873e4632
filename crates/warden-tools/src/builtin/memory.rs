use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use warden_memory::MemoryStore;

use crate::{CapabilityClass, Tool, ToolContext, required_str, str_arg};

const LIST_PREVIEW_CHARS: usize = 200;

/// Key-value memory scoped to the caller's namespace. The namespace comes from the
/// [`ToolContext`], never from the model's arguments.
pub struct ManageMemoryTool {
    store: Arc<MemoryStore>,
}

impl ManageMemoryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ManageMemoryTool {
    fn name(&self) -> &str {
        "manage_memory"
    }

    fn description(&self) -> &str {
        "Persist key-value notes across runs. Actions: get, set, list, delete. Scope is chosen automatically."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["get", "set", "list", "delete"]},
                "key": {"type": "string", "description": "Memory key (get/set/delete)."},
                "value": {"type": "string", "description": "Value to store (set). Use JSON for structured data."}
            },
            "required": ["action"]
        })
    }

    fn capability(&self) -> CapabilityClass {
        CapabilityClass::System
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String> {
        let namespace = ctx.memory_namespace.as_str();
        let key = str_arg(&args, "key").unwrap_or("").trim();
        match required_str(&args, "action")? {
            "list" => {
                let entries = self.store.memory_list(namespace)?;
                if entries.is_empty() {
                    return Ok("No memory entries.".to_string());
                }
                Ok(entries
                    .iter()
                    .map(|entry| {
                        format!(
                            "- {}: {}",
                            entry.name,
                            warden_core::truncate_chars(&entry.value, LIST_PREVIEW_CHARS)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "get" => {
                if key.is_empty() {
                    bail!("'key' is required for get");
                }
                Ok(self
                    .store
                    .memory_get(namespace, key)?
                    .unwrap_or_else(|| format!("Key '{key}' not found.")))
            }
            "set" => {
                let value = str_arg(&args, "value").unwrap_or("");
                if key.is_empty() || value.is_empty() {
                    bail!("'key' and 'value' are required for set");
                }
                self.store.memory_set(namespace, key, value)?;
                tracing::debug!(namespace, key, "memory saved");
                Ok(format!("Saved '{key}'."))
            }
            "delete" => {
                if key.is_empty() {
                    bail!("'key' is required for delete");
                }
                if self.store.memory_delete(namespace, key)? {
                    Ok(format!("Deleted '{key}'."))
                } else {
                    Ok(format!("Key '{key}' not found."))
                }
            }
            other => bail!("unknown action '{other}'"),
        }
    }
}

/// Full entries of a namespace rendered as a bullet list, empty when there are none.
pub fn namespace_digest(store: &MemoryStore, namespace: &str) -> Result<String> {
    let entries = store.memory_list(namespace)?;
    Ok(entries
        .iter()
        .map(|entry| format!("- {}: {}", entry.name, entry.value))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_is_scoped_by_context_namespace() {
        let tmp = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::open(&tmp.path().join("warden.db")).expect("store"));
        let tool = ManageMemoryTool::new(store.clone());
        let job_ctx = ToolContext::for_session("cron:abc:1", tmp.path().to_path_buf());
        let user_ctx = ToolContext::for_session("telegram:5", tmp.path().to_path_buf());

        tool.execute(&job_ctx, json!({"action": "set", "key": "last", "value": "42"}))
            .await
            .expect("set");
        let from_user = tool
            .execute(&user_ctx, json!({"action": "get", "key": "last"}))
            .await
            .expect("get other namespace");
        assert_eq!(from_user, "Key 'last' not found.");

        let from_job = tool
            .execute(&job_ctx, json!({"action": "get", "key": "last"}))
            .await
            .expect("get");
        assert_eq!(from_job, "42");
        assert_eq!(namespace_digest(&store, "job:abc").expect("digest"), "- last: 42");

        let err = tool
            .execute(&job_ctx, json!({"action": "explode"}))
            .await
            .expect_err("unknown action");
        assert!(err.to_string().contains("explode"));
    }
}
