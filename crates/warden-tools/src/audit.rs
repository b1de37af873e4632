use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use warden_core::{Verdict, truncate_chars};
use warden_memory::{AuditRecord, MemoryStore, NewAuditEntry};

use crate::policy::canonical_json;

pub const MAX_AUDIT_RESULT_CHARS: usize = 2000;

/// Appends one audit row per tool invocation, allowed or blocked.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<MemoryStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn record(
        &self,
        session_key: Option<&str>,
        tool_name: &str,
        args: &Value,
        result: &str,
        verdict: &Verdict,
    ) -> Result<()> {
        // Non-object arguments are stored as-is so the rejected input stays visible.
        let arguments = canonical_json(args).unwrap_or_else(|| args.to_string());
        let result = truncate_chars(result, MAX_AUDIT_RESULT_CHARS);
        self.store
            .append_audit(&NewAuditEntry {
                session_key,
                tool_name,
                arguments: &arguments,
                result: &result,
                verdict: verdict.as_str(),
                reason: verdict.reason.as_deref(),
            })
            .context("audit append failed")?;
        Ok(())
    }

    pub fn recent(&self, session_key: Option<&str>, limit: usize) -> Result<Vec<AuditRecord>> {
        self.store.list_audit(session_key, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn results_are_truncated_and_arguments_canonical() {
        let tmp = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::open(&tmp.path().join("warden.db")).expect("store"));
        let recorder = AuditRecorder::new(store);

        let long = "é".repeat(MAX_AUDIT_RESULT_CHARS + 50);
        recorder
            .record(
                Some("cli:direct"),
                "read_file",
                &json!({"path": "a.txt", "limit": 5}),
                &long,
                &Verdict::allow(),
            )
            .expect("record allowed");
        recorder
            .record(
                None,
                "exec_cmd",
                &json!({"command": "rm -rf /"}),
                "[BLOCKED] destructive",
                &Verdict::block("destructive"),
            )
            .expect("record blocked");

        let rows = recorder.recent(None, 10).expect("recent");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].verdict, "blocked");
        assert_eq!(rows[0].reason.as_deref(), Some("destructive"));
        assert_eq!(rows[1].result.chars().count(), MAX_AUDIT_RESULT_CHARS);
        assert_eq!(rows[1].arguments, r#"{"limit":5,"path":"a.txt"}"#);

        let scoped = recorder.recent(Some("cli:direct"), 10).expect("scoped");
        assert_eq!(scoped.len(), 1);
    }
}
