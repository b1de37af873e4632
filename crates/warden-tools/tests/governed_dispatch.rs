use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use warden_common::SecurityConfig;
use warden_common::path_guard::canonicalize_existing_dir;
use warden_core::ApprovalLedger;
use warden_memory::MemoryStore;
use warden_tools::builtin::standard_tools;
use warden_tools::{AuditRecorder, PolicyEngine, ToolContext, ToolRegistry};

#[tokio::test]
async fn store_backed_policy_gates_builtin_tools() {
    let tmp = tempdir().expect("tempdir");
    let workspace = tmp.path().join("workspace");
    std::fs::create_dir_all(&workspace).expect("workspace");
    let workspace = canonicalize_existing_dir(&workspace).expect("canonical");
    let store = Arc::new(MemoryStore::open(&tmp.path().join("warden.db")).expect("store"));

    let mut registry = ToolRegistry::new();
    for tool in standard_tools(store.clone(), &SecurityConfig::default()) {
        registry.register(tool);
    }
    let ledger: Arc<dyn ApprovalLedger> = store.clone();
    let policy = PolicyEngine::new(ledger, workspace.clone())
        .expect("policy")
        .with_contained_tools(registry.filesystem_tool_names());
    for def in registry.definitions() {
        policy.register(&def.name, &def.description).expect("register");
    }
    let audit = AuditRecorder::new(store.clone());
    let ctx = ToolContext::for_session("cli:direct", workspace.clone());

    let write_args = json!({"path": "hello.txt", "content": "hi"});
    let pending = policy.pre_check("write_file", &write_args);
    assert!(!pending.allowed);

    policy.approve("write_file", Some("operator")).expect("approve");
    let verdict = policy.pre_check("write_file", &write_args);
    assert!(verdict.allowed);
    let output = registry.execute("write_file", write_args.clone(), &ctx).await;
    audit
        .record(Some("cli:direct"), "write_file", &write_args, &output, &verdict)
        .expect("audit");
    assert_eq!(std::fs::read_to_string(workspace.join("hello.txt")).expect("read"), "hi");

    policy.approve("exec_cmd", None).expect("approve exec");
    let outside = json!({"command": "cat /etc/passwd"});
    let blocked = policy.pre_check("exec_cmd", &outside);
    assert!(!blocked.allowed);
    assert!(
        !policy
            .pre_check("manage_memory", &json!({"action": "get", "key": "/etc/passwd"}))
            .allowed,
        "manage_memory is still pending"
    );

    let rows = audit.recent(Some("cli:direct"), 10).expect("audit rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].verdict, "allowed");
}
