mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::json;
use tempfile::tempdir;
use warden_core::{ModelClient, ModelResponse, Role, ToolCall};
use warden_gateway::{
    AgentJobHandler, AgentLoop, AgentSettings, DeliverySink, FALLBACK_REPLY, Governance,
    Instructions, JobHandler, ProgressSink, ProgressStep, SUBAGENT_EXHAUSTED_REPLY,
    SUBAGENT_MAX_ITERATIONS, SubagentSpawner,
};
use warden_memory::MemoryStore;
use warden_tools::{AuditRecorder, PolicyEngine, ToolContext, ToolRegistry};

use common::{CollectingDelivery, LoopingModel, ScriptedModel, call, runtime, test_config};

#[tokio::test]
async fn final_reply_persists_user_and_assistant_pair() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        call("c1", "write_file", json!({"path": "notes.txt", "content": "hello"})),
        call("c2", "write_file", json!({"path": "more.txt", "content": "again"})),
        ModelResponse::text("Saved both files."),
    ]));
    let rt = runtime(tmp.path(), model.clone());

    let reply = rt
        .agent()
        .process("save my notes", "cli:direct", None)
        .await
        .expect("process");
    assert_eq!(reply, "Saved both files.");
    assert!(rt.workspace().join("notes.txt").exists());

    let history = rt.store().get_history("cli:direct", 10).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "save my notes");
    assert_eq!(history[1].role, "assistant");
    assert_eq!(history[1].tools_used, Some(vec!["write_file".to_string()]));

    let audit = rt.audit().recent(Some("cli:direct"), 10).expect("audit");
    assert_eq!(audit.len(), 2);
    assert!(audit.iter().all(|row| row.verdict == "allowed"));

    let seen = model.seen();
    assert_eq!(seen.len(), 3);
    let last = seen.last().expect("last call");
    let tool_results: Vec<_> = last
        .conversation
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_results.len(), 2);
    assert_eq!(tool_results[0].tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn destructive_command_is_blocked_and_audited() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        call("c1", "exec_cmd", json!({"cmd": "rm -rf /"})),
        ModelResponse::text("That command was blocked."),
    ]));
    let rt = runtime(tmp.path(), model.clone());

    let reply = rt
        .agent()
        .process("wipe the disk", "telegram:1", None)
        .await
        .expect("process");
    assert_eq!(reply, "That command was blocked.");

    let audit = rt.audit().recent(Some("telegram:1"), 10).expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].verdict, "blocked");
    assert_eq!(audit[0].tool_name, "exec_cmd");
    assert!(audit[0].result.starts_with("[BLOCKED]"));

    let seen = model.seen();
    let tool_msg = seen[1]
        .conversation
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result");
    assert!(tool_msg.content.starts_with("[BLOCKED]"));
    assert!(!tool_msg.content.contains(r"\s"));

    let history = rt.store().get_history("telegram:1", 10).expect("history");
    assert_eq!(history[1].tools_used, None, "blocked calls are not tools used");
}

#[tokio::test]
async fn iteration_ceiling_returns_fallback() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(LoopingModel::new(None, "list_dir", json!({})));
    let mut config = test_config(tmp.path());
    config.agent.max_iterations = 3;
    let rt = warden_gateway::WardenRuntime::build(config, model.clone()).expect("runtime");

    let reply = rt
        .agent()
        .process("loop forever", "cli:direct", None)
        .await
        .expect("process");
    assert_eq!(reply, FALLBACK_REPLY);
    assert_eq!(model.calls(), 3);

    let history = rt.store().get_history("cli:direct", 10).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, FALLBACK_REPLY);
    assert_eq!(rt.audit().recent(None, 10).expect("audit").len(), 3);
}

#[tokio::test]
async fn iteration_ceiling_salvages_last_text() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(LoopingModel::new(Some("partial answer"), "list_dir", json!({})));
    let mut config = test_config(tmp.path());
    config.agent.max_iterations = 2;
    let rt = warden_gateway::WardenRuntime::build(config, model.clone()).expect("runtime");

    let reply = rt
        .agent()
        .process("keep going", "cli:direct", None)
        .await
        .expect("process");
    assert_eq!(reply, "partial answer");
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn iteration_ceiling_ignores_text_from_earlier_steps() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::with_calls(
            Some("early thought".to_string()),
            vec![ToolCall::new("c1", "list_dir", json!({}))],
        ),
        call("c2", "list_dir", json!({})),
    ]));
    let mut config = test_config(tmp.path());
    config.agent.max_iterations = 2;
    let rt = warden_gateway::WardenRuntime::build(config, model).expect("runtime");

    let reply = rt
        .agent()
        .process("two steps", "cli:direct", None)
        .await
        .expect("process");
    assert_eq!(reply, FALLBACK_REPLY);
}

struct FailingSink {
    calls: AtomicUsize,
}

impl ProgressSink for FailingSink {
    fn on_step(&self, step: &ProgressStep) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            bail!("front end went away while reporting {}", step.tool_name);
        }
        panic!("sink exploded");
    }
}

#[tokio::test]
async fn failing_progress_sink_never_aborts_the_turn() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        call("c1", "list_dir", json!({})),
        call("c2", "list_dir", json!({})),
        ModelResponse::text("listed"),
    ]));
    let rt = runtime(tmp.path(), model);
    let sink = FailingSink {
        calls: AtomicUsize::new(0),
    };

    let reply = rt
        .agent()
        .process("list twice", "cli:direct", Some(&sink))
        .await
        .expect("process");
    assert_eq!(reply, "listed");
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn history_window_is_loaded_oldest_first() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        ModelResponse::text("one"),
        ModelResponse::text("two"),
        ModelResponse::text("three"),
        ModelResponse::text("four"),
    ]));
    let mut config = test_config(tmp.path());
    config.agent.memory_window = 4;
    let rt = warden_gateway::WardenRuntime::build(config, model.clone()).expect("runtime");

    for msg in ["q1", "q2", "q3", "q4"] {
        rt.agent()
            .process(msg, "cli:direct", None)
            .await
            .expect("process");
    }

    let seen = model.seen();
    let last = &seen[3].conversation;
    assert_eq!(last[0].role, Role::System);
    let contents: Vec<&str> = last[1..].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["q2", "two", "q3", "three", "q4"]);

    let stored = rt.store().get_history("cli:direct", 4).expect("history");
    let stored: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(stored, vec!["q3", "three", "q4", "four"]);
}

fn bare_agent(tmp: &std::path::Path, model: Arc<dyn ModelClient>, registry: ToolRegistry) -> AgentLoop {
    let store = Arc::new(MemoryStore::open(&tmp.join("warden.db")).expect("store"));
    let policy = Arc::new(PolicyEngine::new(store.clone(), tmp.to_path_buf()).expect("policy"));
    let governance = Governance {
        policy,
        audit: AuditRecorder::new(store.clone()),
    };
    AgentLoop::new(
        model,
        registry,
        governance,
        Arc::new(Instructions::default()),
        store,
        PathBuf::from(tmp),
        AgentSettings {
            max_iterations: 5,
            memory_window: 10,
        },
    )
}

#[tokio::test]
async fn tool_schema_is_omitted_without_tools() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![ModelResponse::text("hi")]));
    let agent = bare_agent(tmp.path(), model.clone(), ToolRegistry::new());

    let reply = agent.process("hello", "cli:direct", None).await.expect("process");
    assert_eq!(reply, "hi");
    assert_eq!(model.seen()[0].tools, None);
}

#[tokio::test]
async fn unapproved_tools_are_rejected_without_running() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        call("c1", "write_file", json!({"path": "x.txt", "content": "x"})),
        ModelResponse::text("could not write"),
    ]));
    let mut config = test_config(tmp.path());
    config.security.auto_approve_builtin = false;
    let rt = warden_gateway::WardenRuntime::build(config, model).expect("runtime");

    rt.agent()
        .process("write", "cli:direct", None)
        .await
        .expect("process");
    assert!(!rt.workspace().join("x.txt").exists());
    let audit = rt.audit().recent(None, 10).expect("audit");
    assert_eq!(audit[0].verdict, "blocked");
    assert!(audit[0].reason.as_deref().unwrap_or("").contains("write_file"));
}

#[tokio::test]
async fn subagent_runs_without_delegation_or_transcript() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![
        call("c1", "spawn_subagent", json!({"task": "look around"})),
        call("s1", "list_dir", json!({})),
        ModelResponse::text("sub: empty workspace"),
        ModelResponse::text("The subagent says the workspace is empty."),
    ]));
    let rt = runtime(tmp.path(), model.clone());

    let reply = rt
        .agent()
        .process("delegate this", "cli:direct", None)
        .await
        .expect("process");
    assert_eq!(reply, "The subagent says the workspace is empty.");

    let seen = model.seen();
    assert_eq!(seen.len(), 4);
    let parent_tools = seen[0].tools.clone().expect("parent tools");
    assert!(parent_tools.contains(&"spawn_subagent".to_string()));
    let sub_tools = seen[1].tools.clone().expect("subagent tools");
    assert!(!sub_tools.contains(&"spawn_subagent".to_string()));
    assert_eq!(seen[1].conversation.len(), 2, "subagent starts from system + task");

    let history = rt.store().get_history("cli:direct", 10).expect("history");
    assert_eq!(history.len(), 2);

    let audit = rt.audit().recent(Some("cli:direct"), 10).expect("audit");
    let tools: Vec<&str> = audit.iter().map(|row| row.tool_name.as_str()).collect();
    assert_eq!(tools, vec!["spawn_subagent", "list_dir"]);
}

#[tokio::test]
async fn subagent_stops_at_its_own_ceiling() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(LoopingModel::new(Some("thinking"), "list_dir", json!({})));
    let rt = runtime(tmp.path(), Arc::new(ScriptedModel::default()));
    let governance = Governance {
        policy: rt.policy().clone(),
        audit: rt.audit().clone(),
    };
    let spawner = SubagentSpawner::new(
        model.clone(),
        rt.agent().registry(),
        governance,
        Arc::new(Instructions::default()),
    );

    let ctx = ToolContext::for_session("cli:parent", rt.workspace().clone());
    let reply = spawner.spawn("never finish", &ctx).await.expect("spawn");
    assert_eq!(reply, SUBAGENT_EXHAUSTED_REPLY);
    assert_eq!(model.calls(), SUBAGENT_MAX_ITERATIONS);
    assert!(rt.store().get_history("cli:parent", 10).expect("history").is_empty());
    assert_eq!(
        rt.audit().recent(Some("cli:parent"), 10).expect("audit").len(),
        SUBAGENT_MAX_ITERATIONS
    );
}

#[tokio::test]
async fn job_handler_injects_namespace_memory_and_delivers() {
    let tmp = tempdir().expect("tempdir");
    let model = Arc::new(ScriptedModel::new(vec![ModelResponse::text("BTC is up.")]));
    let rt = runtime(tmp.path(), model.clone());
    rt.store()
        .memory_set("job:abc123def456", "last_price", "100")
        .expect("seed memory");

    let delivery = Arc::new(CollectingDelivery::default());
    let sink: Arc<dyn DeliverySink> = delivery.clone();
    let handler = AgentJobHandler::new(rt.agent().clone(), rt.store().clone(), sink);
    let reply = handler
        .run_job("abc123def456", "check the price", "telegram:77")
        .await
        .expect("run job");
    assert_eq!(reply.as_deref(), Some("BTC is up."));

    let prompt = &model.seen()[0].conversation;
    let user = prompt.last().expect("user message");
    assert!(user.content.starts_with("check the price"));
    assert!(user.content.contains("- last_price: 100"));

    let delivered = delivery.delivered.lock().expect("lock").clone();
    assert_eq!(
        delivered,
        vec![("telegram:77".to_string(), "BTC is up.".to_string())]
    );
}
