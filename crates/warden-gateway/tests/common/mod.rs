#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use warden_common::WardenConfig;
use warden_core::{ChatMessage, ModelClient, ModelResponse, ToolCall, ToolDefinition};
use warden_gateway::{DeliverySink, WardenRuntime};

/// Observed model call: the conversation it saw and the tool names it was offered.
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub conversation: Vec<ChatMessage>,
    pub tools: Option<Vec<String>>,
}

/// Replays canned responses in order, then answers "done".
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelResponse>>,
    seen: Mutex<Vec<SeenCall>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<ModelResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelResponse> {
        self.seen.lock().map_err(|_| anyhow!("poisoned"))?.push(SeenCall {
            conversation: messages.to_vec(),
            tools: tools.map(|defs| defs.iter().map(|d| d.name.clone()).collect()),
        });
        let next = self.script.lock().map_err(|_| anyhow!("poisoned"))?.pop_front();
        Ok(next.unwrap_or_else(|| ModelResponse::text("done")))
    }
}

/// Requests the same tool on every call, never producing a final answer.
pub struct LoopingModel {
    pub calls: AtomicUsize,
    pub content: Option<String>,
    pub tool: String,
    pub arguments: Value,
}

impl LoopingModel {
    pub fn new(content: Option<&str>, tool: &str, arguments: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            content: content.map(str::to_string),
            tool: tool.to_string(),
            arguments,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for LoopingModel {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ModelResponse::with_calls(
            self.content.clone(),
            vec![ToolCall::new(format!("call_{n}"), self.tool.clone(), self.arguments.clone())],
        ))
    }
}

#[derive(Default)]
pub struct CollectingDelivery {
    pub delivered: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DeliverySink for CollectingDelivery {
    async fn deliver(&self, chat_id: &str, text: &str) -> Result<()> {
        self.delivered
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

pub fn test_config(root: &Path) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.workspace_dir = root.join("workspace");
    config.db_path = root.join("warden.db");
    config.constitution_path = None;
    config.laws_dir = None;
    config.skills_dir = None;
    config
}

pub fn runtime(root: &Path, model: Arc<dyn ModelClient>) -> WardenRuntime {
    WardenRuntime::build(test_config(root), model).expect("runtime should build")
}

pub fn call(id: &str, tool: &str, arguments: Value) -> ModelResponse {
    ModelResponse::with_calls(None, vec![ToolCall::new(id, tool, arguments)])
}
