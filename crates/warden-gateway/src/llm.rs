use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_common::{ModelConfig, ModelProvider};
use warden_core::{ChatMessage, ModelClient, ModelResponse, Role, ToolCall, ToolDefinition};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for any endpoint speaking the OpenAI `/chat/completions` format.
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let base_url = match (&config.provider, config.endpoint.as_deref()) {
            (_, Some(endpoint)) if !endpoint.trim().is_empty() => endpoint.trim().to_string(),
            (ModelProvider::OpenAi, _) => OPENAI_BASE_URL.to_string(),
            (provider, _) => bail!("model provider {provider:?} requires model.endpoint"),
        };
        let api_key = match config.api_key_env.as_deref() {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("environment variable {var} is not set"))?,
            ),
            None => None,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build model HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model_id.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

fn function_kind() -> String {
    "function".to_string()
}

fn to_wire(message: &ChatMessage) -> WireMessage {
    let tool_calls = (!message.tool_calls.is_empty()).then(|| {
        message
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: function_kind(),
                function: WireFunctionCall {
                    name: call.name.clone(),
                    arguments: Value::String(call.arguments.to_string()),
                },
            })
            .collect()
    });
    let content = match message.role {
        Role::Assistant if message.content.is_empty() && tool_calls.is_some() => None,
        _ => Some(message.content.clone()),
    };
    WireMessage {
        role: message.role.as_str(),
        content,
        tool_call_id: message.tool_call_id.clone(),
        tool_calls,
    }
}

/// Arguments arrive as a JSON-encoded string (OpenAI) or an inline object (some local
/// servers). Anything unparseable becomes `{}`.
fn parse_arguments(tool_name: &str, raw: Value) -> Value {
    let parsed = match raw {
        Value::String(text) if text.trim().is_empty() => Value::Object(Default::default()),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(tool = %tool_name, error = %err, "unparseable tool arguments, using {{}}");
                Value::Object(Default::default())
            }
        },
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    if parsed.is_object() {
        parsed
    } else {
        tracing::warn!(tool = %tool_name, "tool arguments are not an object, using {{}}");
        Value::Object(Default::default())
    }
}

fn from_wire(choice: Choice) -> ModelResponse {
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(idx, call)| {
            let id = if call.id.is_empty() {
                format!("call_{idx}")
            } else {
                call.id
            };
            let arguments = parse_arguments(&call.function.name, call.function.arguments);
            ToolCall::new(id, call.function.name, arguments)
        })
        .collect();
    ModelResponse {
        content: choice.message.content.filter(|text| !text.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason,
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelResponse> {
        let request = CompletionRequest {
            model: &self.model,
            messages: messages.iter().map(to_wire).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.filter(|defs| !defs.is_empty()).map(|defs| {
                defs.iter()
                    .map(|def| WireTool {
                        kind: "function",
                        function: WireFunction {
                            name: &def.name,
                            description: &def.description,
                            parameters: &def.parameters,
                        },
                    })
                    .collect()
            }),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("model request to {} failed", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "model endpoint returned {}: {}",
                status.as_u16(),
                warden_core::truncate_chars(&body, 500)
            );
        }
        let parsed: CompletionResponse = response
            .json()
            .await
            .context("model response was not valid completion JSON")?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .context("model response contained no choices")?;
        let result = from_wire(choice);
        tracing::debug!(
            model = %self.model,
            tool_calls = result.tool_calls.len(),
            finish = result.finish_reason.as_deref().unwrap_or("-"),
            "model responded"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_arguments_are_decoded_and_bad_ones_replaced() {
        assert_eq!(
            parse_arguments("x", Value::String(r#"{"a":1}"#.to_string())),
            json!({"a": 1})
        );
        assert_eq!(parse_arguments("x", Value::String("{oops".to_string())), json!({}));
        assert_eq!(parse_arguments("x", json!([1, 2])), json!({}));
        assert_eq!(parse_arguments("x", json!({"inline": true})), json!({"inline": true}));
    }

    #[test]
    fn response_choice_maps_to_model_response() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "exec_cmd", "arguments": "{\"command\":\"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let parsed: CompletionResponse = serde_json::from_value(raw).expect("parse");
        let response = from_wire(parsed.choices.into_iter().next().expect("choice"));
        assert_eq!(response.content, None);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, json!({"command": "ls"}));
    }

    #[test]
    fn assistant_call_records_serialize_arguments_as_strings() {
        let message = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall::new("c1", "read_file", json!({"path": "a"}))],
        );
        let wire = serde_json::to_value(to_wire(&message)).expect("serialize");
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            json!(r#"{"path":"a"}"#)
        );
    }
}
