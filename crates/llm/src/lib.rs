//! Chat-completion client for the external LLM provider.
//!
//! The provider itself is explicitly out of scope (§1): it is treated as a
//! collaborator reached only through its wire interface. That interface is
//! the OpenAI-compatible `/chat/completions` shape, which is also what
//! Ollama, OpenRouter, and most self-hosted gateways speak, so one client
//! covers all of them via [`LlmConfig`]'s `endpoint`/`api_key`/`model`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub use cagebox_config::LlmConfig;

/// Role in a chat conversation (§3 "Session": chat turns have role ∈
/// {system, user, assistant, tool}).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation, sent to and received from the
/// provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (only present on assistant messages).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the LLM (§3 "Tool Call").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as a JSON object; providers that send a JSON *string* here
    /// are normalized by [`parse_response`].
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// What the provider sent back for one [`LlmClient::chat`] call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// Any failure talking to the provider. The Agent Loop (C5) maps every
/// variant to stop reason `llm-error` and does not retry (§4.5, §7).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm provider unreachable: {0}")]
    Unavailable(String),
    #[error("llm provider returned status {0}: {1}")]
    ProviderError(u16, String),
    #[error("llm provider returned an unparsable response")]
    BadResponse,
}

/// Seam the Agent Loop (C5) calls through, so it can be driven in tests by
/// a fixed script of responses instead of a real network round-trip. The
/// one production implementation is [`LlmClient`].
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError>;
}

pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { client: Client::new(), config }
    }

    /// Send the current message list plus the tool schema list to the
    /// provider (§4.5 step 1). Never retries — any transport or non-2xx
    /// response becomes an `LlmError` for the caller to propagate.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError> {
        let wire_messages = messages_to_wire(messages);
        let mut payload = json!({
            "model": self.config.model,
            "messages": wire_messages,
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }

        let mut req = self.client.post(&self.config.endpoint).json(&payload);
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|_| LlmError::BadResponse)?;
        if !status.is_success() {
            return Err(LlmError::ProviderError(status.as_u16(), body.to_string()));
        }
        parse_response(&body)
    }
}

#[async_trait::async_trait]
impl ChatBackend for LlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> Result<ChatResponse, LlmError> {
        LlmClient::chat(self, messages, tools).await
    }
}

/// Convert our `ChatMessage` array to the OpenAI-compatible wire format.
fn messages_to_wire(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role });
            msg["content"] = match &m.content {
                Some(content) => json!(content),
                None => serde_json::Value::Null,
            };
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": if tc.function.arguments.is_string() {
                                    tc.function.arguments.clone()
                                } else {
                                    json!(tc.function.arguments.to_string())
                                }
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

/// Parse an OpenAI-compatible `/chat/completions` response body.
fn parse_response(body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let choice = body.get("choices").and_then(|c| c.get(0)).ok_or(LlmError::BadResponse)?;
    let message = choice.get("message").ok_or(LlmError::BadResponse)?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|v| {
                            if let Some(s) = v.as_str() {
                                serde_json::from_str(s).unwrap_or(json!({}))
                            } else {
                                v.clone()
                            }
                        })
                        .unwrap_or(json!({}));
                    Some(ToolCall {
                        id: if id.is_empty() { format!("call_{i}") } else { id },
                        r#type: "function".to_string(),
                        function: ToolCallFunction { name, arguments },
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatResponse { content, tool_calls, finish_reason })
}
