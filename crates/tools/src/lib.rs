//! Tool Registry (C4): a uniform dispatch surface over {shell-exec,
//! web-fetch}, translating tool invocations into validated calls to the
//! Command Validator / Sandbox Manager / Safe Fetcher.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod builtins;
pub use builtins::{ShellExecTool, WebFetchTool};

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Static metadata about a tool, used to build the schema advertised to the
/// LLM (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// Per-call bookkeeping that rides alongside a `ToolResult` (§3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolResultMeta {
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub truncated: bool,
}

/// What a `Tool::run` call produces before the registry wraps it into a
/// `ToolResult`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    pub error_kind: Option<String>,
    #[serde(default)]
    pub meta: ToolResultMeta,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_kind: None,
            meta: ToolResultMeta::default(),
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            error_kind: Some(kind.into()),
            meta: ToolResultMeta::default(),
        }
    }
}

/// Carries the one piece of request context a tool needs beyond its
/// arguments: which conversation (and therefore which container) it runs
/// against.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
}

/// Trait implemented by every tool in the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &HashMap<String, String>, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// A tool invocation produced by the LLM (§3 "Tool Call").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: HashMap<String, String>,
}

/// Always carries the originating call's id, whatever happened (§3 "Tool
/// Result", §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    pub output: String,
    pub error_kind: Option<String>,
    pub meta: ToolResultMeta,
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    /// Validate the argument map against the tool's schema, invoke it, and
    /// wrap whatever happens into a `ToolResult` carrying the call id — this
    /// function never returns an `Err`; failures are captured, not
    /// propagated (§4.4, §7).
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            return ToolResult {
                call_id: call.id.clone(),
                success: false,
                output: format!("unknown tool: {}", call.name),
                error_kind: Some("UnknownTool".to_string()),
                meta: ToolResultMeta::default(),
            };
        };

        if let Err((field, reason)) = validate_args(&tool.spec(), &call.args) {
            return ToolResult {
                call_id: call.id.clone(),
                success: false,
                output: format!("bad argument '{field}': {reason}"),
                error_kind: Some("BadArguments".to_string()),
                meta: ToolResultMeta::default(),
            };
        }

        match tool.run(&call.args, ctx).await {
            Ok(out) => ToolResult {
                call_id: call.id.clone(),
                success: out.success,
                output: out.output,
                error_kind: out.error_kind,
                meta: out.meta,
            },
            Err(err) => ToolResult {
                call_id: call.id.clone(),
                success: false,
                output: err.to_string(),
                error_kind: Some("ToolError".to_string()),
                meta: ToolResultMeta::default(),
            },
        }
    }
}

fn validate_args(
    spec: &ToolSpec,
    args: &HashMap<String, String>,
) -> std::result::Result<(), (String, String)> {
    for param in &spec.params {
        if param.required && !args.contains_key(&param.name) {
            return Err((param.name.clone(), "missing required parameter".to_string()));
        }
    }
    Ok(())
}

/// Render tool specs into the OpenAI-style `tools` array most chat-completion
/// providers expect (§6).
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &spec.params {
                properties.insert(
                    param.name.clone(),
                    serde_json::json!({ "type": "string", "description": param.description }),
                );
                if param.required {
                    required.push(serde_json::Value::String(param.name.clone()));
                }
            }
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect();
    serde_json::Value::Array(tools)
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                params: vec![ToolParam {
                    name: "input".to_string(),
                    description: "test param".to_string(),
                    required: true,
                }],
            }
        }
        async fn run(&self, _args: &HashMap<String, String>, _ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::ok(format!("ran {}", self.name)))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext { conversation_id: "test-conv".to_string() }
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_specs().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        reg.register(Box::new(DummyTool { name: "beta".into() }));

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    /// Duplicate registration: the first tool wins on `get` (Vec + find).
    #[test]
    fn duplicate_name_get_returns_first_registered() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "dup".into() }));
        reg.register(Box::new(DummyTool { name: "dup".into() }));

        let specs = reg.list_specs();
        assert_eq!(specs.iter().filter(|s| s.name == "dup").count(), 2);
        assert!(reg.get("dup").is_some());
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_carries_call_id() {
        let reg = ToolRegistry::default();
        let call = ToolCall {
            id: "call-1".to_string(),
            name: "nonexistent".to_string(),
            args: HashMap::new(),
        };
        let result = reg.dispatch(&call, &ctx()).await;
        assert_eq!(result.call_id, "call-1");
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("UnknownTool"));
    }

    #[tokio::test]
    async fn dispatch_missing_required_arg_is_bad_arguments() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        let call = ToolCall {
            id: "call-2".to_string(),
            name: "alpha".to_string(),
            args: HashMap::new(),
        };
        let result = reg.dispatch(&call, &ctx()).await;
        assert_eq!(result.call_id, "call-2");
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("BadArguments"));
    }

    #[tokio::test]
    async fn dispatch_success_roundtrips_call_id() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        let mut args = HashMap::new();
        args.insert("input".to_string(), "x".to_string());
        let call = ToolCall { id: "call-3".to_string(), name: "alpha".to_string(), args };
        let result = reg.dispatch(&call, &ctx()).await;
        assert_eq!(result.call_id, "call-3");
        assert!(result.success);
        assert_eq!(result.output, "ran alpha");
    }

    #[test]
    fn specs_to_openai_tools_marks_required_fields() {
        let specs = vec![ToolSpec {
            name: "shell-exec".to_string(),
            description: "run a command".to_string(),
            params: vec![ToolParam {
                name: "command".to_string(),
                description: "the command".to_string(),
                required: true,
            }],
        }];
        let json = specs_to_openai_tools(&specs);
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["function"]["name"], "shell-exec");
        assert_eq!(arr[0]["function"]["parameters"]["required"][0], "command");
    }
}
