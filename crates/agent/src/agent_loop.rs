//! Agent Loop (C5): the bounded Think→Act→Observe cycle against an LLM,
//! with the three circuit breakers that keep a misbehaving model from
//! running forever (§4.5).
//!
//! This module is a pure function over a mutable history plus its
//! collaborators — no state of its own survives between calls. The Session
//! Coordinator (`crate::session`) is what gives it something to run
//! against repeatedly.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use cagebox_config::AgentConfig;
use cagebox_llm::{ChatBackend, ChatMessage, ChatResponse};
use cagebox_tools::{ToolCall as RegistryCall, ToolContext, ToolRegistry};

/// Why the loop stopped (§3 "Agent Result", §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    Completed,
    MaxTurns,
    RepeatedCall,
    ConsecutiveErrors,
    LlmError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::MaxTurns => "max-turns",
            StopReason::RepeatedCall => "repeated-call",
            StopReason::ConsecutiveErrors => "consecutive-errors",
            StopReason::LlmError => "llm-error",
        }
    }
}

/// One dispatched tool call's outcome, as recorded in the turn trace (§4.5
/// "Trace"). `excerpt` is a bounded prefix of the tool's output, not the
/// full payload — the trace is for diagnostics, not replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool_name: String,
    pub success: bool,
    pub error_kind: Option<String>,
    pub excerpt: String,
}

/// Everything that happened during one THINK→ACT→OBSERVE iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTrace {
    pub turn: usize,
    pub tool_calls: Vec<ToolCallSummary>,
}

/// Terminal output of the loop (§3 "Agent Result").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub final_text: String,
    pub stop_reason: StopReason,
    pub turns: usize,
    pub trace: Vec<TurnTrace>,
}

impl AgentResult {
    /// The message actually shown to the user (§7 "User-visible failure"):
    /// the LLM's last text if it said anything, otherwise a short sentence
    /// naming why the loop stopped. Never a stack trace.
    pub fn user_message(&self) -> String {
        if !self.final_text.trim().is_empty() {
            return self.final_text.clone();
        }
        match self.stop_reason {
            StopReason::Completed => String::new(),
            StopReason::MaxTurns => {
                "Stopped: reached the maximum number of turns without a final answer.".to_string()
            }
            StopReason::RepeatedCall => {
                "Stopped: the same tool call was repeated without making progress.".to_string()
            }
            StopReason::ConsecutiveErrors => {
                "Stopped: too many consecutive tool failures.".to_string()
            }
            StopReason::LlmError => "Stopped: the language model was unreachable.".to_string(),
        }
    }
}

const MAX_EXCERPT_CHARS: usize = 500;

fn excerpt(s: &str) -> String {
    if s.chars().count() <= MAX_EXCERPT_CHARS {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(MAX_EXCERPT_CHARS).collect();
        format!("{truncated}…")
    }
}

/// Canonicalise a tool call into a `(tool_name, arguments)` signature for
/// the repeated-call breaker (§4.5, §9 "Argument canonicalisation"): sort
/// argument keys lexicographically, trim and collapse whitespace runs in
/// string values. Two calls are "the same" iff their canonical forms are
/// byte-equal.
fn canonical_signature(name: &str, args: &Value) -> String {
    let mut canon: BTreeMap<String, String> = BTreeMap::new();
    if let Some(obj) = args.as_object() {
        for (k, v) in obj {
            let raw = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let normalized = raw.trim().split_whitespace().collect::<Vec<_>>().join(" ");
            canon.insert(k.clone(), normalized);
        }
    }
    let args_str = canon
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{name}::{args_str}")
}

/// Convert a JSON arguments object into the string map the Tool Registry's
/// handlers expect.
fn json_args_to_string_map(val: &Value) -> HashMap<String, String> {
    val.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Run the bounded agent loop against `history`, which is mutated in place
/// as the conversation progresses (§4.5 "Loop structure"). `conversation_id`
/// is threaded through to the Tool Registry so shell-exec lands in the
/// right container.
///
/// Breakers are checked at the top of every iteration, before any tool is
/// dispatched (§4.5 "Circuit breakers").
pub async fn run(
    history: &mut Vec<ChatMessage>,
    conversation_id: &str,
    tools: &ToolRegistry,
    llm: &dyn ChatBackend,
    config: &AgentConfig,
) -> AgentResult {
    let specs = tools.list_specs();
    let tools_json = if specs.is_empty() {
        None
    } else {
        Some(cagebox_tools::specs_to_openai_tools(&specs))
    };

    let ctx = ToolContext {
        conversation_id: conversation_id.to_string(),
    };

    let mut trace: Vec<TurnTrace> = Vec::new();
    let mut consecutive_errors = 0usize;
    let mut last_text = String::new();
    let mut repeat_streak: HashMap<String, usize> = HashMap::new();

    for turn in 1..=config.max_turns {
        let response: ChatResponse = match llm.chat(history, tools_json.as_ref()).await {
            Ok(r) => r,
            Err(err) => {
                warn!(conversation_id, turn, error = %err, "llm call failed");
                return AgentResult {
                    final_text: last_text,
                    stop_reason: StopReason::LlmError,
                    turns: turn - 1,
                    trace,
                };
            }
        };

        if !response.content.is_empty() {
            last_text = response.content.clone();
        }

        if response.tool_calls.is_empty() {
            history.push(ChatMessage::assistant(response.content.clone()));
            info!(conversation_id, turns = turn, stop_reason = "completed", "agent loop completed");
            return AgentResult {
                final_text: response.content,
                stop_reason: StopReason::Completed,
                turns: turn,
                trace,
            };
        }

        // Repeated-call breaker: a signature that streaks for
        // `max_repeated` consecutive turns trips the breaker before any of
        // this turn's calls are dispatched.
        let signatures: HashSet<String> = response
            .tool_calls
            .iter()
            .map(|tc| canonical_signature(&tc.function.name, &tc.function.arguments))
            .collect();

        let mut next_streak: HashMap<String, usize> = HashMap::new();
        let mut tripped = false;
        for sig in &signatures {
            let count = repeat_streak.get(sig).copied().unwrap_or(0) + 1;
            if count >= config.max_repeated.max(2) {
                tripped = true;
            }
            next_streak.insert(sig.clone(), count);
        }
        repeat_streak = next_streak;

        if tripped {
            warn!(conversation_id, turns = turn, stop_reason = "repeated-call", "breaker tripped");
            return AgentResult {
                final_text: last_text,
                stop_reason: StopReason::RepeatedCall,
                turns: turn,
                trace,
            };
        }

        history.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

        let mut turn_trace = TurnTrace { turn, tool_calls: Vec::new() };
        let mut breaker_tripped: Option<StopReason> = None;

        for tc in &response.tool_calls {
            let call = RegistryCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                args: json_args_to_string_map(&tc.function.arguments),
            };
            let result = tools.dispatch(&call, &ctx).await;

            info!(
                conversation_id,
                turn,
                tool = %call.name,
                success = result.success,
                error_kind = result.error_kind.as_deref().unwrap_or(""),
                exit_code = result.meta.exit_code.unwrap_or(-1),
                duration_ms = result.meta.duration_ms.unwrap_or(0),
                truncated = result.meta.truncated,
                "tool invocation"
            );

            history.push(ChatMessage::tool_result(&result.call_id, &result.output));

            turn_trace.tool_calls.push(ToolCallSummary {
                tool_name: call.name.clone(),
                success: result.success,
                error_kind: result.error_kind.clone(),
                excerpt: excerpt(&result.output),
            });

            if result.success {
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
                if consecutive_errors >= config.max_consecutive_errors {
                    breaker_tripped = Some(StopReason::ConsecutiveErrors);
                }
            }
        }

        trace.push(turn_trace);

        if let Some(reason) = breaker_tripped {
            warn!(conversation_id, turns = turn, stop_reason = reason.as_str(), "breaker tripped");
            return AgentResult { final_text: last_text, stop_reason: reason, turns: turn, trace };
        }
    }

    warn!(conversation_id, turns = config.max_turns, stop_reason = "max-turns", "breaker tripped");
    AgentResult {
        final_text: last_text,
        stop_reason: StopReason::MaxTurns,
        turns: config.max_turns,
        trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_signature_ignores_key_order_and_whitespace() {
        let a = serde_json::json!({"command": "ls  /workspace", "extra": "x"});
        let b = serde_json::json!({"extra": "x", "command": "ls /workspace "});
        assert_eq!(canonical_signature("shell-exec", &a), canonical_signature("shell-exec", &b));
    }

    #[test]
    fn canonical_signature_distinguishes_different_args() {
        let a = serde_json::json!({"command": "pwd"});
        let b = serde_json::json!({"command": "ls"});
        assert_ne!(canonical_signature("shell-exec", &a), canonical_signature("shell-exec", &b));
    }

    #[test]
    fn json_args_to_string_map_handles_mixed_types() {
        let val = serde_json::json!({"query": "x", "count": 5, "flag": true, "n": null});
        let map = json_args_to_string_map(&val);
        assert_eq!(map["query"], "x");
        assert_eq!(map["count"], "5");
        assert_eq!(map["flag"], "true");
        assert_eq!(map["n"], "");
    }

    #[test]
    fn excerpt_truncates_long_output_with_ellipsis() {
        let long = "a".repeat(MAX_EXCERPT_CHARS + 10);
        let short = excerpt(&long);
        assert!(short.ends_with('…'));
        assert_eq!(short.chars().count(), MAX_EXCERPT_CHARS + 1);
    }

    #[test]
    fn excerpt_leaves_short_output_untouched() {
        assert_eq!(excerpt("hello"), "hello");
    }

    #[test]
    fn stop_reason_as_str_matches_spec_tags() {
        assert_eq!(StopReason::Completed.as_str(), "completed");
        assert_eq!(StopReason::MaxTurns.as_str(), "max-turns");
        assert_eq!(StopReason::RepeatedCall.as_str(), "repeated-call");
        assert_eq!(StopReason::ConsecutiveErrors.as_str(), "consecutive-errors");
        assert_eq!(StopReason::LlmError.as_str(), "llm-error");
    }

    #[test]
    fn user_message_prefers_final_text_over_stop_reason() {
        let result = AgentResult {
            final_text: "all done".to_string(),
            stop_reason: StopReason::MaxTurns,
            turns: 10,
            trace: vec![],
        };
        assert_eq!(result.user_message(), "all done");
    }

    #[test]
    fn user_message_falls_back_to_stop_reason_sentence() {
        let result = AgentResult {
            final_text: String::new(),
            stop_reason: StopReason::RepeatedCall,
            turns: 2,
            trace: vec![],
        };
        assert!(result.user_message().contains("repeated"));
    }
}

/// End-to-end scenarios for the full loop (§8 "Concrete end-to-end
/// scenarios"), driven by a scripted [`ChatBackend`] and a toy tool so no
/// real network or container is involved.
#[cfg(test)]
mod loop_tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use cagebox_llm::{LlmError, ToolCall as LlmToolCall, ToolCallFunction};
    use cagebox_tools::{Tool, ToolOutput, ToolParam, ToolSpec};

    use super::*;

    struct ScriptedBackend {
        responses: StdMutex<VecDeque<Result<ChatResponse, LlmError>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<ChatResponse, LlmError>>) -> Self {
            Self { responses: StdMutex::new(responses.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: Option<&Value>,
        ) -> Result<ChatResponse, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ChatResponse {
                    content: "ran out of script".to_string(),
                    tool_calls: vec![],
                    finish_reason: "stop".to_string(),
                }))
        }
    }

    fn tool_call(id: &str, name: &str, args: Value) -> LlmToolCall {
        LlmToolCall {
            id: id.to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction { name: name.to_string(), arguments: args },
        }
    }

    fn text_response(content: &str) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse { content: content.to_string(), tool_calls: vec![], finish_reason: "stop".to_string() })
    }

    fn tool_call_response(calls: Vec<LlmToolCall>) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse { content: String::new(), tool_calls: calls, finish_reason: "tool_calls".to_string() })
    }

    /// Always succeeds, echoing its `command` argument back.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "shell-exec".to_string(),
                description: "echoes its command arg".to_string(),
                params: vec![ToolParam {
                    name: "command".to_string(),
                    description: "command".to_string(),
                    required: true,
                }],
            }
        }

        async fn run(
            &self,
            args: &HashMap<String, String>,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(args.get("command").cloned().unwrap_or_default()))
        }
    }

    /// Always fails.
    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "shell-exec".to_string(),
                description: "always fails".to_string(),
                params: vec![ToolParam {
                    name: "command".to_string(),
                    description: "command".to_string(),
                    required: true,
                }],
            }
        }

        async fn run(
            &self,
            _args: &HashMap<String, String>,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::error("ExecFailed", "boom"))
        }
    }

    fn config() -> AgentConfig {
        AgentConfig { max_turns: 10, max_repeated: 2, max_consecutive_errors: 3 }
    }

    #[tokio::test]
    async fn happy_path_completes_in_two_turns() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));

        let backend = ScriptedBackend::new(vec![
            tool_call_response(vec![tool_call("call_1", "shell-exec", serde_json::json!({"command": "ls /workspace"}))]),
            text_response("The workspace is empty."),
        ]);

        let mut history = vec![ChatMessage::user("list files")];
        let result = run(&mut history, "conv-1", &registry, &backend, &config()).await;

        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.turns, 2);
        assert_eq!(result.final_text, "The workspace is empty.");
    }

    #[tokio::test]
    async fn repeated_identical_call_trips_breaker_after_two_turns() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));

        let backend = ScriptedBackend::new(vec![
            tool_call_response(vec![tool_call("call_1", "shell-exec", serde_json::json!({"command": "pwd"}))]),
            tool_call_response(vec![tool_call("call_2", "shell-exec", serde_json::json!({"command": "pwd"}))]),
        ]);

        let mut history = vec![ChatMessage::user("where am i, twice")];
        let result = run(&mut history, "conv-2", &registry, &backend, &config()).await;

        assert_eq!(result.stop_reason, StopReason::RepeatedCall);
        assert_eq!(result.turns, 2);
    }

    #[tokio::test]
    async fn whitespace_variant_of_same_call_still_trips_breaker() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));

        let backend = ScriptedBackend::new(vec![
            tool_call_response(vec![tool_call("call_1", "shell-exec", serde_json::json!({"command": "pwd"}))]),
            tool_call_response(vec![tool_call("call_2", "shell-exec", serde_json::json!({"command": "  pwd  "}))]),
        ]);

        let mut history = vec![ChatMessage::user("where am i")];
        let result = run(&mut history, "conv-2b", &registry, &backend, &config()).await;

        assert_eq!(result.stop_reason, StopReason::RepeatedCall);
    }

    #[tokio::test]
    async fn three_consecutive_tool_failures_trip_breaker() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(FailingTool));

        let backend = ScriptedBackend::new(vec![
            tool_call_response(vec![tool_call("call_1", "shell-exec", serde_json::json!({"command": "a"}))]),
            tool_call_response(vec![tool_call("call_2", "shell-exec", serde_json::json!({"command": "b"}))]),
            tool_call_response(vec![tool_call("call_3", "shell-exec", serde_json::json!({"command": "c"}))]),
        ]);

        let mut history = vec![ChatMessage::user("do three different broken things")];
        let result = run(&mut history, "conv-3", &registry, &backend, &config()).await;

        assert_eq!(result.stop_reason, StopReason::ConsecutiveErrors);
        assert_eq!(result.turns, 3);
    }

    #[tokio::test]
    async fn max_turns_breaker_stops_an_endlessly_calling_model() {
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(EchoTool));

        // Vary arguments each turn so the repeated-call breaker never trips
        // first — this exercises the turn cap specifically.
        let scripted = (0..20)
            .map(|i| {
                tool_call_response(vec![tool_call(
                    &format!("call_{i}"),
                    "shell-exec",
                    serde_json::json!({"command": format!("echo {i}")}),
                )])
            })
            .collect();
        let backend = ScriptedBackend::new(scripted);

        let mut history = vec![ChatMessage::user("keep going forever")];
        let cfg = config();
        let result = run(&mut history, "conv-4", &registry, &backend, &cfg).await;

        assert_eq!(result.stop_reason, StopReason::MaxTurns);
        assert_eq!(result.turns, cfg.max_turns);
    }

    #[tokio::test]
    async fn llm_transport_error_stops_immediately_with_last_known_text() {
        let registry = ToolRegistry::default();
        let backend = ScriptedBackend::new(vec![
            text_response("partial progress"),
            Err(LlmError::Unavailable("connection refused".to_string())),
        ]);

        let mut history = vec![ChatMessage::user("hello")];
        let cfg = config();
        // First call returns plain text, which *completes* the loop — so to
        // exercise the error path directly we script only the error.
        let backend_err_only = ScriptedBackend::new(vec![Err(LlmError::Unavailable("down".to_string()))]);
        let result = run(&mut history, "conv-5", &registry, &backend_err_only, &cfg).await;
        assert_eq!(result.stop_reason, StopReason::LlmError);
        assert_eq!(result.turns, 0);

        // Sanity: the scripted backend with a leading text response does
        // complete rather than erroring, confirming the harness itself
        // behaves as expected independent of error handling.
        let mut history2 = vec![ChatMessage::user("hello")];
        let result2 = run(&mut history2, "conv-5b", &registry, &backend, &cfg).await;
        assert_eq!(result2.stop_reason, StopReason::Completed);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_not_an_error_loop_still_completes() {
        struct ExitOneTool;
        #[async_trait]
        impl Tool for ExitOneTool {
            fn spec(&self) -> ToolSpec {
                ToolSpec {
                    name: "shell-exec".to_string(),
                    description: "exits 1".to_string(),
                    params: vec![ToolParam {
                        name: "command".to_string(),
                        description: "command".to_string(),
                        required: true,
                    }],
                }
            }
            async fn run(
                &self,
                _args: &HashMap<String, String>,
                _ctx: &ToolContext,
            ) -> anyhow::Result<ToolOutput> {
                // success=true with a nonzero exit code, mirroring
                // ShellExecTool's handling of a normal nonzero exit (§4.2).
                Ok(ToolOutput {
                    success: true,
                    output: String::new(),
                    error_kind: None,
                    meta: cagebox_tools::ToolResultMeta { exit_code: Some(1), duration_ms: Some(5), truncated: false },
                })
            }
        }

        let mut registry = ToolRegistry::default();
        registry.register(Box::new(ExitOneTool));

        let backend = ScriptedBackend::new(vec![
            tool_call_response(vec![tool_call("call_1", "shell-exec", serde_json::json!({"command": "grep foo x"}))]),
            text_response("No matches were found."),
        ]);

        let mut history = vec![ChatMessage::user("search for foo")];
        let result = run(&mut history, "conv-6", &registry, &backend, &config()).await;

        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.trace[0].tool_calls[0].success, true);
    }
}
