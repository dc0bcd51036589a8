//! Session Coordinator (§4.6): the per-conversation mutex map and history
//! store the Agent Loop runs against. Deliberately thin — a keyed mutex and
//! a history `Vec`, nothing more — but specified in full because C5 cannot
//! be exercised end-to-end without it.
//!
//! One mutex per conversation id rather than one process-wide lock, so
//! unrelated conversations never serialise against each other.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cagebox_config::AppConfig;
use cagebox_llm::{ChatBackend, ChatMessage};
use cagebox_sandbox::SandboxManager;
use cagebox_tools::ToolRegistry;

use crate::agent_loop::{self, AgentResult};

/// One conversation's state (§3 "Session"). The system message priming the
/// model with the sandbox and its two tools is appended the first time a
/// session is touched.
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            history: vec![ChatMessage::system(SYSTEM_PROMPT)],
            created_at: Utc::now(),
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a coding assistant with access to a sandboxed shell \
(tool `shell-exec`, restricted to a fixed set of safe commands inside an isolated, \
network-disabled container) and a safe web fetcher (tool `web-fetch`, restricted to \
public HTTP/HTTPS addresses). Use these tools to help the user; explain what you ran \
and why.";

/// Process-wide map from conversation id to its session, guarded by a
/// meta-mutex for race-free lookup-or-insert (§5 "Session mutex map"). The
/// per-session `Mutex` is held for the entire duration of one agent-loop
/// run, not just the map mutation.
pub struct SessionCoordinator {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    tools: ToolRegistry,
    llm: Box<dyn ChatBackend>,
    sandbox: Arc<SandboxManager>,
    config: AppConfig,
}

impl SessionCoordinator {
    pub fn new(
        tools: ToolRegistry,
        llm: Box<dyn ChatBackend>,
        sandbox: Arc<SandboxManager>,
        config: AppConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tools,
            llm,
            sandbox,
            config,
        }
    }

    async fn session_handle(&self, conversation_id: &str) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new())))
            .clone()
    }

    /// Look up or create the session, then run one user message through the
    /// Agent Loop while holding that session's mutex for the full call
    /// (§4.6, §5). A second concurrent call for the same conversation id
    /// blocks until this one returns.
    pub async fn handle_message(&self, conversation_id: &str, text: &str) -> AgentResult {
        let handle = self.session_handle(conversation_id).await;
        let mut session = handle.lock().await;

        session.history.push(ChatMessage::user(text));
        agent_loop::run(
            &mut session.history,
            conversation_id,
            &self.tools,
            self.llm.as_ref(),
            &self.config.agent,
        )
        .await
    }

    /// Drop the session's history and reset its container. Idempotent:
    /// resetting an id that was never used, or resetting it twice, is not
    /// an error (§4.6).
    pub async fn reset(&self, conversation_id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(conversation_id);
        }
        self.sandbox.reset(conversation_id).await?;
        Ok(())
    }

    /// Drop every session and sweep every sandboxed container. Called on
    /// process exit, including on SIGINT during an interactive `run`
    /// session (§5 "Cancellation").
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            sessions.clear();
        }
        self.sandbox.cleanup_all().await?;
        Ok(())
    }
}
