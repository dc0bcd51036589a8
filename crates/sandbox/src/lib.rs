//! Sandbox Manager (C2): one isolated container per conversation id.
//!
//! Containers are owned exclusively by this module; callers (the Session
//! Coordinator, via the Tool Registry) hold only a conversation id, never a
//! container handle (§9 "Arena/ownership") — that keeps cleanup trivially
//! correct and rules out cyclic ownership between sessions and containers.

mod container;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub use cagebox_config::SandboxConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("container engine unreachable: {0}")]
    SandboxUnavailable(String),
    #[error("container failed to start: {0}")]
    ContainerStartFailed(String),
    #[error("exec timed out")]
    ExecTimeout,
}

/// Owned by the manager; sessions hold only a conversation id (§3, §9).
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: String,
    pub container_id: String,
    pub workspace_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub duration: Duration,
    pub truncated: bool,
    pub timed_out: bool,
}

pub struct SandboxManager {
    config: SandboxConfig,
    data_root: PathBuf,
    handles: Mutex<HashMap<String, ContainerHandle>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, data_root: PathBuf) -> Self {
        Self {
            config,
            data_root,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Used at start-up (§6 exit code 2: container engine unreachable).
    pub async fn engine_available(&self) -> bool {
        container::engine_available().await
    }

    fn workspace_dir(&self, conversation_id: &str) -> PathBuf {
        self.data_root.join(conversation_id)
    }

    fn ensure_workspace_dir(&self, conversation_id: &str) -> Result<PathBuf, SandboxError> {
        let dir = self.workspace_dir(conversation_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;
        }
        Ok(dir)
    }

    /// Returns the live container for `conversation_id`, creating it if this
    /// is the first exec or recreating it if the existing one has
    /// disappeared or gone unhealthy (§4.2 Lifecycle, §9 open question:
    /// transparent recreation is the mandated behaviour).
    async fn ensure_container(&self, conversation_id: &str) -> Result<ContainerHandle, SandboxError> {
        {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(conversation_id) {
                if container::is_running(&handle.name).await {
                    return Ok(handle.clone());
                }
            }
        }

        let workspace_dir = self.ensure_workspace_dir(conversation_id)?;
        let handle = container::create(&self.config, conversation_id, &workspace_dir).await?;
        self.handles
            .lock()
            .await
            .insert(conversation_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Run `argv` (already validated by C1) inside the conversation's
    /// container. Never invokes a shell — argv reaches `docker exec`
    /// unchanged (§8 "Argv round-trip").
    pub async fn exec(
        &self,
        conversation_id: &str,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        let handle = self.ensure_container(conversation_id).await?;
        let started = std::time::Instant::now();

        let raw = match container::exec(&handle, argv, timeout, self.config.output_cap_bytes).await {
            Ok(raw) => raw,
            Err(err) => {
                if !container::is_running(&handle.name).await {
                    warn!(conversation_id, "container unhealthy, forgetting handle for next exec");
                    self.handles.lock().await.remove(conversation_id);
                }
                return Err(err);
            }
        };

        Ok(ExecResult {
            exit_code: raw.exit_code,
            output: raw.output,
            duration: started.elapsed(),
            truncated: raw.truncated,
            timed_out: raw.timed_out,
        })
    }

    /// Idempotent: a second call with nothing left to remove is not an error
    /// (§8 "Reset idempotence").
    pub async fn reset(&self, conversation_id: &str) -> Result<(), SandboxError> {
        let handle = self.handles.lock().await.remove(conversation_id);
        if let Some(handle) = handle {
            container::destroy(&handle.name).await;
        }
        Ok(())
    }

    /// Sweep every `runner-*` container, including orphans from a prior
    /// crash. Invoked at shutdown and recommended at start-up (§4.2).
    pub async fn cleanup_all(&self) -> Result<(), SandboxError> {
        self.handles.lock().await.clear();
        container::cleanup_all().await
    }
}
