//! Process-wide configuration, read once at start-up (§6).
//!
//! `AppConfig::default()` gives sane values, `load_from` overlays a TOML file
//! on top of them, and environment variables take final precedence for the
//! one field that must never live in a committed file: the LLM API key.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_turns: usize,
    pub max_repeated: usize,
    pub max_consecutive_errors: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_repeated: 2,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub mem_mib: u64,
    pub cpus: f64,
    pub pids: u32,
    pub exec_timeout_s: u64,
    pub output_cap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "runner-base:latest".to_string(),
            mem_mib: 512,
            cpus: 1.0,
            pids: 128,
            exec_timeout_s: 30,
            output_cap_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_bytes: usize,
    pub timeout_s: u64,
    pub max_redirects: u8,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            timeout_s: 15,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: ".runner-data/workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub fetch: FetchConfig,
    pub workspace: WorkspaceConfig,
}

impl AppConfig {
    /// Load from `path`, falling back to defaults for anything the file
    /// doesn't set. A missing file is not an error (use defaults); a
    /// malformed one is.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?;
        }

        if let Ok(key) = env::var("CAGEBOX_LLM_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }
        if let Ok(endpoint) = env::var("CAGEBOX_LLM_ENDPOINT") {
            if !endpoint.is_empty() {
                config.llm.endpoint = endpoint;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Caller maps an `Err` here to exit code 1 (configuration error, §6).
    fn validate(&self) -> Result<()> {
        if self.agent.max_turns == 0 {
            anyhow::bail!("agent.max_turns must be >= 1");
        }
        if self.sandbox.exec_timeout_s == 0 {
            anyhow::bail!("sandbox.exec_timeout_s must be >= 1");
        }
        if self.fetch.max_bytes == 0 {
            anyhow::bail!("fetch.max_bytes must be >= 1");
        }
        Ok(())
    }

    pub fn workspace_root(&self) -> PathBuf {
        PathBuf::from(&self.workspace.root)
    }
}
