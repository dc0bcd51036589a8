//! Shell execution tool (one half of C4): validates via C1, runs via C2.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use cagebox_sandbox::{SandboxError, SandboxManager};
use cagebox_validator::ValidationError;

use crate::{Tool, ToolContext, ToolOutput, ToolParam, ToolResultMeta, ToolSpec};

pub struct ShellExecTool {
    pub sandbox: Arc<SandboxManager>,
    pub exec_timeout: Duration,
}

#[async_trait]
impl Tool for ShellExecTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell-exec".to_string(),
            description: "Run an allowlisted command inside this conversation's sandboxed \
                container. No shell metacharacters (pipes, redirection, substitution) are \
                permitted; see the command validator's allowlist."
                .to_string(),
            params: vec![ToolParam {
                name: "command".to_string(),
                description: "Command string, e.g. 'ls /workspace'.".to_string(),
                required: true,
            }],
        }
    }

    async fn run(&self, args: &HashMap<String, String>, ctx: &ToolContext) -> Result<ToolOutput> {
        let command = args
            .get("command")
            .ok_or_else(|| anyhow::anyhow!("missing required param: command"))?;

        let argv = match cagebox_validator::validate(command) {
            Ok(argv) => argv,
            Err(err) => return Ok(ToolOutput::error(validation_error_kind(&err), err.to_string())),
        };

        match self
            .sandbox
            .exec(&ctx.conversation_id, &argv, self.exec_timeout)
            .await
        {
            Ok(result) => {
                let output = String::from_utf8_lossy(&result.output).to_string();
                let meta = ToolResultMeta {
                    exit_code: result.exit_code,
                    duration_ms: Some(result.duration.as_millis() as u64),
                    truncated: result.truncated,
                };
                if result.timed_out {
                    Ok(ToolOutput {
                        success: false,
                        output,
                        error_kind: Some("ExecTimeout".to_string()),
                        meta,
                    })
                } else {
                    // A nonzero exit code is a normal result delivered to the LLM,
                    // not a tool error (§4.2).
                    Ok(ToolOutput { success: true, output, error_kind: None, meta })
                }
            }
            Err(err) => Ok(ToolOutput::error(sandbox_error_kind(&err), err.to_string())),
        }
    }
}

fn validation_error_kind(err: &ValidationError) -> &'static str {
    match err {
        ValidationError::ForbiddenPattern => "ForbiddenPattern",
        ValidationError::EmptyCommand => "EmptyCommand",
        ValidationError::NotAllowed(_) => "NotAllowed",
        ValidationError::BadShellForm(_) => "BadShellForm",
    }
}

fn sandbox_error_kind(err: &SandboxError) -> &'static str {
    match err {
        SandboxError::SandboxUnavailable(_) => "SandboxUnavailable",
        SandboxError::ContainerStartFailed(_) => "ContainerStartFailed",
        SandboxError::ExecTimeout => "ExecTimeout",
    }
}
