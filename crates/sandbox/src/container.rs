//! Docker-CLI-subprocess plumbing: the only place this crate talks to the
//! container engine. No bollard/API client — the engine is driven the same
//! way the rest of this codebase shells out, via `tokio::process::Command`,
//! one `docker` invocation per lifecycle step.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::{ContainerHandle, SandboxConfig, SandboxError};

/// Deterministic container name for a conversation id (§3). Only
/// alphanumerics and dashes survive; Docker names are capped at 63 chars.
pub(crate) fn container_name(conversation_id: &str) -> String {
    let sanitized: String = conversation_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let mut name = format!("runner-{sanitized}");
    name.truncate(63);
    name
}

async fn run_docker(args: &[&str]) -> Result<std::process::Output, SandboxError> {
    Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))
}

pub(crate) async fn engine_available() -> bool {
    matches!(
        Command::new("docker")
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await,
        Ok(out) if out.status.success()
    )
}

/// Start a new container for `conversation_id` with the full isolation
/// profile from §4.2, bind-mounting `workspace_dir` read-write at the image
/// workdir and idling on `sleep infinity` until the first exec arrives.
pub(crate) async fn create(
    config: &SandboxConfig,
    conversation_id: &str,
    workspace_dir: &Path,
) -> Result<ContainerHandle, SandboxError> {
    let name = container_name(conversation_id);
    // Remove any stale container left behind by a crash before recreating.
    let _ = run_docker(&["rm", "-f", &name]).await;

    let mem = format!("{}m", config.mem_mib);
    let cpus = config.cpus.to_string();
    let pids = config.pids.to_string();
    let workspace_str = workspace_dir.display().to_string();
    let workdir = "/workspace";
    let volume = format!("{workspace_str}:{workdir}:rw");

    let args: Vec<&str> = vec![
        "run",
        "-d",
        "--name",
        &name,
        "--memory",
        &mem,
        "--cpus",
        &cpus,
        "--pids-limit",
        &pids,
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
        "--user",
        "1000:1000",
        "--read-only",
        "--network",
        "none",
        "--tmpfs",
        "/tmp:size=64m",
        "-v",
        &volume,
        "-w",
        workdir,
        &config.image,
        "sleep",
        "infinity",
    ];

    let output = run_docker(&args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SandboxError::ContainerStartFailed(stderr));
    }
    let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

    Ok(ContainerHandle {
        name,
        container_id,
        workspace_dir: workspace_dir.to_path_buf(),
    })
}

pub(crate) async fn is_running(name: &str) -> bool {
    let output = run_docker(&[
        "inspect",
        "-f",
        "{{.State.Running}}",
        name,
    ])
    .await;
    matches!(output, Ok(out) if out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
}

/// Exec representation after applying the fixed byte cap (§4.2).
pub(crate) struct RawExec {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub timed_out: bool,
    pub truncated: bool,
}

/// Run `argv` inside `handle`'s container as an exec vector — no shell
/// interposition — wrapped in the container's own `timeout` coreutil so a
/// runaway process is killed *inside* the container, not just abandoned by
/// the host-side client.
pub(crate) async fn exec(
    handle: &ContainerHandle,
    argv: &[String],
    timeout: Duration,
    output_cap_bytes: usize,
) -> Result<RawExec, SandboxError> {
    let timeout_secs = timeout.as_secs().max(1).to_string();

    let mut docker_args: Vec<String> = vec![
        "exec".to_string(),
        handle.container_id.clone(),
        "timeout".to_string(),
        "--signal=KILL".to_string(),
        timeout_secs,
    ];
    docker_args.extend(argv.iter().cloned());

    let mut cmd = Command::new("docker");
    cmd.args(&docker_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Host-side fallback in case the engine itself hangs; the in-container
    // `timeout` above is the primary enforcement mechanism.
    let host_deadline = timeout + Duration::from_secs(5);
    let output = tokio::time::timeout(host_deadline, cmd.output())
        .await
        .map_err(|_| SandboxError::ExecTimeout)?
        .map_err(|e| SandboxError::SandboxUnavailable(e.to_string()))?;

    let exit_code = output.status.code();
    // GNU coreutils `timeout --signal=KILL` exits 124 if it had to kill the
    // child, or 128+9=137 if the child itself died to the signal.
    let timed_out = matches!(exit_code, Some(124) | Some(137));

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let truncated = combined.len() > output_cap_bytes;
    if truncated {
        combined.truncate(output_cap_bytes);
    }

    Ok(RawExec {
        exit_code: if timed_out { None } else { exit_code },
        output: combined,
        timed_out,
        truncated,
    })
}

pub(crate) async fn destroy(name: &str) {
    let _ = run_docker(&["rm", "-f", name]).await;
}

/// Remove every container whose name matches the `runner-*` prefix.
pub(crate) async fn cleanup_all() -> Result<(), SandboxError> {
    let output = run_docker(&[
        "ps",
        "-a",
        "--filter",
        "name=^runner-",
        "--format",
        "{{.Names}}",
    ])
    .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SandboxError::SandboxUnavailable(stderr));
    }
    let names = String::from_utf8_lossy(&output.stdout);
    for name in names.lines().filter(|l| !l.is_empty()) {
        destroy(name).await;
    }
    Ok(())
}
