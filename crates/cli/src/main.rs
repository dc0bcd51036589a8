//! Entry point: parse configuration, wire the core crates together, and run
//! either one message (`ask`) or an interactive REPL (`run`) against a
//! conversation id. Contains no agent logic of its own — everything named
//! in the component design lives in the core crates.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cagebox_agent::SessionCoordinator;
use cagebox_config::AppConfig;
use cagebox_fetch::FetchOptions;
use cagebox_llm::LlmClient;
use cagebox_sandbox::SandboxManager;
use cagebox_tools::{ShellExecTool, ToolRegistry, WebFetchTool};

const DEFAULT_CONVERSATION_ID: &str = "default";
const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(name = "cagebox", version, about = "A sandboxed, tool-using LLM agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one message and print the reply.
    Ask {
        message: String,
        #[arg(long, default_value = DEFAULT_CONVERSATION_ID)]
        conversation: String,
    },
    /// Read messages from stdin, one per line, until EOF or Ctrl-C.
    Run {
        #[arg(long, default_value = DEFAULT_CONVERSATION_ID)]
        conversation: String,
    },
    /// Drop a conversation's history and reset its sandbox container.
    Reset {
        #[arg(long, default_value = DEFAULT_CONVERSATION_ID)]
        conversation: String,
    },
    /// Sweep every sandboxed container this process has created.
    Cleanup,
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ConfigError>().is_some() {
        ExitCode::from(1)
    } else if err.downcast_ref::<EngineUnavailable>().is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::from(3)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
struct ConfigError(String);

#[derive(Debug, thiserror::Error)]
#[error("container engine unreachable")]
struct EngineUnavailable;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load_from(CONFIG_PATH)
        .map_err(|e| ConfigError(e.to_string()))
        .context("loading configuration")?;

    let sandbox = Arc::new(SandboxManager::new(
        config.sandbox.clone(),
        PathBuf::from(&config.workspace.root),
    ));

    if !sandbox.engine_available().await {
        return Err(EngineUnavailable.into());
    }

    let coordinator = build_coordinator(&config, sandbox.clone());

    let cli = Cli::parse();
    match cli.command {
        Commands::Ask { message, conversation } => {
            let result = coordinator.handle_message(&conversation, &message).await;
            println!("{}", result.user_message());
        }
        Commands::Run { conversation } => {
            run_repl(&coordinator, &conversation).await?;
            coordinator.shutdown().await.context("shutting down sandboxes")?;
        }
        Commands::Reset { conversation } => {
            coordinator.reset(&conversation).await.context("resetting conversation")?;
            println!("conversation '{conversation}' reset");
        }
        Commands::Cleanup => {
            coordinator.shutdown().await.context("cleaning up sandboxes")?;
            println!("all sandboxed containers swept");
        }
    }

    Ok(())
}

fn build_coordinator(config: &AppConfig, sandbox: Arc<SandboxManager>) -> SessionCoordinator {
    let mut tools = ToolRegistry::default();
    tools.register(Box::new(ShellExecTool {
        sandbox: sandbox.clone(),
        exec_timeout: Duration::from_secs(config.sandbox.exec_timeout_s),
    }));
    tools.register(Box::new(WebFetchTool {
        opts: FetchOptions {
            max_bytes: config.fetch.max_bytes,
            timeout: Duration::from_secs(config.fetch.timeout_s),
            max_redirects: config.fetch.max_redirects,
        },
    }));

    let llm = LlmClient::new(config.llm.clone());
    SessionCoordinator::new(tools, Box::new(llm), sandbox, config.clone())
}

/// Interactive REPL: one line of stdin per turn against the same
/// conversation id, until EOF or SIGINT. Line reads happen on a blocking
/// task so a Ctrl-C can still be observed and turned into a sandbox sweep
/// via `SessionCoordinator::shutdown` before the process exits (§5
/// "Cancellation").
async fn run_repl(coordinator: &SessionCoordinator, conversation: &str) -> Result<()> {
    let interactive = io::stdin().is_terminal();

    loop {
        if interactive {
            print!("> ");
            io::stdout().flush().ok();
        }

        let next_line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            let n = io::stdin().read_line(&mut line)?;
            Ok::<_, io::Error>((n, line))
        });

        tokio::select! {
            result = next_line => {
                let (n, line) = result.context("reading stdin")??;
                if n == 0 {
                    break;
                }
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let result = coordinator.handle_message(conversation, line).await;
                println!("{}", result.user_message());
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    Ok(())
}
