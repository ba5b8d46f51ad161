//! agentlink command-line host
//!
//! Starts a worker, runs one command against it, prints JSON on stdout and
//! stops the worker. Logs go to stderr.

use agentlink::config::Settings;
use agentlink::events::ALL_EVENTS;
use agentlink::{BatchItem, BatchMode, ClientError, ConfigError, ErrorReport, RpcClient};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "agentlink",
    version,
    about = "Talk JSON-RPC 2.0 to a supervised worker over stdio"
)]
struct Cli {
    /// Interpreter used to run --script
    #[arg(long, global = true)]
    interpreter: Option<String>,

    /// Worker script, run through the interpreter
    #[arg(long, global = true, conflicts_with = "executable")]
    script: Option<PathBuf>,

    /// Self-contained worker executable
    #[arg(long, global = true)]
    executable: Option<PathBuf>,

    /// Rc file to read instead of ~/.agentlinkrc
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pass --debug to the worker and log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Default call timeout in milliseconds
    #[arg(long, global = true)]
    call_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Health-check the worker
    Ping,
    /// Print connection status, refined by a ping
    Status,
    /// Call a method and print its result
    Call {
        method: String,
        /// Params as JSON
        params: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send a notification
    Notify {
        method: String,
        /// Params as JSON
        params: Option<String>,
    },
    /// Run a JSON array of {method, params?, timeout_ms?}
    Batch {
        file: PathBuf,
        /// Issue every call at once instead of stopping at the first failure
        #[arg(long)]
        parallel: bool,
    },
    /// Print every worker event until Ctrl-C or the worker exits
    Watch,
}

fn init_tracing(debug: bool) {
    let default = if debug { "agentlink=debug" } else { "agentlink=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            println!("{}", error_report(&e).to_json());
            ExitCode::FAILURE
        }
    }
}

fn error_report(error: &anyhow::Error) -> ErrorReport {
    if let Some(client_error) = error.downcast_ref::<ClientError>() {
        return client_error.report();
    }
    let code = if error.downcast_ref::<ConfigError>().is_some() {
        "CONFIG_ERROR"
    } else {
        "CLI_ERROR"
    };
    ErrorReport {
        code: code.to_string(),
        message: format!("{:#}", error),
        data: None,
    }
}

fn settings_from(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(interpreter) = &cli.interpreter {
        settings.set("AGENTLINK_INTERPRETER", interpreter.as_str());
    }
    if let Some(script) = &cli.script {
        // A script on the command line beats an executable from the environment
        settings.remove("AGENTLINK_EXECUTABLE");
        settings.set("AGENTLINK_SCRIPT", script.to_string_lossy());
    }
    if let Some(executable) = &cli.executable {
        settings.set("AGENTLINK_EXECUTABLE", executable.to_string_lossy());
    }
    if cli.debug {
        settings.set("AGENTLINK_DEBUG", "1");
    }
    if let Some(ms) = cli.call_timeout_ms {
        settings.set("AGENTLINK_CALL_TIMEOUT_MS", ms.to_string());
    }
    Ok(settings)
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str::<Value>(text).context("params must be valid JSON"))
        .transpose()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let options = settings_from(&cli)?.to_options()?;
    let client = RpcClient::new(options);

    client.start().await?;
    let result = execute(&client, cli.command).await;
    client.stop().await?;
    result
}

async fn execute(client: &RpcClient, command: Command) -> Result<ExitCode> {
    match command {
        Command::Ping => {
            let result = client.ping().await?;
            print_json(&result)?;
        }
        Command::Status => {
            let status = client.check_health().await;
            print_json(&serde_json::to_value(status)?)?;
        }
        Command::Call {
            method,
            params,
            timeout_ms,
        } => {
            let params = parse_params(params.as_deref())?;
            let result = match timeout_ms {
                Some(ms) => {
                    client
                        .call_with_timeout(&method, params, Duration::from_millis(ms))
                        .await?
                }
                None => client.call(&method, params).await?,
            };
            print_json(&result)?;
        }
        Command::Notify { method, params } => {
            let params = parse_params(params.as_deref())?;
            client.notify(&method, params).await?;
        }
        Command::Batch { file, parallel } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let items: Vec<BatchItem> = serde_json::from_str(&content)
                .with_context(|| format!("{} is not a JSON array of calls", file.display()))?;
            let mode = if parallel {
                BatchMode::Parallel
            } else {
                BatchMode::Sequential
            };

            let result = client.execute_batch(&items, mode).await;
            print_json(&result.to_json())?;
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Watch => watch(client).await,
    }
    Ok(ExitCode::SUCCESS)
}

async fn watch(client: &RpcClient) {
    let exited = Arc::new(tokio::sync::Notify::new());
    let handle = client.subscribe(ALL_EVENTS, |event| {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    });
    let on_exit = Arc::clone(&exited);
    let exit_handle = client.subscribe("exit", move |_| on_exit.notify_one());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        _ = exited.notified() => {}
    }

    client.unsubscribe(&handle);
    client.unsubscribe(&exit_handle);
}
