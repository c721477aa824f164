use clap::{Parser, Subcommand};
use serde_json::Value;
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use tim_agent::{
    control_plane_url, is_prompt_timeout_error, logger_adapter, run_with_logger,
    spawn_with_logger, ActiveAdapter, ConsoleAdapter, HeadlessAdapter, HeadlessConfig,
    PromptHandler, Prompter, TtyPrompt, TunnelAdapter, TunnelServer,
};
use tim_core::PromptChoice;

const DEFAULT_RECONNECT_MS: u64 = 1_000;

#[derive(Parser, Debug)]
#[command(name = "tim", about = "Forward agent prompts over a tunnel socket or a headless control plane")]
struct Args {
    /// Unix socket of a host process to tunnel through
    #[arg(long, default_value = "")]
    tunnel_socket: String,
    /// WebSocket URL of a headless control plane
    #[arg(long, default_value = "")]
    control_url: String,
    /// Reconnect interval for the control-plane connection, in milliseconds
    #[arg(long, default_value_t = 0)]
    reconnect_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen on a Unix socket and answer subagent prompts interactively
    Serve {
        #[arg(long)]
        socket: PathBuf,
    },
    /// Run one prompt through the active channel and print the answer
    Prompt {
        #[command(subcommand)]
        prompt: PromptCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PromptCommand {
    /// Yes/no question
    Confirm {
        #[arg(long)]
        message: String,
        #[arg(long)]
        default: Option<bool>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Pick one of several choices (--choice name=value, repeatable)
    Select {
        #[arg(long)]
        message: String,
        #[arg(long = "choice")]
        choices: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Free-form text
    Input {
        #[arg(long)]
        message: String,
        #[arg(long)]
        default: Option<String>,
        #[arg(long)]
        validation_hint: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Pick any number of choices (--choice name=value, repeatable)
    Checkbox {
        #[arg(long)]
        message: String,
        #[arg(long = "choice")]
        choices: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Edit or accept a proposed command line
    PrefixSelect {
        #[arg(long)]
        message: String,
        #[arg(long)]
        command: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn init_logging() {
    let level = env::var("TIM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Diagnostics go to stderr; stdout is reserved for prompt answers.
    let make_writer = BoxMakeWriter::new(std::io::stderr);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn resolve_tunnel_socket(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env::var("TIM_TUNNEL_SOCKET")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_control_url(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env::var("TIM_CONTROL_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_reconnect_interval(flag: u64) -> Duration {
    if flag > 0 {
        return Duration::from_millis(flag);
    }
    env::var("TIM_RECONNECT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_RECONNECT_MS))
}

fn parse_choice(raw: &str) -> PromptChoice {
    match raw.split_once('=') {
        Some((name, value)) => PromptChoice::new(name, value),
        None => PromptChoice::new(raw, raw),
    }
}

async fn build_adapter(
    tunnel_socket: &str,
    control_url: &str,
    reconnect_ms: u64,
) -> Result<ActiveAdapter, String> {
    if let Some(socket) = resolve_tunnel_socket(tunnel_socket) {
        let tunnel = TunnelAdapter::connect(&socket)
            .await
            .map_err(|err| format!("tunnel connect failed on {socket}: {err}"))?;
        return Ok(ActiveAdapter::Tunnel(Arc::new(tunnel)));
    }
    if let Some(url) = resolve_control_url(control_url) {
        let url = control_plane_url(&url).map_err(|err| format!("bad control url {url}: {err}"))?;
        let mut config = HeadlessConfig::new(url);
        config.command = Some(env::args().collect::<Vec<_>>().join(" "));
        config.reconnect_interval = resolve_reconnect_interval(reconnect_ms);
        return Ok(ActiveAdapter::Headless(Arc::new(HeadlessAdapter::new(
            config,
        ))));
    }
    Ok(ActiveAdapter::Console(Arc::new(ConsoleAdapter::new())))
}

async fn run_serve(socket: PathBuf) -> i32 {
    let prompter = Arc::new(Prompter::new(Arc::new(TtyPrompt)));
    let handler: PromptHandler = Arc::new(move |request, responder| {
        let prompter = prompter.clone();
        spawn_with_logger(async move {
            match prompter.run_prompt(request).await {
                Ok(value) => responder.respond_value(value).await,
                Err(err) => responder.respond_error(err.to_string()).await,
            }
        });
    });

    let server = match TunnelServer::bind(&socket, logger_adapter(), handler).await {
        Ok(server) => server,
        Err(err) => {
            error!(event = "tunnel_bind_error", socket = %socket.display(), error = %err);
            return 1;
        }
    };
    info!(event = "serving", socket = %socket.display());

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutting_down");
    server.close().await;
    0
}

async fn run_prompt(adapter: ActiveAdapter, prompt: PromptCommand) -> i32 {
    let prompter = Prompter::new(Arc::new(TtyPrompt));
    let result = run_with_logger(adapter.clone(), async move {
        match prompt {
            PromptCommand::Confirm {
                message,
                default,
                timeout_ms,
            } => prompter
                .confirm(message, default, timeout_ms)
                .await
                .map(Value::Bool),
            PromptCommand::Select {
                message,
                choices,
                timeout_ms,
            } => {
                let choices = choices.iter().map(|raw| parse_choice(raw)).collect();
                prompter.select(message, choices, timeout_ms).await
            }
            PromptCommand::Input {
                message,
                default,
                validation_hint,
                timeout_ms,
            } => prompter
                .input(message, default, validation_hint, timeout_ms)
                .await
                .map(Value::String),
            PromptCommand::Checkbox {
                message,
                choices,
                timeout_ms,
            } => {
                let choices = choices.iter().map(|raw| parse_choice(raw)).collect();
                prompter
                    .checkbox(message, choices, timeout_ms)
                    .await
                    .map(Value::Array)
            }
            PromptCommand::PrefixSelect {
                message,
                command,
                timeout_ms,
            } => prompter
                .prefix_select(message, command, timeout_ms)
                .await
                .map(Value::String),
        }
    })
    .await;

    // Let the control plane see the answer broadcast before exiting.
    if let ActiveAdapter::Headless(headless) = &adapter {
        headless.flush(Duration::from_secs(2)).await;
        headless.destroy();
    }
    if let ActiveAdapter::Tunnel(tunnel) = &adapter {
        tunnel.destroy();
    }

    match result {
        Ok(value) => {
            println!("{value}");
            0
        }
        Err(err) if is_prompt_timeout_error(&err) => {
            error!(event = "prompt_timeout", error = %err);
            2
        }
        Err(err) => {
            error!(event = "prompt_error", error = %err);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging();

    let Args {
        tunnel_socket,
        control_url,
        reconnect_ms,
        command,
    } = args;

    let code = match command {
        Command::Serve { socket } => run_serve(socket).await,
        Command::Prompt { prompt } => {
            match build_adapter(&tunnel_socket, &control_url, reconnect_ms).await {
                Ok(adapter) => run_prompt(adapter, prompt).await,
                Err(err) => {
                    error!(event = "adapter_error", error = %err);
                    1
                }
            }
        }
    };
    std::process::exit(code);
}
