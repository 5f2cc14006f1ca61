use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use t8d_core::{ExitCode, T8dError, T8dResult};
use t8d_server::{ServerConfig, ServerStore, load_server_config, serve};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "t8d-server",
    version,
    about = "Sync server for t8d devices",
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    no_color: bool,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Creates the user if needed and prints a new bearer token once.
    Add { user_id: String },
}

fn main() {
    let cli = Cli::parse();
    configure_logging(cli.debug, cli.json, cli.no_color);

    let json_output = cli.json;
    let exit = match run(cli) {
        Ok(code) => code,
        Err(error) => {
            render_error(&error, json_output);
            error.exit_code()
        }
    };

    std::process::exit(exit.as_i32());
}

fn configure_logging(debug: bool, json: bool, no_color: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(!no_color)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run(cli: Cli) -> T8dResult<ExitCode> {
    let config = load_server_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind } => {
            let config = config.with_overrides(bind, cli.database);
            cmd_serve(&config)
        }
        Command::User {
            command: UserCommand::Add { user_id },
        } => {
            let config = config.with_overrides(None, cli.database);
            cmd_user_add(&config, &user_id, cli.json)
        }
    }
}

fn cmd_serve(config: &ServerConfig) -> T8dResult<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| T8dError::io(format!("failed to start async runtime: {err}")))?;

    runtime.block_on(serve(config, shutdown_signal()))?;
    Ok(ExitCode::Success)
}

fn cmd_user_add(config: &ServerConfig, user_id: &str, json_output: bool) -> T8dResult<ExitCode> {
    let store = ServerStore::open(&config.database)?;
    let token = store.issue_token(user_id)?;

    if json_output {
        let payload = json!({"ok": true, "user_id": user_id.trim(), "token": token});
        let rendered = serde_json::to_string_pretty(&payload)
            .map_err(|err| T8dError::io(format!("failed to render JSON output: {err}")))?;
        println!("{rendered}");
    } else {
        println!("user: {}", user_id.trim());
        println!("token: {token}");
        println!("store this token now; it cannot be shown again");
    }

    Ok(ExitCode::Success)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
}

fn render_error(error: &T8dError, json_output: bool) {
    if json_output {
        let payload = json!({
            "ok": false,
            "error": {
                "kind": error.kind,
                "message": &error.message,
            }
        });
        let serialized = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| {
            "{\"ok\":false,\"error\":{\"kind\":\"io\",\"message\":\"failed to serialize error\"}}".to_string()
        });
        eprintln!("{serialized}");
    } else {
        eprintln!("error: {}", error.message);
    }
}
