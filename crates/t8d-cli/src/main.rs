mod commands;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use t8d_api::SyncApi;
use t8d_core::{ExitCode, T8dError, T8dResult};
use t8d_fs::{
    ClientConfig, WorkspacePaths, init_workspace, load_config, resolve_server_url,
    resolve_workspace,
};
use t8d_store::LocalStore;
use t8d_sync::{SyncClient, TodoService};
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub(crate) const TOKEN_ENV: &str = "T8D_TOKEN";

#[derive(Debug, Parser)]
#[command(
    name = "t8d",
    version,
    about = "Offline-first to-do lists with multi-device sync",
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    workspace: Option<PathBuf>,

    #[arg(long, global = true)]
    server: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    no_color: bool,

    #[arg(long, global = true)]
    debug: bool,

    /// Skip the sync round that normally follows a local change.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Init,
    Doctor,
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    List {
        #[command(subcommand)]
        command: ListCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum AuthCommand {
    Login {
        #[arg(long)]
        token: String,
    },
    Status,
    Logout,
}

#[derive(Debug, Subcommand)]
pub(crate) enum ListCommand {
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Ls,
    Rename {
        list: String,
        name: String,
    },
    Delete {
        list: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum TaskCommand {
    Add {
        list: String,
        name: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// ISO-8601 date or timestamp.
        #[arg(long)]
        due: Option<String>,
    },
    Ls {
        #[arg(long)]
        list: Option<String>,
        #[arg(long)]
        open: bool,
    },
    Edit {
        task: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, conflicts_with = "clear_due")]
        due: Option<String>,
        #[arg(long)]
        clear_due: bool,
    },
    Done {
        task: String,
    },
    Undo {
        task: String,
    },
    Move {
        task: String,
        #[arg(long, conflicts_with = "root")]
        parent: Option<String>,
        #[arg(long)]
        root: bool,
    },
    Delete {
        task: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum SyncCommand {
    Run,
    Status,
    Enable,
    Disable,
    Bootstrap,
    Watch {
        /// Seconds between timer rounds; defaults to the workspace config.
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        no_realtime: bool,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct GlobalOptions {
    pub workspace: Option<PathBuf>,
    pub server: Option<String>,
    pub json: bool,
    pub offline: bool,
}

/// Everything a command needs once the workspace is resolved.
#[derive(Debug)]
pub(crate) struct WorkspaceContext {
    pub paths: WorkspacePaths,
    pub config: ClientConfig,
    pub server: String,
    pub store: LocalStore,
    pub todo: TodoService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TokenSource {
    Env,
    Workspace,
}

impl WorkspaceContext {
    /// The bearer token for this invocation; `T8D_TOKEN` beats the stored one.
    pub fn token(&self) -> T8dResult<Option<(String, TokenSource)>> {
        if let Ok(value) = std::env::var(TOKEN_ENV)
            && !value.trim().is_empty()
        {
            return Ok(Some((value.trim().to_string(), TokenSource::Env)));
        }

        Ok(self
            .store
            .credential()?
            .map(|token| (token, TokenSource::Workspace)))
    }

    pub fn api(&self) -> T8dResult<SyncApi> {
        SyncApi::with_timeout(&self.server, self.config.request_timeout())
    }

    pub fn sync_client(&self) -> T8dResult<SyncClient> {
        let (token, _) = self.token()?.ok_or_else(|| {
            T8dError::auth(format!(
                "no bearer token; run `t8d auth login --token <token>` or set {TOKEN_ENV}"
            ))
        })?;

        Ok(
            SyncClient::new(self.api()?, self.store.clone(), token)
                .with_max_retries(self.config.sync.max_retries),
        )
    }

    /// Runs one round after a local change when sync is on. Failures are
    /// logged and left for the next trigger; the change itself is already
    /// committed locally.
    pub fn sync_after_change(&self, globals: &GlobalOptions) -> T8dResult<()> {
        if globals.offline || !self.store.sync_enabled()? {
            return Ok(());
        }

        let client = match self.sync_client() {
            Ok(client) => client,
            Err(error) => {
                warn!(error = %error.message, "change saved locally; sync skipped");
                return Ok(());
            }
        };

        if let Err(error) = block_on(client.run_round())? {
            warn!(error = %error.message, "change saved locally; sync failed and will retry");
        }

        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();
    configure_logging(cli.debug, cli.json, cli.no_color);

    let globals = GlobalOptions {
        workspace: cli.workspace,
        server: cli.server,
        json: cli.json,
        offline: cli.offline,
    };

    let result = run_command(cli.command, &globals);

    let exit = match result {
        Ok(code) => code,
        Err(error) => {
            render_error(&error, globals.json);
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

fn run_command(command: Command, globals: &GlobalOptions) -> T8dResult<ExitCode> {
    match command {
        Command::Init => commands::workspace::cmd_init(globals),
        Command::Doctor => commands::workspace::cmd_doctor(globals),
        Command::Auth { command } => commands::auth::cmd_auth(command, globals),
        Command::List { command } => commands::list::cmd_list(command, globals),
        Command::Task { command } => commands::task::cmd_task(command, globals),
        Command::Sync { command } => commands::sync::cmd_sync(command, globals),
    }
}

pub(crate) fn with_workspace<F>(globals: &GlobalOptions, run: F) -> T8dResult<ExitCode>
where
    F: FnOnce(WorkspaceContext) -> T8dResult<ExitCode>,
{
    let target = workspace_target(globals)?;
    if !target.join(".t8d").is_dir() {
        init_workspace(Some(&target), globals.server.as_deref())?;
    }

    let paths = resolve_workspace(Some(&target))?;
    let config = load_config(&paths)?;
    let server = resolve_server_url(&config, globals.server.as_deref())?;
    let store = LocalStore::from_workspace(&paths)?;

    run(WorkspaceContext {
        todo: TodoService::new(store.clone()),
        paths,
        config,
        server,
        store,
    })
}

pub(crate) fn workspace_target(globals: &GlobalOptions) -> T8dResult<PathBuf> {
    if let Some(path) = &globals.workspace {
        return absolutize(path);
    }

    std::env::current_dir().map_err(|err| {
        T8dError::io(format!(
            "failed to resolve current directory for default workspace: {err}"
        ))
    })
}

fn absolutize(path: &Path) -> T8dResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().map_err(|err| {
        T8dError::io(format!(
            "failed to resolve current directory for path: {err}"
        ))
    })?;

    Ok(cwd.join(path))
}

/// Drives one async operation to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> T8dResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| T8dError::io(format!("failed to start async runtime: {err}")))?;

    Ok(runtime.block_on(future))
}

/// First eight characters of an id, enough to pass back as a selector.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn render_error(error: &T8dError, json_output: bool) {
    if json_output {
        let payload = json!({
            "ok": false,
            "error": {
                "kind": error.kind,
                "message": &error.message,
                "issues": &error.issues,
            }
        });
        let serialized = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| {
            "{\"ok\":false,\"error\":{\"kind\":\"io\",\"message\":\"failed to serialize error\"}}".to_string()
        });
        eprintln!("{serialized}");
    } else {
        eprintln!("error: {}", error.message);
        for issue in &error.issues {
            eprintln!("  - {}: {}", issue.path, issue.message);
        }
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> T8dResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| T8dError::io(format!("failed to render JSON output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
