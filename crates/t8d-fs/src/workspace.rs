use crate::config::{ClientConfig, DEFAULT_SERVER_URL, load_config, save_config};
use std::fs;
use std::path::{Path, PathBuf};
use t8d_core::{T8dError, T8dResult};

pub const STATE_DIR_NAME: &str = ".t8d";

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_db_path: PathBuf,
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkspaceInitResult {
    pub paths: WorkspacePaths,
    pub created: Vec<PathBuf>,
    pub config: ClientConfig,
}

impl WorkspacePaths {
    pub fn from_root(root: PathBuf) -> Self {
        let state_dir = root.join(STATE_DIR_NAME);

        Self {
            config_path: state_dir.join("config.toml"),
            state_db_path: state_dir.join("state.db"),
            logs_dir: state_dir.join("logs"),
            root,
            state_dir,
        }
    }
}

/// Creates the `.t8d/` layout under `target` (or the current directory).
/// Re-running it keeps an existing config, only overriding the server URL
/// when one is passed.
pub fn init_workspace(
    target: Option<&Path>,
    server: Option<&str>,
) -> T8dResult<WorkspaceInitResult> {
    let root = match target {
        Some(path) => absolutize(path)?,
        None => std::env::current_dir().map_err(|err| {
            T8dError::io(format!(
                "failed to resolve current directory for init: {err}"
            ))
        })?,
    };

    let paths = WorkspacePaths::from_root(root);
    let mut created = Vec::new();

    ensure_dir(&paths.root, &mut created)?;
    ensure_dir(&paths.state_dir, &mut created)?;
    ensure_dir(&paths.logs_dir, &mut created)?;

    let config = if paths.config_path.exists() {
        let mut config = load_config(&paths)?;
        if let Some(server) = server {
            config.server.url = server.to_string();
            save_config(&paths, &config)?;
        }
        config
    } else {
        let config = ClientConfig::with_server(server.unwrap_or(DEFAULT_SERVER_URL));
        save_config(&paths, &config)?;
        created.push(paths.config_path.clone());
        config
    };

    Ok(WorkspaceInitResult {
        paths,
        created,
        config,
    })
}

pub fn resolve_workspace(explicit: Option<&Path>) -> T8dResult<WorkspacePaths> {
    let root = match explicit {
        Some(path) => absolutize(path)?,
        None => std::env::current_dir().map_err(|err| {
            T8dError::io(format!(
                "failed to resolve current directory for workspace lookup: {err}"
            ))
        })?,
    };

    let paths = WorkspacePaths::from_root(root);
    if !paths.state_dir.is_dir() {
        let root_display = paths.root.display();
        return Err(T8dError::usage(format!(
            "workspace is not initialized at '{root_display}'; run `t8d init --workspace {root_display}` first"
        )));
    }

    Ok(paths)
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

fn ensure_dir(path: &Path, created: &mut Vec<PathBuf>) -> T8dResult<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(T8dError::io(format!(
                "expected '{}' to be a directory",
                path.display()
            )));
        }
        return Ok(());
    }

    fs::create_dir_all(path).map_err(|err| {
        T8dError::io(format!(
            "failed to create directory '{}': {}",
            path.display(),
            err
        ))
    })?;
    created.push(path.to_path_buf());
    Ok(())
}
