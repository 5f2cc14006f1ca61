use crate::config::{load_config, resolve_server_url};
use crate::workspace::WorkspacePaths;
use serde::Serialize;
use std::path::Path;
use t8d_core::T8dResult;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub workspace: String,
    pub healthy: bool,
    pub checks: Vec<DoctorCheck>,
    pub server: Option<String>,
}

fn path_check(name: &str, ok: bool, path: &Path) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        ok,
        details: path.display().to_string(),
    }
}

/// Inspects the workspace layout and config. The state database is optional
/// until the first command that touches local data.
pub fn run_doctor(paths: &WorkspacePaths, server_override: Option<&str>) -> T8dResult<DoctorReport> {
    let mut checks = vec![
        path_check("workspace_root", paths.root.is_dir(), &paths.root),
        path_check("state_directory", paths.state_dir.is_dir(), &paths.state_dir),
        path_check("logs_directory", paths.logs_dir.is_dir(), &paths.logs_dir),
        path_check("config_file", paths.config_path.is_file(), &paths.config_path),
        path_check(
            "state_db_file",
            !paths.state_db_path.exists() || paths.state_db_path.is_file(),
            &paths.state_db_path,
        ),
    ];

    let mut server = None;

    if paths.config_path.is_file() {
        match load_config(paths) {
            Ok(config) => {
                match resolve_server_url(&config, server_override) {
                    Ok(url) => {
                        server = Some(url.clone());
                        checks.push(DoctorCheck {
                            name: "server_url".to_string(),
                            ok: true,
                            details: url,
                        });
                    }
                    Err(err) => checks.push(DoctorCheck {
                        name: "server_url".to_string(),
                        ok: false,
                        details: err.message,
                    }),
                }
                checks.push(DoctorCheck {
                    name: "sync_settings".to_string(),
                    ok: true,
                    details: format!(
                        "interval={}s timeout={}s retries={} realtime={}",
                        config.sync.interval_secs,
                        config.sync.request_timeout_secs,
                        config.sync.max_retries,
                        config.sync.realtime
                    ),
                });
            }
            Err(err) => checks.push(DoctorCheck {
                name: "config_parse".to_string(),
                ok: false,
                details: err.message,
            }),
        }
    }

    let healthy = checks.iter().all(|check| check.ok);

    Ok(DoctorReport {
        workspace: paths.root.display().to_string(),
        healthy,
        checks,
        server,
    })
}
