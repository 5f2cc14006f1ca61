use serde_json::json;
use t8d_core::{ExitCode, T8dResult};
use t8d_fs::{init_workspace, resolve_workspace, run_doctor};

use crate::{GlobalOptions, print_json, workspace_target};

pub(crate) fn cmd_init(globals: &GlobalOptions) -> T8dResult<ExitCode> {
    let target = workspace_target(globals)?;
    let result = init_workspace(Some(&target), globals.server.as_deref())?;

    if globals.json {
        print_json(&json!({
            "ok": true,
            "result": {
                "workspace": result.paths.root.display().to_string(),
                "server": result.config.server.url,
                "created": result
                    .created
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>(),
            }
        }))?;
    } else {
        println!("Workspace: {}", result.paths.root.display());
        println!("Server: {}", result.config.server.url);
        if result.created.is_empty() {
            println!("Already initialized.");
        } else {
            for path in &result.created {
                println!("created {}", path.display());
            }
        }
    }

    Ok(ExitCode::Success)
}

/// Exits with the I/O code when any check fails.
pub(crate) fn cmd_doctor(globals: &GlobalOptions) -> T8dResult<ExitCode> {
    let target = workspace_target(globals)?;
    let paths = resolve_workspace(Some(&target))?;
    let report = run_doctor(&paths, globals.server.as_deref())?;

    if globals.json {
        print_json(&json!({"ok": report.healthy, "result": &report}))?;
    } else {
        println!("Workspace: {}", report.workspace);
        if let Some(server) = &report.server {
            println!("Server: {server}");
        }
        for check in &report.checks {
            let mark = if check.ok { "ok" } else { "FAIL" };
            println!("[{mark}] {} ({})", check.name, check.details);
        }
    }

    Ok(if report.healthy {
        ExitCode::Success
    } else {
        ExitCode::Io
    })
}
