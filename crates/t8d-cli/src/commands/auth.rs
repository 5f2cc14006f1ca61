use serde_json::json;
use t8d_core::{ExitCode, T8dError, T8dResult};

use crate::{AuthCommand, GlobalOptions, TOKEN_ENV, print_json, with_workspace};

pub(crate) fn cmd_auth(command: AuthCommand, globals: &GlobalOptions) -> T8dResult<ExitCode> {
    with_workspace(globals, |ctx| match command {
        AuthCommand::Login { token } => {
            let token = token.trim();
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                return Err(T8dError::usage("token must be non-empty and contain no whitespace"));
            }

            ctx.store.set_credential(token)?;

            if globals.json {
                print_json(&json!({
                    "ok": true,
                    "result": {"server": ctx.server, "stored": true}
                }))?;
            } else {
                println!("Token saved for {}", ctx.server);
                println!("Stored in: {}", ctx.paths.state_db_path.display());
                if !ctx.store.sync_enabled()? {
                    println!("Run `t8d sync enable` to start syncing.");
                }
            }

            Ok(ExitCode::Success)
        }
        AuthCommand::Status => {
            let source = ctx.token()?.map(|(_, source)| source);

            if globals.json {
                print_json(&json!({
                    "ok": source.is_some(),
                    "result": {
                        "server": ctx.server,
                        "authenticated": source.is_some(),
                        "source": source,
                    }
                }))?;
            } else {
                println!("Server: {}", ctx.server);
                match source {
                    Some(source) => {
                        println!("Authenticated: yes");
                        println!("Token source: {}", source_label(source));
                    }
                    None => {
                        println!("Authenticated: no");
                        println!("Reason: no stored token and {TOKEN_ENV} is unset");
                    }
                }
            }

            Ok(if source.is_some() {
                ExitCode::Success
            } else {
                ExitCode::Auth
            })
        }
        AuthCommand::Logout => {
            let had_token = ctx.store.credential()?.is_some();
            ctx.store.clear_credential()?;

            if globals.json {
                print_json(&json!({"ok": true, "result": {"removed": had_token}}))?;
            } else if had_token {
                println!("Stored token removed.");
            } else {
                println!("No stored token.");
            }

            Ok(ExitCode::Success)
        }
    })
}

fn source_label(source: crate::TokenSource) -> &'static str {
    match source {
        crate::TokenSource::Env => TOKEN_ENV,
        crate::TokenSource::Workspace => "workspace",
    }
}
