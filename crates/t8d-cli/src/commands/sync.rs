use serde_json::json;
use std::time::Duration;
use t8d_core::time::to_iso;
use t8d_core::{ExitCode, T8dError, T8dResult};
use t8d_sync::{RealtimeListener, RoundOutcome, run_watch};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{GlobalOptions, SyncCommand, block_on, print_json, with_workspace};

pub(crate) fn cmd_sync(command: SyncCommand, globals: &GlobalOptions) -> T8dResult<ExitCode> {
    with_workspace(globals, |ctx| match command {
        SyncCommand::Run => {
            let outcome = block_on(ctx.sync_client()?.run_round())??;
            render_outcome(&outcome, globals)?;
            Ok(ExitCode::Success)
        }
        SyncCommand::Enable => {
            let client = ctx.sync_client()?;
            let outcome = block_on(client.enable_sync())??;
            if !globals.json {
                println!("Sync enabled.");
            }
            render_outcome(&outcome, globals)?;
            Ok(ExitCode::Success)
        }
        SyncCommand::Disable => {
            ctx.store.set_sync_enabled(false)?;
            if globals.json {
                print_json(&json!({"ok": true, "result": {"enabled": false}}))?;
            } else {
                println!("Sync disabled. Local changes are no longer queued.");
            }
            Ok(ExitCode::Success)
        }
        SyncCommand::Status => {
            let status = ctx.store.sync_status()?;
            let source = ctx.token()?.map(|(_, source)| source);

            if globals.json {
                print_json(&json!({
                    "ok": true,
                    "result": {
                        "server": ctx.server,
                        "token_source": source,
                        "status": status,
                    }
                }))?;
            } else {
                let when = |millis: Option<i64>| millis.map(to_iso).unwrap_or_else(|| "never".to_string());
                println!("Server: {}", ctx.server);
                println!("Sync enabled: {}", if status.enabled { "yes" } else { "no" });
                println!("Token: {}", if source.is_some() { "present" } else { "missing" });
                println!("Pending changes: {}", status.pending);
                println!("Watermark: {}", when(status.watermark));
                println!("Last round: {}", when(status.last_round_at));
                println!(
                    "Last status: {}",
                    status.last_round_status.as_deref().unwrap_or("unknown")
                );
                if let Some(error) = &status.last_error {
                    println!("Last error: {error}");
                }
            }

            Ok(ExitCode::Success)
        }
        SyncCommand::Bootstrap => {
            let report = block_on(ctx.sync_client()?.bootstrap())??;
            if globals.json {
                print_json(&json!({"ok": true, "result": report}))?;
            } else {
                println!(
                    "Bootstrapped {} list(s) and {} task(s) from {}",
                    report.lists, report.tasks, ctx.server
                );
                println!("Watermark: {}", to_iso(report.watermark));
            }
            Ok(ExitCode::Success)
        }
        SyncCommand::Watch {
            interval,
            no_realtime,
        } => {
            if !ctx.store.sync_enabled()? {
                return Err(T8dError::usage(
                    "sync is disabled; run `t8d sync enable` first",
                ));
            }

            let client = ctx.sync_client()?;
            let listener = match ctx.token()? {
                Some((token, _)) if ctx.config.sync.realtime && !no_realtime => {
                    Some(RealtimeListener::new(client.api().realtime_url(), token))
                }
                _ => None,
            };
            let interval = interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.config.interval());

            if !globals.json {
                println!("Watching {} (ctrl-c to stop)", ctx.server);
            }

            let summary = block_on(async {
                let (stop_tx, stop_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "failed to listen for ctrl-c; stopping watch");
                    }
                    let _ = stop_tx.send(true);
                });

                info!(interval_secs = interval.as_secs(), "watch started");
                run_watch(&client, listener, interval, stop_rx).await
            })?;

            if globals.json {
                print_json(&json!({"ok": true, "result": summary}))?;
            } else {
                println!(
                    "Stopped after {} round(s), {} failed, {} poke(s)",
                    summary.rounds, summary.failed_rounds, summary.pokes
                );
            }
            Ok(ExitCode::Success)
        }
    })
}

fn render_outcome(outcome: &RoundOutcome, globals: &GlobalOptions) -> T8dResult<()> {
    if globals.json {
        return print_json(&json!({"ok": true, "result": outcome}));
    }

    match outcome {
        RoundOutcome::Skipped { reason } => {
            println!("Round skipped: {}", skip_label(*reason));
        }
        RoundOutcome::Completed(report) => {
            println!(
                "Pushed {} list(s) and {} task(s); pulled {} change(s)",
                report.pushed_lists,
                report.pushed_tasks,
                report.applied.changed()
            );
            for row in &report.rejected {
                println!("  rejected {} {}: {}", row.kind, row.id, row.reason);
            }
            println!("Watermark: {}", to_iso(report.watermark));
        }
    }

    Ok(())
}

fn skip_label(reason: t8d_sync::SkipReason) -> &'static str {
    match reason {
        t8d_sync::SkipReason::Disabled => "sync is disabled",
        t8d_sync::SkipReason::Offline => "offline",
        t8d_sync::SkipReason::InProgress => "another round is running",
    }
}
