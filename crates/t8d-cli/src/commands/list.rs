use serde_json::json;
use t8d_core::{ExitCode, T8dResult};
use t8d_sync::{ListPatch, NewList};

use crate::{GlobalOptions, ListCommand, print_json, short_id, with_workspace};

pub(crate) fn cmd_list(command: ListCommand, globals: &GlobalOptions) -> T8dResult<ExitCode> {
    with_workspace(globals, |ctx| match command {
        ListCommand::Add { name, description } => {
            let list = ctx.todo.create_list(NewList {
                name,
                description,
                order: None,
            })?;
            ctx.sync_after_change(globals)?;

            if globals.json {
                print_json(&json!({"ok": true, "result": list}))?;
            } else {
                println!("Created list {} {}", short_id(&list.id), list.name);
            }

            Ok(ExitCode::Success)
        }
        ListCommand::Ls => {
            let lists = ctx.todo.lists()?;

            if globals.json {
                print_json(&json!({"ok": true, "result": lists}))?;
                return Ok(ExitCode::Success);
            }

            if lists.is_empty() {
                println!("No lists.");
            }
            for list in &lists {
                let tasks = ctx.todo.tasks(Some(&list.id))?;
                let open = tasks.iter().filter(|task| !task.is_completed()).count();
                println!(
                    "{}  {}  ({open} open / {} total)",
                    short_id(&list.id),
                    list.name,
                    tasks.len()
                );
            }

            Ok(ExitCode::Success)
        }
        ListCommand::Rename { list, name } => {
            let id = ctx.todo.resolve_list(&list)?;
            let list = ctx.todo.update_list(
                &id,
                ListPatch {
                    name: Some(name),
                    ..ListPatch::default()
                },
            )?;
            ctx.sync_after_change(globals)?;

            if globals.json {
                print_json(&json!({"ok": true, "result": list}))?;
            } else {
                println!("Renamed list {} to {}", short_id(&list.id), list.name);
            }

            Ok(ExitCode::Success)
        }
        ListCommand::Delete { list } => {
            let id = ctx.todo.resolve_list(&list)?;
            let changes = ctx.todo.delete_list(&id)?;
            ctx.sync_after_change(globals)?;

            if globals.json {
                print_json(&json!({
                    "ok": true,
                    "result": {"id": id, "removed_tasks": changes.removed}
                }))?;
            } else {
                println!(
                    "Deleted list {} and {} task(s)",
                    short_id(&id),
                    changes.removed.len()
                );
            }

            Ok(ExitCode::Success)
        }
    })
}
