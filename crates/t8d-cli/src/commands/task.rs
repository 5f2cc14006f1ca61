use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use t8d_core::time::{Millis, parse_iso, to_iso};
use t8d_core::{ExitCode, T8dError, T8dResult, Task, TaskStatus};
use t8d_sync::{NewTask, TaskChanges, TaskPatch};

use crate::{GlobalOptions, TaskCommand, WorkspaceContext, print_json, short_id, with_workspace};

pub(crate) fn cmd_task(command: TaskCommand, globals: &GlobalOptions) -> T8dResult<ExitCode> {
    with_workspace(globals, |ctx| match command {
        TaskCommand::Add {
            list,
            name,
            parent,
            description,
            due,
        } => {
            let list_id = ctx.todo.resolve_list(&list)?;
            let parent_id = parent
                .map(|parent| ctx.todo.resolve_task(&parent))
                .transpose()?;
            let due_date = due.as_deref().map(parse_due).transpose()?;

            let task = ctx.todo.create_task(NewTask {
                list_id,
                name,
                description,
                parent_id,
                due_date,
                ..NewTask::default()
            })?;
            ctx.sync_after_change(globals)?;

            if globals.json {
                print_json(&json!({"ok": true, "result": task}))?;
            } else {
                println!("Created task {} {}", short_id(&task.id), task.name);
            }

            Ok(ExitCode::Success)
        }
        TaskCommand::Ls { list, open } => {
            let list_id = list.map(|list| ctx.todo.resolve_list(&list)).transpose()?;
            let mut tasks = ctx.todo.tasks(list_id.as_deref())?;
            if open {
                tasks.retain(|task| !task.is_completed());
            }

            if globals.json {
                print_json(&json!({"ok": true, "result": tasks}))?;
                return Ok(ExitCode::Success);
            }

            if tasks.is_empty() {
                println!("No tasks.");
            }
            for line in render_tree(&tasks) {
                println!("{line}");
            }

            Ok(ExitCode::Success)
        }
        TaskCommand::Edit {
            task,
            name,
            description,
            due,
            clear_due,
        } => {
            let id = ctx.todo.resolve_task(&task)?;
            let due_date = if clear_due {
                Some(None)
            } else {
                due.as_deref().map(parse_due).transpose()?.map(Some)
            };

            let changes = ctx.todo.update_task(
                &id,
                TaskPatch {
                    name,
                    description: description.map(Some),
                    due_date,
                    ..TaskPatch::default()
                },
            )?;
            report_changes(&ctx, globals, "Updated", &changes)
        }
        TaskCommand::Done { task } => {
            let id = ctx.todo.resolve_task(&task)?;
            let changes = ctx.todo.set_status(&id, TaskStatus::Completed)?;
            report_changes(&ctx, globals, "Completed", &changes)
        }
        TaskCommand::Undo { task } => {
            let id = ctx.todo.resolve_task(&task)?;
            let changes = ctx.todo.set_status(&id, TaskStatus::NotCompleted)?;
            report_changes(&ctx, globals, "Reopened", &changes)
        }
        TaskCommand::Move { task, parent, root } => {
            let id = ctx.todo.resolve_task(&task)?;
            let new_parent = match (parent, root) {
                (Some(parent), false) => Some(ctx.todo.resolve_task(&parent)?),
                (None, true) => None,
                _ => return Err(T8dError::usage("pass either --parent <task> or --root")),
            };

            let moved = ctx.todo.move_task(&id, new_parent.as_deref())?;
            ctx.sync_after_change(globals)?;

            if globals.json {
                print_json(&json!({"ok": true, "result": moved}))?;
            } else {
                match &moved.parent_id {
                    Some(parent_id) => println!(
                        "Moved {} under {}",
                        short_id(&moved.id),
                        short_id(parent_id)
                    ),
                    None => println!("Moved {} to the top level", short_id(&moved.id)),
                }
            }

            Ok(ExitCode::Success)
        }
        TaskCommand::Delete { task } => {
            let id = ctx.todo.resolve_task(&task)?;
            let changes = ctx.todo.delete_task(&id)?;
            report_changes(&ctx, globals, "Deleted", &changes)
        }
    })
}

fn report_changes(
    ctx: &WorkspaceContext,
    globals: &GlobalOptions,
    verb: &str,
    changes: &TaskChanges,
) -> T8dResult<ExitCode> {
    ctx.sync_after_change(globals)?;

    if globals.json {
        print_json(&json!({
            "ok": true,
            "result": {"updated": changes.updated, "removed": changes.removed}
        }))?;
        return Ok(ExitCode::Success);
    }

    let touched = changes.updated.len() + changes.removed.len();
    println!("{verb} {touched} task(s)");
    for task in &changes.updated {
        println!("  {} {}", short_id(&task.id), task.name);
    }
    for id in &changes.removed {
        println!("  {} (removed)", short_id(id));
    }

    Ok(ExitCode::Success)
}

/// Accepts a plain `YYYY-MM-DD` date (midnight UTC), an RFC 3339 timestamp
/// or integer milliseconds.
fn parse_due(input: &str) -> T8dResult<Millis> {
    if let Ok(date) = NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(Utc.from_utc_datetime(&midnight).timestamp_millis());
    }

    parse_iso(input).ok_or_else(|| {
        T8dError::usage(format!(
            "invalid due date '{input}'; use YYYY-MM-DD or an RFC 3339 timestamp"
        ))
    })
}

/// One line per task, children indented under their parent and siblings in
/// display order. A task whose parent is not in `tasks` is shown at the top.
fn render_tree(tasks: &[Task]) -> Vec<String> {
    let present: HashSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
    let mut children: HashMap<Option<&str>, Vec<&Task>> = HashMap::new();
    for task in tasks {
        let parent = task
            .parent_id
            .as_deref()
            .filter(|parent| present.contains(parent));
        children.entry(parent).or_default().push(task);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.order.total_cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    }

    let mut lines = Vec::with_capacity(tasks.len());
    let mut stack: Vec<(&Task, usize)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|task| (*task, 0)).collect())
        .unwrap_or_default();

    while let Some((task, depth)) = stack.pop() {
        let mark = if task.is_completed() { "x" } else { " " };
        let due = task
            .due_date
            .map(|due| format!("  (due {})", &to_iso(due)[..10]))
            .unwrap_or_default();
        lines.push(format!(
            "{}[{mark}] {}  {}{due}",
            "  ".repeat(depth),
            short_id(&task.id),
            task.name
        ));

        if let Some(kids) = children.get(&Some(task.id.as_str())) {
            stack.extend(kids.iter().rev().map(|kid| (*kid, depth + 1)));
        }
    }

    lines
}
