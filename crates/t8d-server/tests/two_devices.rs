mod common;

use common::{Running, eventually};
use std::sync::Arc;
use std::time::Duration;
use t8d_fs::init_workspace;
use t8d_store::LocalStore;
use t8d_sync::{
    NewList, NewTask, RealtimeListener, RoundOutcome, SyncClient, TaskPatch, TodoService,
    run_watch,
};
use tokio::sync::watch;

struct Device {
    _temp: tempfile::TempDir,
    store: LocalStore,
    todo: TodoService,
    client: Arc<SyncClient>,
}

fn device(server: &Running, token: &str) -> Device {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = init_workspace(Some(&temp.path().join("ws")), Some(&server.base_url()))
        .expect("workspace");
    let store = LocalStore::from_workspace(&init.paths).expect("store");
    let client = SyncClient::new(server.api(), store.clone(), token).with_max_retries(0);
    Device {
        _temp: temp,
        todo: TodoService::new(store.clone()),
        store,
        client: Arc::new(client),
    }
}

fn completed(outcome: RoundOutcome) -> t8d_sync::RoundReport {
    match outcome {
        RoundOutcome::Completed(report) => report,
        RoundOutcome::Skipped { reason } => panic!("round skipped: {reason:?}"),
    }
}

#[tokio::test]
async fn offline_work_reaches_a_freshly_bootstrapped_device() {
    let server = Running::start().await;
    let phone = device(&server, &server.alice);
    let laptop = device(&server, &server.alice);

    let list = phone
        .todo
        .create_list(NewList {
            name: "Groceries".to_string(),
            ..NewList::default()
        })
        .expect("list");
    let milk = phone
        .todo
        .create_task(NewTask {
            list_id: list.id.clone(),
            name: "Buy milk".to_string(),
            ..NewTask::default()
        })
        .expect("task");
    phone
        .todo
        .create_task(NewTask {
            list_id: list.id.clone(),
            name: "Whole milk".to_string(),
            parent_id: Some(milk.id.clone()),
            ..NewTask::default()
        })
        .expect("subtask");

    let report = completed(phone.client.enable_sync().await.expect("enable"));
    assert_eq!(report.pushed_lists, 1);
    assert_eq!(report.pushed_tasks, 2);
    assert!(report.rejected.is_empty());
    assert_eq!(phone.store.pending_count().expect("pending"), 0);

    let snapshot = laptop.client.bootstrap().await.expect("bootstrap");
    assert_eq!(snapshot.lists, 1);
    assert_eq!(snapshot.tasks, 2);
    let laptop_tasks = laptop.todo.tasks(None).expect("tasks");
    assert!(laptop_tasks.iter().any(|task| task.name == "Buy milk"));
    assert!(
        laptop
            .store
            .watermark()
            .expect("watermark")
            .is_some()
    );

    server.stop().await;
}

#[tokio::test]
async fn edits_and_deletions_flow_both_ways() {
    let server = Running::start().await;
    let phone = device(&server, &server.alice);
    let laptop = device(&server, &server.alice);

    let list = phone
        .todo
        .create_list(NewList {
            name: "Chores".to_string(),
            ..NewList::default()
        })
        .expect("list");
    let task = phone
        .todo
        .create_task(NewTask {
            list_id: list.id.clone(),
            name: "Vacuum".to_string(),
            ..NewTask::default()
        })
        .expect("task");
    phone.client.enable_sync().await.expect("phone sync");

    laptop.client.bootstrap().await.expect("bootstrap");
    laptop.client.enable_sync().await.expect("laptop sync");

    laptop
        .todo
        .update_task(
            &task.id,
            TaskPatch {
                name: Some("Vacuum the stairs".to_string()),
                ..TaskPatch::default()
            },
        )
        .expect("edit");
    completed(laptop.client.run_round().await.expect("laptop push"));

    completed(phone.client.run_round().await.expect("phone pull"));
    let renamed = phone.store.get_task(&task.id).expect("get").expect("task");
    assert_eq!(renamed.name, "Vacuum the stairs");

    phone.todo.delete_list(&list.id).expect("delete list");
    completed(phone.client.run_round().await.expect("phone push"));
    completed(laptop.client.run_round().await.expect("laptop pull"));

    assert!(laptop.store.get_list(&list.id).expect("list").is_none());
    assert!(laptop.store.get_task(&task.id).expect("task").is_none());

    server.stop().await;
}

#[tokio::test]
async fn accounts_do_not_see_each_other() {
    let server = Running::start().await;
    let alice = device(&server, &server.alice);
    let bob = device(&server, &server.bob);

    alice
        .todo
        .create_list(NewList {
            name: "Private".to_string(),
            ..NewList::default()
        })
        .expect("list");
    alice.client.enable_sync().await.expect("alice sync");

    let snapshot = bob.client.bootstrap().await.expect("bob bootstrap");
    assert_eq!(snapshot.lists, 0);
    assert!(bob.todo.lists().expect("lists").is_empty());

    server.stop().await;
}

#[tokio::test]
async fn watching_device_follows_pokes() {
    let server = Running::start().await;
    let phone = device(&server, &server.alice);
    let laptop = device(&server, &server.alice);

    phone.client.enable_sync().await.expect("phone sync");
    laptop.client.enable_sync().await.expect("laptop sync");

    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = RealtimeListener::new(laptop.client.api().realtime_url(), server.alice.clone())
        .with_reconnect_delays(Duration::from_millis(50), Duration::from_millis(200));
    let watcher = {
        let client = Arc::clone(&laptop.client);
        tokio::spawn(async move {
            run_watch(&client, Some(listener), Duration::from_secs(3600), stop_rx).await
        })
    };

    assert!(eventually(|| server.sessions.session_count("alice") == 1).await);

    let list = phone
        .todo
        .create_list(NewList {
            name: "Pushed while watching".to_string(),
            ..NewList::default()
        })
        .expect("list");
    completed(phone.client.run_round().await.expect("phone push"));

    let laptop_store = laptop.store.clone();
    let list_id = list.id.clone();
    assert!(
        eventually(|| {
            laptop_store
                .get_list(&list_id)
                .map(|found| found.is_some())
                .unwrap_or(false)
        })
        .await
    );

    stop_tx.send(true).expect("stop watch");
    let summary = watcher.await.expect("watch task");
    assert!(summary.pokes >= 1);
    assert!(summary.reconnects >= 1);

    server.stop().await;
}
