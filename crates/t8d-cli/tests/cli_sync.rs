mod common;

use common::{base_command, init_workspace, run_json, run_json_with_token, temp_workspace};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;

const TOKEN: &str = "device-token";
const SERVER_TS: &str = "2024-01-01T00:00:10.000Z";
const SERVER_TS_MILLIS: i64 = 1_704_067_210_000;

fn empty_round() -> serde_json::Value {
    json!({
        "timestamp": SERVER_TS,
        "changes": {"taskLists": [], "tasks": []}
    })
}

#[test]
fn enabling_sync_pushes_offline_work() {
    let server = MockServer::start();
    let workspace = temp_workspace();
    init_workspace(&workspace.path, &server.base_url());

    run_json(&workspace.path, &["list", "add", "Written offline"]);

    let sync = server.mock(|when, then| {
        when.method(POST)
            .path("/sync")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body_contains("Written offline");
        then.status(200).json_body(empty_round());
    });

    let enabled = run_json_with_token(&workspace.path, TOKEN, &["sync", "enable"]);
    sync.assert_hits(1);
    assert_eq!(enabled["result"]["outcome"], "completed");
    assert_eq!(enabled["result"]["pushed_lists"], 1);

    let status = run_json(&workspace.path, &["sync", "status"]);
    assert_eq!(status["result"]["status"]["enabled"], true);
    assert_eq!(status["result"]["status"]["pending"], 0);
    assert_eq!(status["result"]["status"]["watermark"], SERVER_TS_MILLIS);
    assert_eq!(status["result"]["token_source"], serde_json::Value::Null);
}

#[test]
fn changes_sync_right_away_unless_offline() {
    let server = MockServer::start();
    let workspace = temp_workspace();
    init_workspace(&workspace.path, &server.base_url());
    run_json(&workspace.path, &["auth", "login", "--token", TOKEN]);

    let sync = server.mock(|when, then| {
        when.method(POST).path("/sync");
        then.status(200).json_body(empty_round());
    });
    run_json(&workspace.path, &["sync", "enable"]);
    sync.assert_hits(1);

    run_json(&workspace.path, &["list", "add", "Synced now"]);
    sync.assert_hits(2);

    run_json(&workspace.path, &["--offline", "list", "add", "Later"]);
    sync.assert_hits(2);
    let status = run_json(&workspace.path, &["sync", "status"]);
    assert_eq!(status["result"]["status"]["pending"], 1);
}

#[test]
fn failed_sync_after_a_change_keeps_the_change() {
    let server = MockServer::start();
    let workspace = temp_workspace();
    init_workspace(&workspace.path, &server.base_url());

    let mut ok = server.mock(|when, then| {
        when.method(POST).path("/sync");
        then.status(200).json_body(empty_round());
    });
    run_json_with_token(&workspace.path, TOKEN, &["sync", "enable"]);
    ok.assert_hits(1);
    ok.delete();

    let refused = server.mock(|when, then| {
        when.method(POST).path("/sync");
        then.status(401).json_body(json!({"message": "invalid bearer token"}));
    });

    let created = run_json_with_token(&workspace.path, TOKEN, &["list", "add", "Kept"]);
    assert_eq!(created["result"]["name"], "Kept");
    refused.assert_hits(1);

    let status = run_json(&workspace.path, &["sync", "status"]);
    assert_eq!(status["result"]["status"]["pending"], 1);
    assert_eq!(status["result"]["status"]["last_round_status"], "failed");
}

#[test]
fn unauthorized_round_exits_with_auth_code() {
    let server = MockServer::start();
    let workspace = temp_workspace();
    init_workspace(&workspace.path, &server.base_url());

    server.mock(|when, then| {
        when.method(POST).path("/sync");
        then.status(401).json_body(json!({"message": "invalid bearer token"}));
    });

    base_command(&workspace.path)
        .env(common::TOKEN_ENV, "revoked")
        .args(["sync", "enable"])
        .assert()
        .code(3);
}

#[test]
fn bootstrap_fills_an_empty_device() {
    let server = MockServer::start();
    let workspace = temp_workspace();
    init_workspace(&workspace.path, &server.base_url());

    let snapshot = server.mock(|when, then| {
        when.method(GET)
            .path("/sync/bootstrap")
            .header("authorization", format!("Bearer {TOKEN}"));
        then.status(200).json_body(json!({
            "timestamp": SERVER_TS,
            "lists": [{
                "id": "list-from-server",
                "name": "Shared",
                "lastModified": "2024-01-01T00:00:01.000Z",
                "hash": "h-list"
            }],
            "tasks": [{
                "id": "task-from-server",
                "name": "Call plumber",
                "status": "not_completed",
                "createdAt": "2024-01-01T00:00:01.000Z",
                "lastModified": "2024-01-01T00:00:01.000Z",
                "listId": "list-from-server",
                "parentId": null,
                "hash": "h-task"
            }]
        }));
    });

    let report = run_json_with_token(&workspace.path, TOKEN, &["sync", "bootstrap"]);
    snapshot.assert_hits(1);
    assert_eq!(report["result"]["lists"], 1);
    assert_eq!(report["result"]["tasks"], 1);
    assert_eq!(report["result"]["watermark"], SERVER_TS_MILLIS);

    let tasks = run_json(&workspace.path, &["task", "ls", "--list", "list-from"]);
    assert_eq!(tasks["result"][0]["name"], "Call plumber");
}

#[test]
fn disabling_sync_needs_no_server() {
    let workspace = temp_workspace();
    init_workspace(&workspace.path, "http://127.0.0.1:9");

    let disabled = run_json(&workspace.path, &["sync", "disable"]);
    assert_eq!(disabled["result"]["enabled"], false);

    base_command(&workspace.path)
        .args(["sync", "watch"])
        .env(common::TOKEN_ENV, TOKEN)
        .assert()
        .code(2);
}
