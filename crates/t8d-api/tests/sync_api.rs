use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;
use t8d_api::{SyncApi, SyncChanges, SyncRequest};
use t8d_core::{ErrorKind, Task, TaskStatus};

fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        name: "Water plants".to_string(),
        description: None,
        status: TaskStatus::NotCompleted,
        created_at: 1_704_067_200_000,
        last_modified: 1_704_067_200_000,
        due_date: None,
        list_id: "l1".to_string(),
        parent_id: None,
        order: 0.0,
        hash: "abc".to_string(),
        is_deleted: false,
        metadata: None,
    }
}

#[tokio::test]
async fn sync_posts_changes_with_bearer_token() {
    let server = MockServer::start_async().await;

    let sync = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/sync")
                .header("authorization", "Bearer secret-token")
                .json_body_partial(
                    r#"{"lastSync":"2024-01-01T00:00:00.000Z","socketId":"sock-9"}"#,
                );
            then.status(200).json_body(json!({
                "timestamp": "2024-01-01T00:00:05.000Z",
                "changes": {
                    "taskLists": [],
                    "tasks": [{
                        "id": "remote",
                        "name": "From phone",
                        "status": "completed",
                        "createdAt": "2024-01-01T00:00:01.000Z",
                        "lastModified": "2024-01-01T00:00:02.000Z",
                        "listId": "l1",
                        "parentId": null,
                        "order": 1,
                        "hash": "ff",
                        "is_deleted": false
                    }]
                }
            }));
        })
        .await;

    let api = SyncApi::new(&server.base_url()).expect("api client");
    let request = SyncRequest {
        changes: SyncChanges {
            task_lists: Vec::new(),
            tasks: vec![task("local")],
        },
        last_sync: Some(1_704_067_200_000),
        socket_id: Some("sock-9".to_string()),
    };
    let response = api.sync("secret-token", &request).await.expect("sync");

    sync.assert_hits_async(1).await;
    assert_eq!(response.timestamp, 1_704_067_205_000);
    assert_eq!(response.changes.tasks.len(), 1);
    assert_eq!(response.changes.tasks[0].status, TaskStatus::Completed);
    assert!(response.rejected.is_empty());
}

#[tokio::test]
async fn validation_failure_surfaces_field_issues() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/sync");
            then.status(400).json_body(json!({
                "message": "Invalid sync data",
                "errors": [{"path": "changes.tasks[0].name", "message": "must not be empty"}]
            }));
        })
        .await;

    let api = SyncApi::new(&server.base_url()).expect("api client");
    let error = api
        .sync("token", &SyncRequest::default())
        .await
        .expect_err("validation error");

    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.issues[0].path, "changes.tasks[0].name");
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/sync/bootstrap");
            then.status(401).json_body(json!({"message": "invalid token"}));
        })
        .await;

    let api = SyncApi::new(&server.base_url()).expect("api client");
    let error = api.bootstrap("stale").await.expect_err("auth error");

    assert_eq!(error.kind, ErrorKind::Auth);
    assert!(error.message.contains("[http_status=401]"));
}

#[tokio::test]
async fn missing_token_fails_before_any_request() {
    let server = MockServer::start_async().await;
    let sync = server
        .mock_async(|when, then| {
            when.method(POST).path("/sync");
            then.status(200);
        })
        .await;

    let api = SyncApi::new(&server.base_url()).expect("api client");
    let error = api
        .sync("  ", &SyncRequest::default())
        .await
        .expect_err("missing token");

    assert_eq!(error.kind, ErrorKind::Auth);
    sync.assert_hits_async(0).await;
}

#[tokio::test]
async fn bootstrap_and_health_parse() {
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({"status": "ok"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/sync/bootstrap")
                .header("authorization", "Bearer t");
            then.status(200).json_body(json!({
                "timestamp": 1_704_067_200_000i64,
                "lists": [{
                    "id": "l1",
                    "name": "Home",
                    "lastModified": "2024-01-01T00:00:00Z",
                    "hash": "h"
                }],
                "tasks": []
            }));
        })
        .await;

    let api = SyncApi::new(&server.base_url()).expect("api client");
    assert_eq!(api.health().await.expect("health").status, "ok");

    let snapshot = api.bootstrap("t").await.expect("bootstrap");
    assert_eq!(snapshot.timestamp, 1_704_067_200_000);
    assert_eq!(snapshot.lists[0].name, "Home");
    assert!(snapshot.tasks.is_empty());
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let api = SyncApi::new("http://127.0.0.1:9").expect("api client");
    let error = api.health().await.expect_err("network error");
    assert_eq!(error.kind, ErrorKind::Sync);
    assert!(error.message.starts_with("network request failed"));
}
