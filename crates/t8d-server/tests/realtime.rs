mod common;

use common::{PATIENCE, Running};
use futures_util::StreamExt;
use std::time::Duration;
use t8d_api::{RealtimeFrame, SyncChanges, SyncRequest};
use t8d_core::TaskList;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUIET: Duration = Duration::from_millis(300);

async fn connect(server: &Running, token: &str) -> (Socket, String) {
    let mut request = format!("ws://{}/realtime", server.addr)
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
    );
    let (mut socket, _) = connect_async(request).await.expect("connect");
    let session_id = match next_frame(&mut socket).await {
        Some(RealtimeFrame::Session { session_id }) => session_id,
        other => panic!("expected session frame, got {other:?}"),
    };
    (socket, session_id)
}

async fn next_frame(socket: &mut Socket) -> Option<RealtimeFrame> {
    loop {
        match tokio::time::timeout(PATIENCE, socket.next()).await.ok()?? {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(&text).expect("frame json"));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn stays_quiet(socket: &mut Socket) -> bool {
    tokio::time::timeout(QUIET, socket.next()).await.is_err()
}

fn one_list(id: &str) -> SyncRequest {
    SyncRequest {
        changes: SyncChanges {
            task_lists: vec![TaskList {
                id: id.to_string(),
                name: "Shared".to_string(),
                description: None,
                order: 0.0,
                last_modified: 1_000,
                hash: "a".to_string(),
                is_deleted: false,
            }],
            tasks: Vec::new(),
        },
        ..SyncRequest::default()
    }
}

#[tokio::test]
async fn push_pokes_other_sessions_of_the_same_user_only() {
    let server = Running::start().await;
    let (mut pusher, pusher_id) = connect(&server, &server.alice).await;
    let (mut sibling, _) = connect(&server, &server.alice).await;
    let (mut stranger, _) = connect(&server, &server.bob).await;

    let mut request = one_list("l1");
    request.socket_id = Some(pusher_id);
    server.api().sync(&server.alice, &request).await.expect("sync");

    assert_eq!(next_frame(&mut sibling).await, Some(RealtimeFrame::Poke));
    assert!(stays_quiet(&mut pusher).await);
    assert!(stays_quiet(&mut stranger).await);

    server.stop().await;
}

#[tokio::test]
async fn push_that_changes_nothing_pokes_nobody() {
    let server = Running::start().await;
    let (mut sibling, _) = connect(&server, &server.alice).await;

    server
        .api()
        .sync(&server.alice, &SyncRequest::default())
        .await
        .expect("empty sync");

    assert!(stays_quiet(&mut sibling).await);
    server.stop().await;
}

#[tokio::test]
async fn token_may_be_passed_as_query_parameter() {
    let server = Running::start().await;
    let url = format!("ws://{}/realtime?token={}", server.addr, server.alice);
    let (mut socket, _) = connect_async(url).await.expect("connect");
    assert!(matches!(
        next_frame(&mut socket).await,
        Some(RealtimeFrame::Session { .. })
    ));
    server.stop().await;
}

#[tokio::test]
async fn handshake_with_bad_token_is_refused() {
    let server = Running::start().await;
    let url = format!("ws://{}/realtime?token=forged", server.addr);
    assert!(connect_async(url).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let server = Running::start().await;
    let (mut socket, _) = connect(&server, &server.alice).await;

    server.stop().await;
    assert_eq!(next_frame(&mut socket).await, None);
}
