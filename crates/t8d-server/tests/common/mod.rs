#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use t8d_api::SyncApi;
use t8d_server::{AppState, ServerStore, SessionRegistry, serve_listener};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const PATIENCE: Duration = Duration::from_secs(5);

/// A server bound to an ephemeral port with two registered users.
pub struct Running {
    _temp: tempfile::TempDir,
    pub addr: SocketAddr,
    pub alice: String,
    pub bob: String,
    pub sessions: SessionRegistry,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Running {
    pub async fn start() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ServerStore::open(&temp.path().join("server.db")).expect("store");
        let alice = store.issue_token("alice").expect("alice");
        let bob = store.issue_token("bob").expect("bob");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let sessions = SessionRegistry::new();
        let state = AppState {
            store,
            sessions: sessions.clone(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            serve_listener(listener, state, 1024 * 1024, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve");
        });

        Self {
            _temp: temp,
            addr,
            alice,
            bob,
            sessions,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn api(&self) -> SyncApi {
        SyncApi::new(&self.base_url()).expect("api")
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        tokio::time::timeout(PATIENCE, self.handle)
            .await
            .expect("server stops")
            .expect("server task");
    }
}

/// Polls `check` until it holds or `PATIENCE` runs out.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
