mod auth;
mod config;
mod merge;
mod realtime;
mod routes;
mod store;

pub use auth::{bearer_token, generate_token, hash_token};
pub use config::{
    DEFAULT_BIND, DEFAULT_BODY_LIMIT_BYTES, DEFAULT_CONFIG_FILE, DEFAULT_DATABASE, ServerConfig,
    load_server_config,
};
pub use merge::MergeOutcome;
pub use realtime::{Session, SessionRegistry};
pub use routes::{ApiError, AppState, router};
pub use store::ServerStore;

use std::future::Future;
use t8d_core::{T8dError, T8dResult};
use tokio::net::TcpListener;
use tracing::info;

/// Opens the database, binds the configured address and serves until
/// `shutdown` resolves.
pub async fn serve<S>(config: &ServerConfig, shutdown: S) -> T8dResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = config.bind_addr()?;
    let state = AppState {
        store: ServerStore::open(&config.database)?,
        sessions: SessionRegistry::new(),
    };

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| T8dError::io(format!("failed to bind {addr}: {err}")))?;

    info!(
        %addr,
        database = %config.database.display(),
        "t8d-server listening"
    );

    serve_listener(listener, state, config.body_limit_bytes, shutdown).await
}

/// Serves on an already bound listener. On shutdown the session registry
/// is closed so open realtime connections end instead of holding the
/// server open.
pub async fn serve_listener<S>(
    listener: TcpListener,
    state: AppState,
    body_limit_bytes: usize,
    shutdown: S,
) -> T8dResult<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let sessions = state.sessions.clone();
    let app = router(state, body_limit_bytes);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested; closing realtime sessions");
            sessions.close_all();
        })
        .await
        .map_err(|err| T8dError::io(format!("server stopped with error: {err}")))
}
