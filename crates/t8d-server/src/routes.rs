use crate::auth::bearer_token;
use crate::realtime::{Session, SessionRegistry};
use crate::store::ServerStore;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use t8d_api::{
    BOOTSTRAP_PATH, BootstrapResponse, ErrorBody, HEALTH_PATH, REALTIME_PATH, RealtimeFrame,
    SYNC_PATH, SyncResponse, parse_sync_request,
};
use t8d_core::{ErrorKind, T8dError, T8dResult};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: ServerStore,
    pub sessions: SessionRegistry,
}

/// Error type for every handler; renders the shared `{message, errors}`
/// body with a status derived from the error kind.
#[derive(Debug)]
pub struct ApiError(pub T8dError);

impl From<T8dError> for ApiError {
    fn from(value: T8dError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(error) = self;
        let (status, body) = match error.kind {
            ErrorKind::Validation | ErrorKind::Usage => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    message: error.message,
                    errors: error.issues,
                },
            ),
            ErrorKind::Auth => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    message: error.message,
                    errors: Vec::new(),
                },
            ),
            ErrorKind::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    message: error.message,
                    errors: Vec::new(),
                },
            ),
            ErrorKind::Sync | ErrorKind::Io => {
                error!(kind = ?error.kind, error = %error.message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        message: "Internal server error".to_string(),
                        errors: Vec::new(),
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct RealtimeQuery {
    token: Option<String>,
}

pub fn router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route(SYNC_PATH, post(sync))
        .route(BOOTSTRAP_PATH, get(bootstrap))
        .route(REALTIME_PATH, get(realtime))
        .route(HEALTH_PATH, get(health))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncResponse>, ApiError> {
    let user_id = authenticate(&state, bearer_token(&headers)).await?;
    let request = parse_sync_request(&body)?;
    let socket_id = request.socket_id.clone();

    let store = state.store.clone();
    let merge_user = user_id.clone();
    let outcome = blocking(move || {
        store.merge(&merge_user, &request.changes, request.last_sync)
    })
    .await?;

    if outcome.applied() > 0 {
        let reached = state.sessions.notify(&user_id, socket_id.as_deref());
        debug!(user_id, reached, "poked realtime sessions");
    }

    Ok(Json(outcome.response))
}

async fn bootstrap(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BootstrapResponse>, ApiError> {
    let user_id = authenticate(&state, bearer_token(&headers)).await?;
    let store = state.store.clone();
    let snapshot = blocking(move || store.bootstrap(&user_id)).await?;
    Ok(Json(snapshot))
}

async fn realtime(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RealtimeQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).or(query.token.as_deref());
    let user_id = authenticate(&state, token).await?;

    let Some(session) = state.sessions.register(&user_id) else {
        return Ok(StatusCode::SERVICE_UNAVAILABLE.into_response());
    };

    Ok(upgrade.on_upgrade(move |socket| run_session(socket, session)))
}

async fn run_session(mut socket: WebSocket, mut session: Session) {
    info!(user_id = %session.user_id, session_id = %session.id, "realtime session opened");

    let hello = RealtimeFrame::Session {
        session_id: session.id.clone(),
    };
    if send_frame(&mut socket, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            poke = session.next_poke() => match poke {
                Some(()) => {
                    if send_frame(&mut socket, &RealtimeFrame::Poke).await.is_err() {
                        warn!(session_id = %session.id, "failed to deliver poke; dropping session");
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(user_id = %session.user_id, session_id = %session.id, "realtime session closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &RealtimeFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

async fn authenticate(state: &AppState, token: Option<&str>) -> Result<String, ApiError> {
    let Some(token) = token.map(str::to_string) else {
        return Err(T8dError::auth("missing bearer token").into());
    };

    let store = state.store.clone();
    blocking(move || store.authenticate(&token))
        .await?
        .ok_or_else(|| T8dError::auth("invalid bearer token").into())
}

/// SQLite work runs on the blocking pool so it never stalls the reactor.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T8dResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| T8dError::io(format!("storage worker failed: {err}")))?
        .map_err(ApiError::from)
}
