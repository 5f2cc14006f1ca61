use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use t8d_api::{RejectedRow, SyncApi, SyncChanges, SyncRequest};
use t8d_core::time::{Millis, now_millis};
use t8d_core::{ErrorKind, T8dError, T8dResult, parents_first};
use t8d_store::{ApplySummary, LocalStore, RemoteApply, RoundStatus};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Offline,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub pushed_lists: usize,
    pub pushed_tasks: usize,
    /// Outbox entries folded into a newer entry for the same row.
    pub collapsed: usize,
    pub applied: ApplySummary,
    pub rejected: Vec<RejectedRow>,
    pub watermark: Millis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    Skipped { reason: SkipReason },
    Completed(RoundReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub lists: usize,
    pub tasks: usize,
    pub applied: ApplySummary,
    pub watermark: Millis,
}

/// Runs sync rounds for one device.
///
/// At most one round (or bootstrap) runs at a time per client; a trigger
/// that arrives while one is in flight is dropped, since the next round
/// picks up whatever was queued meanwhile.
#[derive(Debug)]
pub struct SyncClient {
    api: SyncApi,
    store: LocalStore,
    token: String,
    max_retries: u32,
    syncing: AtomicBool,
    online: AtomicBool,
    session_id: RwLock<Option<String>>,
}

struct RoundGuard<'a>(&'a AtomicBool);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncClient {
    pub fn new(api: SyncApi, store: LocalStore, token: impl Into<String>) -> Self {
        Self {
            api,
            store,
            token: token.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            syncing: AtomicBool::new(false),
            online: AtomicBool::new(true),
            session_id: RwLock::new(None),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn api(&self) -> &SyncApi {
        &self.api
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub async fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write().await = session_id;
    }

    /// Switches sync on. A device that never completed a round first queues
    /// all of its local rows.
    pub async fn enable_sync(&self) -> T8dResult<RoundOutcome> {
        self.store.set_sync_enabled(true)?;
        if self.store.watermark()?.is_none() {
            let queued = self.store.enqueue_all()?;
            info!(queued, "queued local rows for first sync");
        }
        self.run_round().await
    }

    pub fn disable_sync(&self) -> T8dResult<()> {
        self.store.set_sync_enabled(false)
    }

    pub async fn run_round(&self) -> T8dResult<RoundOutcome> {
        if !self.store.sync_enabled()? {
            return Ok(RoundOutcome::Skipped {
                reason: SkipReason::Disabled,
            });
        }
        if !self.is_online() {
            return Ok(RoundOutcome::Skipped {
                reason: SkipReason::Offline,
            });
        }
        let Some(_guard) = self.try_begin() else {
            debug!("sync round already in progress; trigger dropped");
            return Ok(RoundOutcome::Skipped {
                reason: SkipReason::InProgress,
            });
        };

        let result = self.round().await;
        self.record_outcome(&result)?;
        result.map(RoundOutcome::Completed)
    }

    /// Pulls the full snapshot and applies it. Local rows still pending in
    /// the outbox survive if they are newer than the server's copy.
    pub async fn bootstrap(&self) -> T8dResult<BootstrapReport> {
        let Some(_guard) = self.try_begin() else {
            return Err(T8dError::sync("a sync round is already in progress"));
        };

        let token = self.require_token()?;
        let snapshot = self
            .request_with_retry(|| self.api.bootstrap(token))
            .await?;

        let applied = self.store.apply_remote(&RemoteApply {
            lists: &snapshot.lists,
            tasks: &parents_first(snapshot.tasks.clone()),
            watermark: snapshot.timestamp,
            ..RemoteApply::default()
        })?;

        info!(
            lists = snapshot.lists.len(),
            tasks = snapshot.tasks.len(),
            watermark = snapshot.timestamp,
            "bootstrap applied"
        );

        Ok(BootstrapReport {
            lists: snapshot.lists.len(),
            tasks: snapshot.tasks.len(),
            applied,
            watermark: snapshot.timestamp,
        })
    }

    async fn round(&self) -> T8dResult<RoundReport> {
        let token = self.require_token()?;
        let pending = self.store.collect_pending()?;
        let last_sync = self.store.watermark()?;

        let request = SyncRequest {
            changes: SyncChanges {
                task_lists: pending.lists(),
                tasks: parents_first(pending.tasks()),
            },
            last_sync,
            socket_id: self.session_id().await,
        };

        debug!(
            lists = request.changes.task_lists.len(),
            tasks = request.changes.tasks.len(),
            last_sync = ?last_sync,
            "sending sync request"
        );

        let response = self
            .request_with_retry(|| self.api.sync(token, &request))
            .await?;

        for row in &response.rejected {
            warn!(id = %row.id, kind = %row.kind, reason = %row.reason, "server rejected row");
        }

        let forced: HashSet<_> = response
            .rejected
            .iter()
            .map(|row| (row.kind, row.id.clone()))
            .collect();

        let applied = self.store.apply_remote(&RemoteApply {
            lists: &response.changes.task_lists,
            tasks: &response.changes.tasks,
            forced,
            clear_up_to: pending.max_seq,
            watermark: response.timestamp,
        })?;

        let report = RoundReport {
            pushed_lists: request.changes.task_lists.len(),
            pushed_tasks: request.changes.tasks.len(),
            collapsed: pending.raw_count - pending.entries.len(),
            applied,
            rejected: response.rejected,
            watermark: response.timestamp,
        };

        info!(
            pushed = report.pushed_lists + report.pushed_tasks,
            pulled = response.changes.len(),
            changed = report.applied.changed(),
            rejected = report.rejected.len(),
            watermark = report.watermark,
            "sync round complete"
        );

        Ok(report)
    }

    fn try_begin(&self) -> Option<RoundGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RoundGuard(&self.syncing))
    }

    fn require_token(&self) -> T8dResult<&str> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err(T8dError::auth(
                "no bearer token configured; run `t8d auth login --token <token>` or set T8D_TOKEN",
            ));
        }
        Ok(token)
    }

    fn record_outcome(&self, result: &T8dResult<RoundReport>) -> T8dResult<()> {
        match result {
            Ok(_) => self.store.mark_round(now_millis(), RoundStatus::Ok, None),
            Err(error) => {
                warn!(kind = ?error.kind, error = %error.message, "sync round failed");
                self.store
                    .mark_round(now_millis(), RoundStatus::Failed, Some(&error.message))
            }
        }
    }

    async fn request_with_retry<T, F, Fut>(&self, mut call: F) -> T8dResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T8dResult<T>>,
    {
        let mut attempt = 0u32;

        loop {
            let error = match call().await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let wait = match retry_wait(attempt, &error) {
                Some(wait) if attempt < self.max_retries => wait,
                _ => return Err(error),
            };
            debug!(attempt, wait_ms = wait.as_millis() as u64, error = %error.message, "resending sync request");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

const FIRST_RETRY_WAIT: Duration = Duration::from_millis(250);
const MAX_RETRY_WAIT: Duration = Duration::from_secs(16);

/// How long to wait before resending after `error`, or `None` when resending
/// cannot help. Only network failures, 5xx and 429 are transient; a server
/// asking for a longer pause via `Retry-After` gets it.
fn retry_wait(attempt: u32, error: &T8dError) -> Option<Duration> {
    if error.kind != ErrorKind::Sync {
        return None;
    }

    let transient = error.message.contains("network request failed")
        || tag_value::<u16>(&error.message, "http_status")
            .is_some_and(|status| status >= 500 || status == 429);
    if !transient {
        return None;
    }

    let backoff = FIRST_RETRY_WAIT
        .saturating_mul(1 << attempt.min(6))
        .min(MAX_RETRY_WAIT);
    let requested = tag_value::<u64>(&error.message, "retry_after_seconds")
        .map(Duration::from_secs)
        .unwrap_or_default();

    Some(backoff.max(requested))
}

/// Reads a `[name=value]` tag that the API client appends to error messages.
fn tag_value<T: std::str::FromStr>(message: &str, name: &str) -> Option<T> {
    let marker = format!("[{name}=");
    let rest = &message[message.find(&marker)? + marker.len()..];
    rest[..rest.find(']')?].parse().ok()
}
