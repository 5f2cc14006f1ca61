use crate::engine::{RoundOutcome, SyncClient};
use crate::realtime::{RealtimeEvent, RealtimeListener};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchSummary {
    pub rounds: usize,
    pub failed_rounds: usize,
    pub pokes: usize,
    pub reconnects: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Poke,
    Reconnect,
}

/// Keeps a device in sync until `shutdown` flips.
///
/// Rounds run on a fixed interval, on every poke and after every realtime
/// (re)connect. With a listener the client counts as offline until the first
/// connect and whenever the channel drops, so timer rounds pause while the
/// server is unreachable.
pub async fn run_watch(
    client: &SyncClient,
    listener: Option<RealtimeListener>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> WatchSummary {
    let mut summary = WatchSummary::default();
    let (events_tx, mut events_rx) = mpsc::channel(16);

    let listener_task = listener.map(|listener| {
        client.set_online(false);
        tokio::spawn(listener.run(events_tx, shutdown.clone()))
    });

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => Trigger::Timer,
            event = events_rx.recv(), if listener_task.is_some() => match event {
                Some(RealtimeEvent::Connected { session_id }) => {
                    client.set_session_id(Some(session_id)).await;
                    client.set_online(true);
                    summary.reconnects += 1;
                    Trigger::Reconnect
                }
                Some(RealtimeEvent::Poke) => {
                    summary.pokes += 1;
                    Trigger::Poke
                }
                Some(RealtimeEvent::Disconnected { reason }) => {
                    if client.is_online() {
                        warn!(%reason, "realtime channel lost; pausing sync");
                    }
                    client.set_online(false);
                    client.set_session_id(None).await;
                    continue;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        match client.run_round().await {
            Ok(RoundOutcome::Completed(report)) => {
                summary.rounds += 1;
                info!(
                    trigger = ?trigger,
                    changed = report.applied.changed(),
                    "watch round complete"
                );
            }
            Ok(RoundOutcome::Skipped { .. }) => {}
            Err(error) => {
                summary.failed_rounds += 1;
                warn!(trigger = ?trigger, error = %error.message, "watch round failed; will retry on next trigger");
            }
        }
    }

    if let Some(task) = listener_task {
        task.abort();
    }
    client.set_session_id(None).await;

    summary
}
