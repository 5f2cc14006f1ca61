mod engine;
mod realtime;
mod todo;
mod watch;

pub use engine::{
    BootstrapReport, DEFAULT_MAX_RETRIES, RoundOutcome, RoundReport, SkipReason, SyncClient,
};
pub use realtime::{MAX_RECONNECT_DELAY, MIN_RECONNECT_DELAY, RealtimeEvent, RealtimeListener};
pub use todo::{ListPatch, NewList, NewTask, TaskChanges, TaskPatch, TodoService};
pub use watch::{WatchSummary, run_watch};
