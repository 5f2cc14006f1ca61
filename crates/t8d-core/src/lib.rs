mod error;
pub mod hash;
pub mod model;
pub mod time;
pub mod tree;

pub use error::{ErrorKind, ExitCode, T8dError, T8dResult, ValidationIssue};
pub use hash::Fingerprint;
pub use model::{EntityKind, Task, TaskList, TaskStatus, Versioned, incoming_wins};
pub use time::Millis;
pub use tree::{DeletePlan, TaskTree, parents_first};
