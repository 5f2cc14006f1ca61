mod config;
mod doctor;
mod workspace;

pub use config::{
    CONFIG_VERSION, ClientConfig, DEFAULT_INTERVAL_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SERVER_URL, ServerSection, SyncSection, load_config,
    resolve_server_url, save_config,
};
pub use doctor::{DoctorCheck, DoctorReport, run_doctor};
pub use workspace::{WorkspaceInitResult, WorkspacePaths, init_workspace, resolve_workspace};
