use crate::workspace::WorkspacePaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use t8d_core::{T8dError, T8dResult};

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_url")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Seconds between timer-driven rounds in `sync watch`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Listen for pokes on the realtime channel.
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_realtime() -> bool {
    true
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            realtime: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerSection::default(),
            sync: SyncSection::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_server(url: impl Into<String>) -> Self {
        Self {
            server: ServerSection { url: url.into() },
            ..Self::default()
        }
    }

    pub fn ensure_defaults(&mut self) {
        if self.version == 0 {
            self.version = CONFIG_VERSION;
        }
        if self.server.url.trim().is_empty() {
            self.server.url = DEFAULT_SERVER_URL.to_string();
        }
        if self.sync.interval_secs == 0 {
            self.sync.interval_secs = DEFAULT_INTERVAL_SECS;
        }
        if self.sync.request_timeout_secs == 0 {
            self.sync.request_timeout_secs = DEFAULT_REQUEST_TIMEOUT_SECS;
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }
}

pub fn load_config(paths: &WorkspacePaths) -> T8dResult<ClientConfig> {
    let contents = fs::read_to_string(&paths.config_path).map_err(|err| {
        T8dError::io(format!(
            "failed to read workspace config '{}': {}",
            paths.config_path.display(),
            err
        ))
    })?;

    let mut config: ClientConfig = toml::from_str(&contents).map_err(|err| {
        T8dError::io(format!(
            "failed to parse workspace config '{}': {}",
            paths.config_path.display(),
            err
        ))
    })?;
    config.ensure_defaults();
    Ok(config)
}

pub fn save_config(paths: &WorkspacePaths, config: &ClientConfig) -> T8dResult<()> {
    let serialized = toml::to_string_pretty(config)
        .map_err(|err| T8dError::io(format!("failed to encode config.toml: {err}")))?;

    fs::write(&paths.config_path, serialized).map_err(|err| {
        T8dError::io(format!(
            "failed to write workspace config '{}': {}",
            paths.config_path.display(),
            err
        ))
    })
}

/// Server URL for one invocation; an explicit override beats the config.
pub fn resolve_server_url(config: &ClientConfig, server_override: Option<&str>) -> T8dResult<String> {
    let candidate = server_override
        .unwrap_or(config.server.url.as_str())
        .trim()
        .trim_end_matches('/');

    if !(candidate.starts_with("http://") || candidate.starts_with("https://")) {
        return Err(T8dError::usage(format!(
            "server URL '{candidate}' must start with http:// or https://"
        )));
    }

    Ok(candidate.to_string())
}
