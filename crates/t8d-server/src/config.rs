use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use t8d_core::{T8dError, T8dResult};

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_DATABASE: &str = "t8d-server.db";
pub const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub database: PathBuf,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn with_overrides(mut self, bind: Option<String>, database: Option<PathBuf>) -> Self {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        if let Some(database) = database {
            self.database = database;
        }
        self
    }

    pub fn bind_addr(&self) -> T8dResult<SocketAddr> {
        self.bind.parse::<SocketAddr>().map_err(|err| {
            T8dError::usage(format!("invalid bind address '{}': {err}", self.bind))
        })
    }
}

/// Loads the server config. An explicit path must exist; without one,
/// `server.toml` in the working directory is used when present and the
/// defaults otherwise.
pub fn load_server_config(explicit: Option<&Path>) -> T8dResult<ServerConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.is_file() {
                return Ok(ServerConfig::default());
            }
            fallback
        }
    };

    let raw = fs::read_to_string(&path).map_err(|err| {
        T8dError::io(format!(
            "failed to read server config '{}': {}",
            path.display(),
            err
        ))
    })?;

    let config = toml::from_str::<ServerConfig>(&raw).map_err(|err| {
        T8dError::usage(format!(
            "invalid server config '{}': {}",
            path.display(),
            err
        ))
    })?;

    if config.body_limit_bytes == 0 {
        return Err(T8dError::usage(format!(
            "invalid server config '{}': body_limit_bytes must be positive",
            path.display()
        )));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("server.toml");
        fs::write(&path, "bind = \"0.0.0.0:9000\"\n").expect("write");

        let config = load_server_config(Some(&path)).expect("load");
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.database, PathBuf::from(DEFAULT_DATABASE));
        assert_eq!(config.body_limit_bytes, DEFAULT_BODY_LIMIT_BYTES);
        assert_eq!(config.bind_addr().expect("addr").port(), 9000);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = load_server_config(Some(&temp.path().join("absent.toml"))).expect_err("missing");
        assert_eq!(error.kind, t8d_core::ErrorKind::Io);
    }

    #[test]
    fn overrides_replace_file_values() {
        let config = ServerConfig::default()
            .with_overrides(Some("127.0.0.1:1".to_string()), Some(PathBuf::from("x.db")));
        assert_eq!(config.bind, "127.0.0.1:1");
        assert_eq!(config.database, PathBuf::from("x.db"));
    }

    #[test]
    fn bad_bind_address_is_a_usage_error() {
        let config = ServerConfig::default().with_overrides(Some("nope".to_string()), None);
        assert_eq!(
            config.bind_addr().expect_err("bad addr").kind,
            t8d_core::ErrorKind::Usage
        );
    }
}
