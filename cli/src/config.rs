//! Loading the client configuration from `~/.tsbridge/config.toml`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use tsbridge_client::ClientConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tsbridge").join("config.toml"))
}

/// Load `path`, or the default location when `None`. A missing default
/// file yields the built-in defaults; a missing explicit file is an error.
pub fn load(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match config_path() {
            Some(path) => (path, false),
            None => return Ok(ClientConfig::default()),
        },
    };
    if !explicit && !path.exists() {
        return Ok(ClientConfig::default());
    }

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(source) => {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            return Err(ConfigError::Read { path, source });
        }
    };
    toml::from_str(&content).map_err(|source| {
        tracing::warn!("Failed to parse config at {:?}: {}", path, source);
        ConfigError::Parse { path, source }
    })
}
