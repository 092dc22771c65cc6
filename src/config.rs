// Configuration: YAML file with environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

pub const BACKEND_ENV: &str = "TASKTRACK_BACKEND";
pub const REMOTE_URL_ENV: &str = "TASKTRACK_REMOTE_URL";
pub const REMOTE_KEY_ENV: &str = "TASKTRACK_REMOTE_KEY";
pub const DATA_DIR_ENV: &str = "TASKTRACK_DATA_DIR";

/// Which backend the app talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON file on this machine, no network.
    #[default]
    Local,
    /// Hosted REST collaborator.
    Remote,
}

impl FromStr for BackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            _ => Err(()),
        }
    }
}

/// Connection settings for the hosted backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    /// Where the local kv file lives. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Remote backend selected but remote.url is not configured")]
    MissingRemoteUrl,
}

impl Config {
    /// `<config_dir>/tasktrack/config.yaml`, when the platform has a config
    /// dir at all.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tasktrack").join("config.yaml"))
    }

    /// Load from `path` (or the default location), then apply environment
    /// overrides. A missing file yields the defaults; a malformed file is an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        let mut config = match path {
            Some(ref path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let config = Self::from_yaml(path, &raw)?;
                debug!(file = ?path, "Loaded config");
                config
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment wins over the file. `get` is injected so tests never
    /// touch the process environment.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = get(BACKEND_ENV) {
            match raw.parse::<BackendKind>() {
                Ok(kind) => self.backend = kind,
                Err(()) => warn!(value = %raw, "Ignoring invalid {}", BACKEND_ENV),
            }
        }
        if let Some(url) = get(REMOTE_URL_ENV) {
            self.remote.get_or_insert_with(RemoteSettings::default).url = url;
        }
        if let Some(key) = get(REMOTE_KEY_ENV) {
            self.remote
                .get_or_insert_with(RemoteSettings::default)
                .anon_key = key;
        }
        if let Some(dir) = get(DATA_DIR_ENV) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Resolved data directory, falling back to the platform data dir and
    /// then the working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("tasktrack")))
            .unwrap_or_else(|| PathBuf::from(".tasktrack"))
    }

    /// The local backend's kv file.
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir().join("tasktrack.json")
    }

    /// Remote settings, required when `backend = remote`.
    pub fn remote_settings(&self) -> Result<&RemoteSettings, ConfigError> {
        self.remote
            .as_ref()
            .filter(|r| !r.url.is_empty())
            .ok_or(ConfigError::MissingRemoteUrl)
    }
}
