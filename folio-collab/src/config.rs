//! Runtime configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! allowed_origins = ["https://folio.example.com"]
//!
//! [storage]
//! path = "/var/lib/folio"
//!
//! [engine]
//! kind = "http"
//! base_url = "http://merge-engine:8787"
//!
//! [snapshot]
//! interval_secs = 300
//!
//! [access.tokens]
//! "secret-token" = "alice"
//! ```
//!
//! | variable                | overrides                               |
//! |-------------------------|-----------------------------------------|
//! | `FOLIO_BIND_ADDR`       | `server.bind_addr`                      |
//! | `FOLIO_ALLOWED_ORIGINS` | `server.allowed_origins` (comma list)   |
//! | `FOLIO_DATA_DIR`        | `storage.path`                          |
//! | `FOLIO_ENGINE_URL`      | `engine.base_url`, sets `kind = "http"` |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::access::AccessConfig;
use crate::engine::{EngineConfig, EngineKind};
use crate::server::ServerConfig;
use crate::storage::StoreConfig;
use crate::worker::WorkerConfig;

pub const ENV_BIND_ADDR: &str = "FOLIO_BIND_ADDR";
pub const ENV_ALLOWED_ORIGINS: &str = "FOLIO_ALLOWED_ORIGINS";
pub const ENV_DATA_DIR: &str = "FOLIO_DATA_DIR";
pub const ENV_ENGINE_URL: &str = "FOLIO_ENGINE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StoreConfig,
    pub engine: EngineConfig,
    pub snapshot: WorkerConfig,
    pub indexing: WorkerConfig,
    pub access: AccessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StoreConfig::default(),
            engine: EngineConfig::default(),
            snapshot: WorkerConfig::snapshot_defaults(),
            indexing: WorkerConfig::indexing_defaults(),
            access: AccessConfig::default(),
        }
    }
}

/// On-disk shape. Worker sections are partial so one key can be changed
/// without restating the rest.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerConfig,
    storage: StoreConfig,
    engine: EngineConfig,
    snapshot: WorkerOverrides,
    indexing: WorkerOverrides,
    access: AccessConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct WorkerOverrides {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
    window_secs: Option<u64>,
    cycle_timeout_secs: Option<u64>,
}

impl WorkerOverrides {
    fn apply(self, base: WorkerConfig) -> WorkerConfig {
        WorkerConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            interval_secs: self.interval_secs.unwrap_or(base.interval_secs),
            window_secs: self.window_secs.unwrap_or(base.window_secs),
            cycle_timeout_secs: self.cycle_timeout_secs.unwrap_or(base.cycle_timeout_secs),
        }
    }
}

impl Config {
    /// Read `path` (or start from defaults), apply environment overrides and
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let config = Self::from_toml(&text)?;
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text. Missing sections and keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        Ok(Self {
            server: file.server,
            storage: file.storage,
            engine: file.engine,
            snapshot: file.snapshot.apply(WorkerConfig::snapshot_defaults()),
            indexing: file.indexing.apply(WorkerConfig::indexing_defaults()),
            access: file.access,
        })
    }

    /// Apply `FOLIO_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(addr) = set(ENV_BIND_ADDR) {
            self.server.bind_addr = addr;
        }
        if let Some(origins) = set(ENV_ALLOWED_ORIGINS) {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(dir) = set(ENV_DATA_DIR) {
            self.storage.path = PathBuf::from(dir);
        }
        if let Some(url) = set(ENV_ENGINE_URL) {
            self.engine.kind = EngineKind::Http;
            self.engine.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.queue_capacity == 0 {
            return Err(ConfigError::Invalid("server.queue_capacity must be positive".into()));
        }
        if self.engine.kind == EngineKind::Http && url::Url::parse(&self.engine.base_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "engine.base_url is not a valid URL: {}",
                self.engine.base_url
            )));
        }
        for (name, worker) in [("snapshot", &self.snapshot), ("indexing", &self.indexing)] {
            if worker.interval_secs == 0 {
                return Err(ConfigError::Invalid(format!("{name}.interval_secs must be positive")));
            }
            if worker.window_secs <= worker.interval_secs {
                return Err(ConfigError::Invalid(format!(
                    "{name}.window_secs ({}) must be wider than {name}.interval_secs ({})",
                    worker.window_secs, worker.interval_secs
                )));
            }
        }
        Ok(())
    }
}
