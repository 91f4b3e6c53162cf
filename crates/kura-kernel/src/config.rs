//! TOML configuration.
//!
//! ```toml
//! [tasks]
//! max_concurrency = 4
//!
//! [cache]
//! list_ttl_secs = 1800
//!
//! [search]
//! enabled = true
//! auto_update = true
//!
//! [sign]
//! secret = "change me"
//! link_expiration_hours = 0     # 0: links never expire
//!
//! [[mounts]]
//! id = "films"
//! path = "/media/films"
//! driver = "local"
//! order = 0
//! options = { root = "/srv/films" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ops::DEFAULT_LIST_TTL;
use crate::tasks::DEFAULT_MAX_CONCURRENCY;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KuraConfig {
    pub tasks: TasksConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub sign: SignConfig,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Maximum concurrently running tasks.
    pub max_concurrency: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Lifetime of a cached directory listing, in seconds.
    pub list_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            list_ttl_secs: DEFAULT_LIST_TTL.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Install the in-process index.
    pub enabled: bool,
    /// Index every fresh listing.
    pub auto_update: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignConfig {
    /// Signing secret. Without one, signing is unavailable.
    pub secret: Option<String>,
    /// Signed link lifetime in hours; 0 means never expire.
    pub link_expiration_hours: u64,
}

impl SignConfig {
    pub fn link_expiration(&self) -> Option<Duration> {
        (self.link_expiration_hours > 0)
            .then(|| Duration::from_secs(self.link_expiration_hours * 3600))
    }
}

/// One `[[mounts]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    pub id: String,
    pub path: String,
    pub driver: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub only_proxy: bool,
    /// Passed to the driver as-is.
    #[serde(default)]
    pub options: toml::Table,
}

impl KuraConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&src)
    }

    /// `$XDG_CONFIG_HOME/kura/kura.toml`, or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kura").join("kura.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "tasks.max_concurrency must be at least 1".into(),
            ));
        }
        if self.sign.secret.as_deref() == Some("") {
            return Err(ConfigError::Invalid("sign.secret must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for mount in &self.mounts {
            if mount.id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount at {} has an empty id",
                    mount.path
                )));
            }
            if !mount.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "mount {}: path must be absolute, got {:?}",
                    mount.id, mount.path
                )));
            }
            if mount.driver.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount {}: driver is required",
                    mount.id
                )));
            }
            if !seen.insert(mount.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate mount id {}",
                    mount.id
                )));
            }
        }
        Ok(())
    }
}
