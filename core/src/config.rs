//! Engine configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::request::ParameterEncoding;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Root for persistent state; `cache/` and `frozen/` live beneath it.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            cache: CacheConfig::default(),
            transfer: TransferConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Target host and the defaults applied to every request built for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host name, e.g. `api.example.com`. Empty means requests must use
    /// absolute URLs.
    #[serde(default)]
    pub name: String,

    /// Path prefix prepended to relative request paths
    #[serde(default)]
    pub base_path: String,

    #[serde(default)]
    pub port: Option<u16>,

    /// Use https
    #[serde(default)]
    pub secure: bool,

    /// Headers added to every request
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub default_encoding: ParameterEncoding,
}

impl HostConfig {
    /// Absolute URL for `path`. Absolute URLs pass through unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || self.name.is_empty() {
            return path.to_string();
        }
        let scheme = if self.secure { "https" } else { "http" };
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        let mut segments = Vec::new();
        for part in [self.base_path.as_str(), path] {
            let trimmed = part.trim_matches('/');
            if !trimmed.is_empty() {
                segments.push(trimmed);
            }
        }
        format!("{scheme}://{}{port}/{}", self.name, segments.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disable both cache tiers entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entries kept in the memory tier
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Hard ceiling on how long an entry stays on disk, in seconds
    #[serde(default = "default_max_disk_age")]
    pub max_disk_age_secs: u64,

    /// Expiry for `AlwaysCache` responses without caching headers, in seconds
    #[serde(default = "default_expiry")]
    pub default_expiry_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_capacity: default_memory_capacity(),
            max_disk_age_secs: default_max_disk_age(),
            default_expiry_secs: default_expiry(),
        }
    }
}

impl CacheConfig {
    pub fn max_disk_age(&self) -> Duration {
        Duration::from_secs(self.max_disk_age_secs)
    }

    pub fn default_expiry(&self) -> chrono::Duration {
        let ceiling = crate::cache_headers::MAX_LIFETIME_SECS as u64;
        chrono::Duration::seconds(self.default_expiry_secs.min(ceiling) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Physical transfers running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-operation timeout in seconds, unless the request sets its own
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Authentication challenges answered before a 401 is final
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Defaults
fn default_true() -> bool { true }
fn default_memory_capacity() -> usize { 10 }
fn default_max_disk_age() -> u64 { 24 * 60 * 60 }
fn default_expiry() -> u64 { 60 }
fn default_max_concurrent() -> usize { 6 }
fn default_timeout() -> u64 { 30 }
fn default_max_auth_attempts() -> u32 { 3 }

fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("netkit")
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `NETKIT_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup("NETKIT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("NETKIT_MEMORY_CAPACITY") {
            self.cache.memory_capacity = parse_env("cache.memory_capacity", &v)?;
        }
        if let Some(v) = lookup("NETKIT_TIMEOUT_SECS") {
            self.transfer.timeout_secs = parse_env("transfer.timeout_secs", &v)?;
        }
        if let Some(v) = lookup("NETKIT_MAX_CONCURRENT") {
            self.transfer.max_concurrent = parse_env("transfer.max_concurrent", &v)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.memory_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.memory_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.transfer.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.max_concurrent",
                reason: "must be at least 1".into(),
            });
        }
        if self.transfer.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn frozen_dir(&self) -> PathBuf {
        self.data_dir.join("frozen")
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("{value:?}: {e}"),
    })
}
