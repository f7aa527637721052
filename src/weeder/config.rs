//! Weeder configuration file.
//!
//! A single TOML file names the cache and repository directories, the
//! weeder's metadata directory, buffer sizes, and lease/landlord timing.
//! Every field has a default so a missing file still yields a usable
//! configuration rooted in the current directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::shortid::LeaseConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeederConfig {
    /// Directory holding the cache's graph log.
    pub graph_log_dir: PathBuf,
    /// Repository root (ShortId storage tree plus metadata log).
    pub repos_dir: PathBuf,
    /// Directory for the weeder's stable variables.
    pub weeder_md_dir: PathBuf,
    /// Capacity of the in-memory node buffer used while marking.
    pub node_buffer_size: usize,
    /// Capacity of the derived-index dedup table.
    pub di_buffer_size: usize,
    /// Subtracted from the recorded start time before marking, covering
    /// clock skew between weeder and repository.
    pub grace_period_secs: u64,
    pub lease_period_secs: u64,
    pub landlord_sleep_min_secs: u64,
    pub landlord_sleep_max_secs: u64,
    pub landlord_worklist_size: usize,
}

impl Default for WeederConfig {
    fn default() -> Self {
        let lease = LeaseConfig::default();
        WeederConfig {
            graph_log_dir: PathBuf::from("cache/graphlog"),
            repos_dir: PathBuf::from("repos"),
            weeder_md_dir: PathBuf::from("weeder"),
            node_buffer_size: 10_000,
            di_buffer_size: 1_000,
            grace_period_secs: 60,
            lease_period_secs: lease.lease_period_secs,
            landlord_sleep_min_secs: lease.landlord_sleep_min_secs,
            landlord_sleep_max_secs: lease.landlord_sleep_max_secs,
            landlord_worklist_size: lease.landlord_worklist_size,
        }
    }
}

impl WeederConfig {
    /// Loads the configuration from `explicit`, or from the default
    /// location (`<config dir>/poda/weeder.toml`); a missing file at the
    /// default location yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<WeederConfig, ConfigError> {
        let (path, required) = match explicit {
            Some(p) => (p, true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(WeederConfig::default()),
            },
        };
        if !path.exists() && !required {
            return Ok(WeederConfig::default());
        }
        Self::read_file(&path)
    }

    fn read_file(path: &Path) -> Result<WeederConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            lease_period_secs: self.lease_period_secs,
            landlord_sleep_min_secs: self.landlord_sleep_min_secs,
            landlord_sleep_max_secs: self.landlord_sleep_max_secs,
            landlord_worklist_size: self.landlord_worklist_size,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("poda").join("weeder.toml"))
}
