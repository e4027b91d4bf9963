//! Configuration for order-mask construction.
//!
//! Settings are plain serde structs with defaults matching the standard SOSS
//! reduction, so a JSON config file only needs the fields it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::isolate::IsolateConfig;

/// Errors that can occur while loading or saving a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// What to do with a column whose fit fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFailurePolicy {
    /// Stop the build and report the first failing column
    #[default]
    Abort,
    /// Exclude the column from both order masks and record it as failed
    ExcludeColumn,
}

/// Settings for building full-frame order masks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskBuildConfig {
    /// Per-column fit settings
    pub isolate: IsolateConfig,
    /// Worker threads for column fits; 0 uses every available CPU
    pub n_jobs: usize,
    pub failure_policy: FitFailurePolicy,
    /// Draw a progress bar on stderr while fitting
    pub show_progress: bool,
}

impl Default for MaskBuildConfig {
    fn default() -> Self {
        Self {
            isolate: IsolateConfig::default(),
            n_jobs: 4,
            failure_policy: FitFailurePolicy::Abort,
            show_progress: false,
        }
    }
}

impl MaskBuildConfig {
    /// Number of worker threads to start
    pub fn worker_threads(&self) -> usize {
        if self.n_jobs == 0 {
            num_cpus::get()
        } else {
            self.n_jobs
        }
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from JSON file; missing fields take their default values
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
