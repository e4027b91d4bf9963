//! On-disk storage for computed artifacts.
//!
//! Order masks and wavelength-bin indices are expensive to compute and are
//! stored as JSON files in a cache directory (defaults to ~/.soss_trace/).
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never observes a partially written artifact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "SOSS_TRACE_CACHE";

const ORDER_MASKS_FILE: &str = "order_masks.json";
const WAVELENGTH_BINS_FILE: &str = "wavelength_bins.json";

/// Errors that can occur while reading or writing cache artifacts
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed cache artifact {path}: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Where a returned artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactOrigin {
    /// Loaded from an existing cache file
    Cache,
    /// Computed during this call
    #[default]
    Computed,
}

/// Cache directory manager for computed artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root_path: PathBuf,
}

impl ArtifactCache {
    /// Create a cache rooted at `$SOSS_TRACE_CACHE`, or `~/.soss_trace` when unset
    pub fn new() -> std::io::Result<Self> {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            return Ok(Self::with_path(PathBuf::from(dir)));
        }
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self::with_path(PathBuf::from(home).join(".soss_trace")))
    }

    /// Create a cache with a custom root directory
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Path of the stacked order 1 / order 2 mask artifact
    pub fn order_masks_path(&self) -> PathBuf {
        self.root_path.join(ORDER_MASKS_FILE)
    }

    /// Path of the per-order wavelength-bin artifact
    pub fn wavelength_bins_path(&self) -> PathBuf {
        self.root_path.join(WAVELENGTH_BINS_FILE)
    }

    /// Load an artifact.
    ///
    /// Returns `Ok(None)` if the file does not exist and `Err` if it exists but
    /// cannot be read or parsed.
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            CacheError::Format {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Some(value))
    }

    /// Save an artifact, replacing any previous file atomically.
    ///
    /// Creates the cache directory if it doesn't exist.
    pub fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CacheError> {
        let io_err = |source: std::io::Error| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = temporary_path(path);
        let file = File::create(&tmp_path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value).map_err(|source| CacheError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_err)?;
        drop(writer);

        std::fs::rename(&tmp_path, path).map_err(io_err)
    }

    /// Delete an artifact.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn remove(&self, path: &Path) -> std::io::Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".soss_trace")))
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    #[test]
    fn test_missing_artifact_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().to_path_buf());
        let loaded: Option<Vec<u8>> = cache.load(&cache.order_masks_path()).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_roundtrip_array() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().join("nested"));
        let data = Array2::from_shape_fn((4, 5), |(r, c)| ((r * 5 + c) % 2) as u8);

        let path = cache.order_masks_path();
        cache.save(&path, &data).unwrap();
        let loaded: Array2<u8> = cache.load(&path).unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_save_leaves_no_temporary_file() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().to_path_buf());
        cache.save(&cache.wavelength_bins_path(), &vec![1.0, 2.0]).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![WAVELENGTH_BINS_FILE.to_string()]);
    }

    #[test]
    fn test_corrupt_artifact_is_format_error() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().to_path_buf());
        let path = cache.order_masks_path();
        std::fs::write(&path, "{ not json").unwrap();

        let result: Result<Option<Vec<u8>>, _> = cache.load(&path);
        assert!(matches!(result, Err(CacheError::Format { .. })));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::with_path(dir.path().to_path_buf());
        let path = cache.order_masks_path();
        assert!(!cache.remove(&path).unwrap());
        cache.save(&path, &0u8).unwrap();
        assert!(cache.remove(&path).unwrap());
        assert!(!path.exists());
    }
}
