//! # djafs-config
//!
//! Configuration management for djafs.
//!
//! Settings are resolved in three layers, later layers overriding earlier:
//! 1. `~/.djafs/config.toml` (global)
//! 2. `<storage-root>/djafs.toml` (per storage root)
//! 3. Environment variables

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// GC cycle interval when nothing else is configured.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 30;

/// Per-directory file ceiling before a bucket spills into the next
/// subbucket. ext3-era guidance caps directories around 32k entries; 5000
/// leaves generous headroom.
pub const DEFAULT_BUCKET_FILL_THRESHOLD: usize = 5000;

/// Soft cap on regular files per planned archive.
pub const DEFAULT_ARCHIVE_TARGET: usize = 5000;

/// Resolved djafs configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub gc: GcConfig,
    pub archive: ArchiveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// Background garbage-collection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between GC cycles
    pub interval_secs: u64,
    /// Worker threads for hashing and packing (None = number of cores)
    pub threads: Option<usize>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_GC_INTERVAL_SECS,
            threads: None,
        }
    }
}

/// Archive and work-area settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Files per work subbucket before spilling to the next one
    pub bucket_fill_threshold: usize,
    /// Target file count per archive for the boundary planner
    pub target_files_per_archive: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            bucket_fill_threshold: DEFAULT_BUCKET_FILL_THRESHOLD,
            target_files_per_archive: DEFAULT_ARCHIVE_TARGET,
        }
    }
}

impl Config {
    /// Load configuration for a storage root, applying all three layers.
    pub fn load_for_root(storage_root: &Path) -> Result<Self> {
        let mut config = Config::default();

        if let Some(global) = Self::global_config_path() {
            if global.exists() {
                debug!(path = %global.display(), "loading global config");
                let contents = std::fs::read_to_string(&global)?;
                config = toml::from_str(&contents)?;
            }
        }

        let root_config = storage_root.join("djafs.toml");
        if root_config.exists() {
            debug!(path = %root_config.display(), "loading storage-root config");
            let contents = std::fs::read_to_string(&root_config)?;
            let overlay: Config = toml::from_str(&contents)?;
            config.merge(overlay);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: `~/.djafs/config.toml`.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".djafs/config.toml"))
    }

    /// Merge another config over this one. Values that differ from the
    /// defaults in `other` win.
    fn merge(&mut self, other: Config) {
        let default_gc = GcConfig::default();
        if other.gc.interval_secs != default_gc.interval_secs {
            self.gc.interval_secs = other.gc.interval_secs;
        }
        if other.gc.threads.is_some() {
            self.gc.threads = other.gc.threads;
        }

        let default_archive = ArchiveConfig::default();
        if other.archive.bucket_fill_threshold != default_archive.bucket_fill_threshold {
            self.archive.bucket_fill_threshold = other.archive.bucket_fill_threshold;
        }
        if other.archive.target_files_per_archive != default_archive.target_files_per_archive {
            self.archive.target_files_per_archive = other.archive.target_files_per_archive;
        }
    }

    /// Environment variables take priority over every file layer.
    fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("DJAFS_GC_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.gc.interval_secs = secs;
            }
        }
        if let Ok(threads) = std::env::var("DJAFS_THREADS") {
            if let Ok(n) = threads.parse() {
                self.gc.threads = Some(n);
            }
        }
        if let Ok(fill) = std::env::var("DJAFS_BUCKET_FILL") {
            if let Ok(n) = fill.parse() {
                self.archive.bucket_fill_threshold = n;
            }
        }
        if let Ok(target) = std::env::var("DJAFS_ARCHIVE_TARGET") {
            if let Ok(n) = target.parse() {
                self.archive.target_files_per_archive = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests share process environment; serialize them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gc.interval_secs, 30);
        assert!(config.gc.threads.is_none());
        assert_eq!(config.archive.bucket_fill_threshold, 5000);
        assert_eq!(config.archive.target_files_per_archive, 5000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[gc]
interval_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.gc.interval_secs, 5);
        assert_eq!(config.archive.bucket_fill_threshold, 5000);
    }

    #[test]
    fn test_load_for_root_reads_storage_config() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("djafs.toml"),
            "[archive]\ntarget_files_per_archive = 100\n",
        )
        .unwrap();

        let _guard = ENV_LOCK.lock().unwrap();
        let config = Config::load_for_root(temp.path()).unwrap();
        assert_eq!(config.archive.target_files_per_archive, 100);
        assert_eq!(config.gc.interval_secs, 30);
    }

    #[test]
    fn test_env_override_wins() {
        let _guard = ENV_LOCK.lock().unwrap();
        let temp = tempfile::tempdir().unwrap();

        std::env::set_var("DJAFS_GC_INTERVAL", "7");
        let config = Config::load_for_root(temp.path()).unwrap();
        std::env::remove_var("DJAFS_GC_INTERVAL");

        assert_eq!(config.gc.interval_secs, 7);
    }

    #[test]
    fn test_invalid_env_value_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("DJAFS_THREADS", "not_a_number");
        config.apply_env_overrides();
        std::env::remove_var("DJAFS_THREADS");

        assert!(config.gc.threads.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let original = Config::default();
        let text = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(original, parsed);
    }
}
