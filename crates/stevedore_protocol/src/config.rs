//! Service configuration.
//!
//! Loaded from a TOML file with the recognized options of the control
//! plane; every field has a default so a missing file yields a usable
//! configuration.

use crate::defaults;
use crate::types::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Recognized service options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Worker cap applied to buckets created without an explicit cap.
    pub worker_default_count: u32,
    /// Hard upper bound on any bucket's effective worker cap.
    pub worker_max_count: u32,
    /// Path of the queue database.
    pub database_path: PathBuf,
    /// Content-hash algorithm for copy verification.
    pub hash_algorithm: HashAlgorithm,
    /// Streamed-copy chunk size in bytes.
    pub copy_buffer_size: usize,
    /// Glob patterns excluded by the scanner.
    pub scan_ignore_patterns: Vec<String>,
    /// Whether the scanner descends into subdirectories.
    pub scan_recursive: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_default_count: defaults::DEFAULT_WORKER_COUNT,
            worker_max_count: defaults::DEFAULT_WORKER_MAX_COUNT,
            database_path: service_home().join(defaults::DEFAULT_DATABASE_FILE),
            hash_algorithm: HashAlgorithm::default(),
            copy_buffer_size: defaults::DEFAULT_COPY_BUFFER_SIZE,
            scan_ignore_patterns: Vec::new(),
            scan_recursive: true,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from a file when it exists, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Clamp a requested per-bucket worker cap into `1..=worker_max_count`,
    /// substituting the default for zero.
    pub fn clamp_worker_count(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.worker_default_count.min(self.worker_max_count).max(1)
        } else {
            requested.min(self.worker_max_count).max(1)
        }
    }
}

/// Service home directory: `$STEVEDORE_HOME` or `~/.stevedore`.
pub fn service_home() -> PathBuf {
    if let Ok(home) = std::env::var(defaults::HOME_ENV_VAR) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stevedore")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServiceConfig::default();
        assert_eq!(config.worker_default_count, 4);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Xxhash3);
        assert!(config.scan_recursive);
        assert!(config.scan_ignore_patterns.is_empty());
    }

    #[test]
    fn clamp_worker_count_bounds() {
        let config = ServiceConfig::default();
        assert_eq!(config.clamp_worker_count(0), 4);
        assert_eq!(config.clamp_worker_count(3), 3);
        assert_eq!(config.clamp_worker_count(1000), config.worker_max_count);
    }

    #[test]
    fn load_partial_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            workerDefaultCount = 2
            hashAlgorithm = "sha256"
            scanIgnorePatterns = ["*.tmp", ".DS_Store"]
            "#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.worker_default_count, 2);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.scan_ignore_patterns.len(), 2);
        // untouched fields fall back to defaults
        assert_eq!(config.copy_buffer_size, 256 * 1024);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = ServiceConfig::load_or_default(Some(Path::new("/no/such/file.toml"))).unwrap();
        assert_eq!(config.worker_max_count, 16);
    }
}
