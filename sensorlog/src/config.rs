//! Store configuration.
//!
//! A [`StoreConfig`] names the store directory, sizes the per-stream write
//! caches and sets how often a full timestamp is re-emitted. It can be built
//! in code or loaded from a JSON file; missing fields take their defaults.
//!
//! ```rust
//! use sensorlog::config::StoreConfig;
//!
//! let config = StoreConfig {
//!     pir_cache_bytes: 400,
//!     ..StoreConfig::new("./sensor_data")
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InitError, Result};
use crate::store::StreamId;

/// Default PIR cache size: a thousand 4-byte packages.
pub const DEFAULT_PIR_CACHE_BYTES: usize = 4 * 1000;

/// Default atmospheric cache size.
pub const DEFAULT_SLOW_CACHE_BYTES: usize = 18 * 1000;

/// Default plant cache size.
pub const DEFAULT_PLANT_CACHE_BYTES: usize = 1000;

/// Half a day in seconds.
pub const DEFAULT_TIMESTAMP_REFRESH_SECS: u32 = 43_200;

/// Configuration for a [`RecordStore`](crate::store::RecordStore) and the
/// encoders writing into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one log file per stream. Created if absent.
    pub dir: PathBuf,

    /// Write-behind cache capacity of the PIR stream, in bytes.
    pub pir_cache_bytes: usize,

    /// Write-behind cache capacity of the atmospheric stream, in bytes.
    pub slow_cache_bytes: usize,

    /// Write-behind cache capacity of the plant stream, in bytes.
    pub plant_cache_bytes: usize,

    /// Longest gap, in seconds, between two timestamp packages of a stream.
    pub timestamp_refresh_secs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            pir_cache_bytes: DEFAULT_PIR_CACHE_BYTES,
            slow_cache_bytes: DEFAULT_SLOW_CACHE_BYTES,
            plant_cache_bytes: DEFAULT_PLANT_CACHE_BYTES,
            timestamp_refresh_secs: DEFAULT_TIMESTAMP_REFRESH_SECS,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default sizes rooted at `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::ConfigIo`] or [`InitError::ConfigParse`] if the
    /// file cannot be read or parsed, and [`InitError::InvalidConfig`] if a
    /// value is out of range.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| InitError::ConfigIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| InitError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every capacity and interval is usable.
    ///
    /// # Errors
    ///
    /// Returns [`InitError::InvalidConfig`] for a zero cache capacity or a
    /// zero refresh interval.
    pub fn validate(&self) -> Result<()> {
        for stream in StreamId::ALL {
            if self.cache_bytes(stream) == 0 {
                return Err(InitError::InvalidConfig {
                    reason: format!("{stream} cache capacity must be greater than zero"),
                }
                .into());
            }
        }

        if self.timestamp_refresh_secs == 0 {
            return Err(InitError::InvalidConfig {
                reason: "timestamp_refresh_secs must be greater than zero".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the cache capacity configured for `stream`.
    pub fn cache_bytes(&self, stream: StreamId) -> usize {
        match stream {
            StreamId::Pir => self.pir_cache_bytes,
            StreamId::Atmospheric => self.slow_cache_bytes,
            StreamId::Plants => self.plant_cache_bytes,
        }
    }
}
