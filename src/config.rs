//! Runtime settings for retrieval and retry behavior.

use std::time::Duration;

use crate::error::{Result, SliceError};

/// Default number of attempts for any single remote operation.
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// Rows per obs page requested from the store.
pub const DEFAULT_OBS_PAGE_SIZE: usize = 65_536;

/// Rows per decoded batch when scanning a matrix layer.
pub const DEFAULT_MATRIX_BATCH_SIZE: usize = 8192;

/// Settings shared by every stage of a retrieval.
#[derive(Debug, Clone)]
pub struct SliceConfig {
    /// Concurrent block fetches. `<= 1` fetches sequentially.
    pub max_workers: usize,
    /// Attempts per remote operation before giving up.
    pub max_tries: u32,
    /// Base delay unit; the n-th retry waits a small multiple of it.
    pub retry_unit: Duration,
    pub obs_page_size: usize,
    pub matrix_batch_size: usize,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_tries: DEFAULT_MAX_TRIES,
            retry_unit: Duration::from_secs(1),
            obs_page_size: DEFAULT_OBS_PAGE_SIZE,
            matrix_batch_size: DEFAULT_MATRIX_BATCH_SIZE,
        }
    }
}

impl SliceConfig {
    /// Builds settings from `CELLSLICE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_workers: parse_usize("CELLSLICE_MAX_WORKERS", defaults.max_workers)?,
            max_tries: parse_u32("CELLSLICE_MAX_TRIES", defaults.max_tries)?.max(1),
            retry_unit: std::env::var("CELLSLICE_RETRY_UNIT_MS")
                .ok()
                .map(|v| parse_number::<u64>("CELLSLICE_RETRY_UNIT_MS", &v).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.retry_unit),
            obs_page_size: parse_usize("CELLSLICE_OBS_PAGE_SIZE", defaults.obs_page_size)?.max(1),
            matrix_batch_size: parse_usize("CELLSLICE_MATRIX_BATCH_SIZE", defaults.matrix_batch_size)?
                .max(1),
        })
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries.max(1);
        self
    }

    pub fn with_retry_unit(mut self, unit: Duration) -> Self {
        self.retry_unit = unit;
        self
    }

    pub fn with_obs_page_size(mut self, rows: usize) -> Self {
        self.obs_page_size = rows.max(1);
        self
    }
}

fn parse_usize(var: &str, default: usize) -> Result<usize> {
    match std::env::var(var) {
        Ok(value) => parse_number(var, &value),
        Err(_) => Ok(default),
    }
}

fn parse_u32(var: &str, default: u32) -> Result<u32> {
    match std::env::var(var) {
        Ok(value) => parse_number(var, &value),
        Err(_) => Ok(default),
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SliceError::config(format!("{} must be a non-negative integer, got '{}'", var, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SliceConfig::default();
        assert_eq!(cfg.max_workers, 1);
        assert_eq!(cfg.max_tries, 5);
        assert_eq!(cfg.retry_unit, Duration::from_secs(1));
    }

    #[test]
    fn test_builders_clamp() {
        let cfg = SliceConfig::default().with_max_tries(0).with_obs_page_size(0);
        assert_eq!(cfg.max_tries, 1);
        assert_eq!(cfg.obs_page_size, 1);
    }

    #[test]
    fn test_parse_number_rejects_garbage() {
        let err = parse_number::<usize>("CELLSLICE_MAX_WORKERS", "four").unwrap_err();
        assert!(matches!(err, SliceError::Config(_)));
        assert_eq!(parse_number::<usize>("CELLSLICE_MAX_WORKERS", " 4 ").unwrap(), 4);
    }
}
