//! Error types for store access and slice retrieval.
//!
//! Two layers of errors exist:
//! - [`StoreError`] is what a store binding reports. Its variants let the retry
//!   wrapper tell transient unavailability apart from call-shape mismatches and
//!   hard failures.
//! - [`SliceError`] is what the retrieval pipeline reports to callers. Every
//!   variant carries enough structured context (ranges, block indices, column
//!   counts, layer names) to diagnose a failure without re-running it.

use thiserror::Error;

/// Errors reported by an [`ExperimentStore`](crate::store::ExperimentStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is not reachable yet. Expected to resolve with time.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store does not accept the requested call shape.
    #[error("call shape not supported: {0}")]
    Incompatible(String),

    /// A requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown column '{column}' (available: {available:?})")]
    UnknownColumn {
        column: String,
        available: Vec<String>,
    },

    #[error("measurement '{measurement}' does not contain layer '{layer}' (available layers: {available:?})")]
    LayerNotFound {
        measurement: String,
        layer: String,
        available: Vec<String>,
    },

    /// The location does not name a usable store.
    #[error("invalid location: {0}")]
    InvalidUri(String),

    /// Stored data violates the expected layout.
    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::Incompatible(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether waiting and retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Classifies an `object_store` failure.
    ///
    /// Connection-level failures are transient; a missing object stays a hard error
    /// unless `missing_is_transient` is set (an experiment that is still being
    /// materialized looks missing until it is complete).
    pub fn from_object_store(err: object_store::Error, missing_is_transient: bool) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } if missing_is_transient => {
                StoreError::Unavailable(format!("{} does not exist yet", path))
            }
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            object_store::Error::Generic { store, source } => {
                StoreError::Unavailable(format!("{}: {}", store, source))
            }
            other => StoreError::ObjectStore(other),
        }
    }
}

/// Errors reported by the retrieval pipeline.
#[derive(Debug, Error)]
pub enum SliceError {
    /// A transient failure did not clear within the attempt budget.
    #[error("{operation} unavailable after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The caller supplied an unusable request. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("measurement '{measurement}' does not contain layer '{layer}'. Available layers: {available:?}")]
    LayerNotFound {
        measurement: String,
        layer: String,
        available: Vec<String>,
    },

    /// Fetching one contiguous block failed; fatal to the whole retrieval.
    #[error("error reading block {start} to {end}")]
    BlockFetch {
        start: u64,
        end: u64,
        #[source]
        source: Box<SliceError>,
    },

    /// A fetched block disagrees with the first block's column count.
    #[error("block {block} has {actual} columns but expected {expected}")]
    ShapeMismatch {
        block: usize,
        expected: usize,
        actual: usize,
    },

    /// A block asks for rows past the end of the matrix layer.
    #[error("rows {start}..{end} exceed the {n_rows} rows of layer '{layer}'")]
    RowsOutOfBounds {
        layer: String,
        start: u64,
        end: u64,
        n_rows: u64,
    },

    /// The obs query selected no rows.
    #[error("no obs rows matched the query")]
    NoMatch,

    /// The retrieval produced nothing usable.
    #[error("no data: {0}")]
    NoData(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("fetch task failed: {0}")]
    Task(String),
}

impl SliceError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn no_data(msg: impl Into<String>) -> Self {
        Self::NoData(msg.into())
    }

    /// Lifts a store error, turning request-shaped store errors into configuration errors.
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::UnknownColumn { column, available } => SliceError::Config(format!(
                "unknown column '{}' (available: {:?})",
                column, available
            )),
            StoreError::LayerNotFound { measurement, layer, available } => {
                SliceError::LayerNotFound { measurement, layer, available }
            }
            StoreError::InvalidUri(msg) => SliceError::Config(msg),
            other => SliceError::Store(other),
        }
    }
}

/// Result type for retrieval operations.
pub type Result<T> = std::result::Result<T, SliceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(!StoreError::incompatible("no projection").is_transient());
        assert!(!StoreError::malformed("bad").is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_missing_object_classification() {
        let missing = || object_store::Error::NotFound {
            path: "exp/obs.parquet".to_string(),
            source: "gone".into(),
        };
        assert!(StoreError::from_object_store(missing(), true).is_transient());
        assert!(matches!(
            StoreError::from_object_store(missing(), false),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn test_layer_not_found_lifts_with_alternatives() {
        let err = SliceError::from_store(StoreError::LayerNotFound {
            measurement: "RNA".into(),
            layer: "counts".into(),
            available: vec!["X".into(), "raw".into()],
        });
        match &err {
            SliceError::LayerNotFound { available, .. } => assert_eq!(available, &vec!["X".to_string(), "raw".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.to_string().contains("Available layers"));
    }

    #[test]
    fn test_invalid_location_is_config_error() {
        let err = SliceError::from_store(StoreError::InvalidUri("s3:// has no bucket".into()));
        assert!(matches!(err, SliceError::Config(msg) if msg.contains("no bucket")));
    }

    #[test]
    fn test_block_fetch_keeps_cause() {
        let err = SliceError::BlockFetch {
            start: 9,
            end: 10,
            source: Box::new(SliceError::Store(StoreError::malformed("truncated"))),
        };
        assert_eq!(err.to_string(), "error reading block 9 to 10");
        let cause = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(cause.as_deref(), Some("malformed data: truncated"));
    }
}
