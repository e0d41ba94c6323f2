//! Cellslice - Row-Filtered Slices of Sparse Matrices in Parquet Experiments
//!
//! Retrieves the rows of a very large sparse matrix selected by a predicate over its
//! row metadata, and reassembles them into one in-memory CSR matrix together with the
//! matching row (obs) and column (var) metadata. Works with both local filesystems and
//! cloud storage (S3).
//!
//! # Overview
//!
//! - **Few Reads**: Selected row identifiers are grouped into contiguous runs; each run
//!   is one range read, pruned to the matching row groups
//! - **Bounded Concurrency**: Runs are fetched sequentially or across a fixed number of
//!   workers, and reassembled in identifier order
//! - **Resilient**: Transient store unavailability is retried with linear backoff;
//!   stores that reject a projected query fall back to an unprojected one
//! - **Streaming Counts**: Grouped row counts over obs are computed page by page
//!
//! # Quick Start
//!
//! ```no_run
//! use cellslice::{get_slice, ObsQuery, SliceConfig, SliceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let request = SliceRequest::new()
//!         .with_query(ObsQuery::eq("tissue", "lung"))
//!         .with_obs_columns(["cell_type"]);
//!     let slice = get_slice("s3://bucket/experiment", &request, &SliceConfig::from_env()?).await?;
//!     println!("{} cells x {} genes", slice.x.n_rows(), slice.x.n_cols());
//!     Ok(())
//! }
//! ```
pub mod config;
pub mod error;
pub mod obs;
pub mod pipeline;
pub mod resilient;
pub mod slicing;
pub mod sparse_matrix;
pub mod store;
#[cfg(test)]
pub mod unit_tests;
pub mod utils;

use arrow::record_batch::RecordBatch;

pub use crate::config::SliceConfig;
pub use crate::error::{Result, SliceError, StoreError};
pub use crate::pipeline::{ExperimentSlice, SliceRequest};
pub use crate::sparse_matrix::CsrMatrix;
pub use crate::store::{ExperimentStore, ObsQuery, ParquetExperiment};

use std::sync::Arc;

/// Reads selected obs columns of the experiment at `uri`.
///
/// The experiment is opened with the open-retry policy of `config`. Rows are returned
/// in the order the store yields them.
///
/// # Arguments
///
/// * `uri` - Experiment location (`s3://bucket/prefix`, `memory://name` or a local path)
/// * `columns` - Obs columns to return; at least one is required
/// * `query` - Optional row predicate; `None` returns every row
/// * `config` - Retry budget, page size and other tuning
///
/// # Errors
///
/// Returns [`SliceError::Config`] if `columns` is empty or names a missing column, and
/// [`SliceError::RetriesExhausted`] if the store stays unavailable.
///
/// # Examples
///
/// ```no_run
/// # use cellslice::{get_obs, ObsQuery, SliceConfig};
/// # async fn example() -> cellslice::Result<()> {
/// let columns = vec!["soma_joinid".to_string(), "cell_type".to_string()];
/// let obs = get_obs("data/experiment", &columns, Some(&ObsQuery::eq("tissue", "lung")), &SliceConfig::default()).await?;
/// println!("{} matching cells", obs.num_rows());
/// # Ok(())
/// # }
/// ```
pub async fn get_obs(
    uri: &str,
    columns: &[String],
    query: Option<&ObsQuery>,
    config: &SliceConfig,
) -> Result<RecordBatch> {
    let store = ParquetExperiment::open_with_retries(uri, config).await?;
    obs::read_obs_table(&store, columns, query, config).await
}

/// Counts obs rows of the experiment at `uri` per distinct `group_by` key.
///
/// The result holds the grouping columns plus a count column named `agg_name`
/// (`"count_all"` when `None`), sorted by count descending.
///
/// # Examples
///
/// ```no_run
/// # use cellslice::{count_obs, SliceConfig};
/// # async fn example() -> cellslice::Result<()> {
/// let counts = count_obs("data/experiment", &["tissue".to_string()], None, None, &SliceConfig::default()).await?;
/// println!("{} tissues", counts.num_rows());
/// # Ok(())
/// # }
/// ```
pub async fn count_obs(
    uri: &str,
    group_by: &[String],
    query: Option<&ObsQuery>,
    agg_name: Option<&str>,
    config: &SliceConfig,
) -> Result<RecordBatch> {
    let store = ParquetExperiment::open_with_retries(uri, config).await?;
    obs::count_groups(&store, group_by, query, agg_name, config).await
}

/// Retrieves a row-filtered slice of the experiment at `uri`.
///
/// Opens the experiment with the open-retry policy of `config` and runs
/// [`pipeline::get_slice`]. The returned obs rows are in ascending `soma_joinid`
/// order, matching the matrix rows.
pub async fn get_slice(uri: &str, request: &SliceRequest, config: &SliceConfig) -> Result<ExperimentSlice> {
    let store = Arc::new(ParquetExperiment::open_with_retries(uri, config).await?);
    pipeline::get_slice(store, request, config).await
}
