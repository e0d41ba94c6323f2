//! End-to-end slice retrieval: obs selection, block fetch, var metadata.

use std::sync::Arc;

use arrow::array::{Array, UInt64Array};
use arrow::compute::{cast, sort_to_indices, take_record_batch};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use indexmap::IndexSet;
use tracing::info;

use crate::config::SliceConfig;
use crate::error::{Result, SliceError, StoreError};
use crate::obs::read_obs_table;
use crate::resilient::{with_retries, RetryPolicy};
use crate::slicing::{fetch_blocks, group_contiguous, reassemble};
use crate::sparse_matrix::CsrMatrix;
use crate::store::{ExperimentStore, ObsQuery, JOIN_ID_COLUMN};

/// Measurement read when the request does not name one.
pub const DEFAULT_MEASUREMENT: &str = "RNA";

/// Matrix layer read when the request does not name one.
pub const DEFAULT_LAYER: &str = "X";

/// What to slice out of an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRequest {
    pub measurement: String,
    pub layer: String,
    /// Obs rows to keep. `None` keeps every row.
    pub query: Option<ObsQuery>,
    /// Obs columns to return. `soma_joinid` is always added.
    pub obs_columns: Vec<String>,
}

impl Default for SliceRequest {
    fn default() -> Self {
        Self {
            measurement: DEFAULT_MEASUREMENT.to_string(),
            layer: DEFAULT_LAYER.to_string(),
            query: None,
            obs_columns: Vec::new(),
        }
    }
}

impl SliceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = measurement.into();
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }

    pub fn with_query(mut self, query: ObsQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_obs_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.obs_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Requested obs columns, deduplicated, with `soma_joinid` appended when missing.
    pub fn resolved_obs_columns(&self) -> Vec<String> {
        let mut columns: IndexSet<String> = self.obs_columns.iter().cloned().collect();
        columns.insert(JOIN_ID_COLUMN.to_string());
        columns.into_iter().collect()
    }
}

/// A row-filtered, column-complete slice of one matrix layer.
///
/// Obs rows are in ascending `soma_joinid` order and row `i` of `x` belongs to obs
/// row `i`. Column `j` of `x` belongs to var row `j`.
#[derive(Debug, Clone)]
pub struct ExperimentSlice {
    pub obs: RecordBatch,
    pub var: RecordBatch,
    pub x: CsrMatrix,
}

impl ExperimentSlice {
    pub fn n_obs(&self) -> usize {
        self.obs.num_rows()
    }

    pub fn n_vars(&self) -> usize {
        self.var.num_rows()
    }

    /// Row identifiers of the slice, one per matrix row.
    pub fn join_ids(&self) -> Result<Vec<u64>> {
        join_ids(&self.obs)
    }
}

/// Retrieves the obs rows selected by `request` together with their matrix rows
/// and the measurement's var table.
///
/// # Errors
///
/// * [`SliceError::NoMatch`] when no obs row matches
/// * [`SliceError::LayerNotFound`] when the measurement has no such layer
/// * [`SliceError::BlockFetch`] when any block read fails, including an
///   identifier past the layer's last row
/// * [`SliceError::RetriesExhausted`] when the store stays unavailable
pub async fn get_slice<S>(store: Arc<S>, request: &SliceRequest, config: &SliceConfig) -> Result<ExperimentSlice>
where
    S: ExperimentStore + ?Sized + 'static,
{
    let columns = request.resolved_obs_columns();
    let obs = read_obs_table(store.as_ref(), &columns, request.query.as_ref(), config).await?;
    let obs = sort_by_join_id(&obs)?;
    let ids = join_ids(&obs)?;
    if ids.is_empty() {
        return Err(SliceError::NoMatch);
    }
    info!("Selected {} obs rows", ids.len());

    let blocks = group_contiguous(&ids);
    info!("Found {} contiguous blocks", blocks.len());

    let policy = RetryPolicy::read(config);
    let operation = format!("open layer {}/{}", request.measurement, request.layer);
    let layer = with_retries(&operation, policy, || store.open_layer(&request.measurement, &request.layer)).await?;

    info!("Reading measurement data by contiguous blocks");
    let partials = fetch_blocks(Arc::clone(&store), &layer, blocks, config.max_workers, policy).await?;
    let x = reassemble(partials)?;

    info!("Reading var metadata");
    let operation = format!("read var of {}", request.measurement);
    let var = with_retries(&operation, policy, || store.read_var(&request.measurement)).await?;

    if x.n_rows() != obs.num_rows() || x.n_cols() != var.num_rows() {
        return Err(StoreError::malformed(format!(
            "matrix shape ({}, {}) does not match {} obs rows and {} var rows",
            x.n_rows(),
            x.n_cols(),
            obs.num_rows(),
            var.num_rows()
        ))
        .into());
    }

    info!("Slice has {} rows and {} columns ({} stored values)", x.n_rows(), x.n_cols(), x.nnz());
    Ok(ExperimentSlice { obs, var, x })
}

/// Reorders an obs table by ascending `soma_joinid`.
pub fn sort_by_join_id(obs: &RecordBatch) -> Result<RecordBatch> {
    let ids = join_id_array(obs)?;
    let order = sort_to_indices(&ids, None, None)?;
    Ok(take_record_batch(obs, &order)?)
}

/// The `soma_joinid` column of an obs table as `u64`s.
pub fn join_ids(obs: &RecordBatch) -> Result<Vec<u64>> {
    Ok(join_id_array(obs)?.values().to_vec())
}

fn join_id_array(obs: &RecordBatch) -> Result<UInt64Array> {
    let column = obs
        .column_by_name(JOIN_ID_COLUMN)
        .ok_or_else(|| SliceError::config(format!("obs result has no '{}' column", JOIN_ID_COLUMN)))?;
    let ids = cast(column, &DataType::UInt64)?;
    let ids = ids
        .as_any()
        .downcast_ref::<UInt64Array>()
        .cloned()
        .ok_or_else(|| StoreError::malformed(format!("'{}' is not an integer column", JOIN_ID_COLUMN)))?;
    // Negative identifiers cast to null
    if ids.null_count() > 0 {
        return Err(StoreError::malformed(format!("null or negative values in '{}'", JOIN_ID_COLUMN)).into());
    }
    Ok(ids)
}
