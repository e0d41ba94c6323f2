//! Read interface of an experiment store.
//!
//! An experiment holds an observation (obs) table keyed by `soma_joinid`, and per
//! measurement a feature (var) table plus one or more sparse matrix layers whose
//! rows are obs join ids and whose columns are var rows. The pipeline only ever
//! reads through [`ExperimentStore`]; [`ParquetExperiment`] binds it to Parquet
//! files on an object store.

pub mod parquet_experiment;
pub mod query;

use std::ops::Range;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::sparse_matrix::SparseBlock;

pub use parquet_experiment::ParquetExperiment;
pub use query::ObsQuery;

/// Row identifier column shared by obs and the matrix layers.
pub const JOIN_ID_COLUMN: &str = "soma_joinid";

/// Row coordinate column of a matrix layer.
pub const DIM_0_COLUMN: &str = "soma_dim_0";

/// Column coordinate column of a matrix layer.
pub const DIM_1_COLUMN: &str = "soma_dim_1";

/// Value column of a matrix layer.
pub const DATA_COLUMN: &str = "soma_data";

/// What a store can do, probed before choosing a call shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Accepts a column projection together with a query in one obs read.
    pub projection_with_query: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { projection_with_query: true }
    }
}

/// The two call shapes of an obs read.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsRead {
    /// Filtered read that returns only `columns`.
    Projected {
        query: Option<ObsQuery>,
        columns: Vec<String>,
    },
    /// Filtered read that returns every column.
    Unprojected { query: Option<ObsQuery> },
}

impl ObsRead {
    pub fn query(&self) -> Option<&ObsQuery> {
        match self {
            ObsRead::Projected { query, .. } | ObsRead::Unprojected { query } => query.as_ref(),
        }
    }
}

/// A paged obs read. Each stream item is one page.
pub struct ObsPages {
    pub schema: SchemaRef,
    pub pages: BoxStream<'static, Result<RecordBatch, StoreError>>,
}

impl std::fmt::Debug for ObsPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObsPages").field("schema", &self.schema).finish()
    }
}

/// A resolved matrix layer ready for range reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixLayer {
    pub measurement: String,
    pub name: String,
    /// Location of the array inside the store.
    pub location: String,
    pub n_rows: u64,
    pub n_cols: usize,
}

/// Read operations the retrieval pipeline needs from a store.
///
/// Implementations are shared across concurrent fetch tasks and must be safe for
/// concurrent reads.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Starts a paged read of the obs table.
    async fn read_obs(&self, request: ObsRead) -> Result<ObsPages, StoreError>;

    /// Resolves a matrix layer of a measurement.
    ///
    /// Fails with [`StoreError::LayerNotFound`] listing the available layers.
    async fn open_layer(&self, measurement: &str, layer: &str) -> Result<MatrixLayer, StoreError>;

    /// Reads every stored entry whose row lies in `rows`, across all columns.
    async fn read_matrix_rows(&self, layer: &MatrixLayer, rows: Range<u64>) -> Result<SparseBlock, StoreError>;

    /// Reads the full var (column metadata) table of a measurement.
    async fn read_var(&self, measurement: &str) -> Result<RecordBatch, StoreError>;
}
