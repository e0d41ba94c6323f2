//! Parquet experiments written into the `memory://` store, and a store wrapper
//! that injects failures.

use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use arrow::array::{Float32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::config::SliceConfig;
use crate::error::StoreError;
use crate::sparse_matrix::SparseBlock;
use crate::store::{Capabilities, ExperimentStore, MatrixLayer, ObsPages, ObsRead, ParquetExperiment};
use crate::utils::file_interaction_local_and_cloud::register_memory_file;

static NEXT_EXPERIMENT: AtomicUsize = AtomicUsize::new(0);

/// A fresh `memory://` URI for one test.
pub fn unique_uri(prefix: &str) -> String {
    format!("memory://{}-{}", prefix, NEXT_EXPERIMENT.fetch_add(1, Ordering::SeqCst))
}

/// Value stored at `(row, col)` of the fixture layer, `None` for an implicit zero.
pub fn stored_value(row: u64, col: u32) -> Option<f32> {
    if (row + col as u64) % 3 == 1 {
        None
    } else {
        Some((row * 10 + col as u64 + 1) as f32)
    }
}

/// Dense expectation for `(row, col)`.
pub fn expected_value(row: u64, col: u32) -> f32 {
    stored_value(row, col).unwrap_or(0.0)
}

/// Tissue of an obs row: rows 2, 3, 4 and 9 are "lung".
pub fn tissue_of(row: u64) -> &'static str {
    match row {
        2 | 3 | 4 | 9 => "lung",
        r if r % 2 == 0 => "liver",
        _ => "brain",
    }
}

pub fn donor_of(row: u64) -> &'static str {
    if row % 3 == 0 { "d0" } else { "d1" }
}

/// Obs table with `soma_joinid`, `tissue`, `donor`, rows in descending identifier order.
pub fn obs_batch(n_rows: u64) -> RecordBatch {
    let ids: Vec<u64> = (0..n_rows).rev().collect();
    let schema = Arc::new(Schema::new(vec![
        Field::new("soma_joinid", DataType::Int64, false),
        Field::new("tissue", DataType::Utf8, true),
        Field::new("donor", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(ids.iter().map(|&i| i as i64))),
            Arc::new(StringArray::from_iter_values(ids.iter().map(|&i| tissue_of(i)))),
            Arc::new(StringArray::from_iter_values(ids.iter().map(|&i| donor_of(i)))),
        ],
    )
    .unwrap()
}

pub fn var_batch(n_cols: u32) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("soma_joinid", DataType::Int64, false),
        Field::new("gene_name", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from_iter_values(0..n_cols as i64)),
            Arc::new(StringArray::from_iter_values((0..n_cols).map(|c| format!("gene_{}", c)))),
        ],
    )
    .unwrap()
}

/// COO layer sorted by row, values multiplied by `scale`.
pub fn layer_batch(n_rows: u64, n_cols: u32, scale: f32) -> RecordBatch {
    let mut dim_0 = Vec::new();
    let mut dim_1 = Vec::new();
    let mut data = Vec::new();
    for row in 0..n_rows {
        for col in 0..n_cols {
            if let Some(v) = stored_value(row, col) {
                dim_0.push(row as i64);
                dim_1.push(col as i64);
                data.push(v * scale);
            }
        }
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("soma_dim_0", DataType::Int64, false),
        Field::new("soma_dim_1", DataType::Int64, false),
        Field::new("soma_data", DataType::Float32, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(dim_0)),
            Arc::new(Int64Array::from(dim_1)),
            Arc::new(Float32Array::from(data)),
        ],
    )
    .unwrap()
}

/// Serializes a batch to Parquet with the given row group size and key/value metadata.
pub fn parquet_bytes(batch: &RecordBatch, max_row_group_size: usize, metadata: &[(&str, String)]) -> Bytes {
    let kvs = metadata
        .iter()
        .map(|(k, v)| KeyValue::new(k.to_string(), v.clone()))
        .collect::<Vec<_>>();
    let props = WriterProperties::builder()
        .set_max_row_group_size(max_row_group_size)
        .set_key_value_metadata(if kvs.is_empty() { None } else { Some(kvs) })
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    Bytes::from(buffer)
}

/// Writes an experiment with measurement `RNA` holding:
/// - `X/X.parquet`: the fixture layer with `soma_shape` metadata, 4 entries per row group
/// - `X/normalized/{alt,data}.parquet`: a collection; `data` holds values x2
/// - `X/counts/b.parquet`: a collection without `data`; `b` holds values x3
/// - `X/noshape.parquet`: the fixture layer without shape metadata
pub async fn write_experiment(uri: &str, n_rows: u64, n_cols: u32) {
    let shape = vec![("soma_shape", format!("{},{}", n_rows, n_cols))];
    let put = |rel: &str, bytes: Bytes| {
        let target = format!("{}/{}", uri, rel);
        async move { register_memory_file(&target, bytes).await.unwrap() }
    };

    put("obs.parquet", parquet_bytes(&obs_batch(n_rows), 1024, &[])).await;
    put("ms/RNA/var.parquet", parquet_bytes(&var_batch(n_cols), 1024, &[])).await;
    put("ms/RNA/X/X.parquet", parquet_bytes(&layer_batch(n_rows, n_cols, 1.0), 4, &shape)).await;
    put("ms/RNA/X/normalized/alt.parquet", parquet_bytes(&layer_batch(n_rows, n_cols, 5.0), 4, &shape)).await;
    put("ms/RNA/X/normalized/data.parquet", parquet_bytes(&layer_batch(n_rows, n_cols, 2.0), 4, &shape)).await;
    put("ms/RNA/X/counts/b.parquet", parquet_bytes(&layer_batch(n_rows, n_cols, 3.0), 4, &shape)).await;
    put("ms/RNA/X/noshape.parquet", parquet_bytes(&layer_batch(n_rows, n_cols, 1.0), 4, &[])).await;
}

/// Writes the standard 10 x 3 experiment and opens it with small pages.
pub async fn open_standard_experiment(prefix: &str) -> ParquetExperiment {
    let uri = unique_uri(prefix);
    write_experiment(&uri, 10, 3).await;
    ParquetExperiment::open(&uri).await.unwrap().with_page_size(3).with_batch_size(4)
}

/// Config for tests: millisecond retry unit.
pub fn test_config() -> SliceConfig {
    SliceConfig::default()
        .with_retry_unit(Duration::from_millis(1))
        .with_obs_page_size(3)
}

/// Wraps a store and injects failures.
pub struct FlakyStore<S> {
    pub inner: S,
    /// Whether `capabilities()` advertises projection together with a query.
    pub advertise_projection: bool,
    /// Answer projected reads that carry a query with `Incompatible`.
    pub reject_projection_with_query: bool,
    /// Transient failures still to inject into matrix reads.
    pub transient_matrix_failures: AtomicU32,
    /// Matrix reads starting at this row always fail with a hard error.
    pub broken_block_start: Option<u64>,
    /// Delay matrix reads so that later blocks finish first.
    pub reverse_completion: bool,
    pub projected_reads: AtomicU32,
    pub unprojected_reads: AtomicU32,
    pub matrix_reads: AtomicU32,
    /// Row ranges passed to matrix reads, in call order.
    pub matrix_ranges: Mutex<Vec<Range<u64>>>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            advertise_projection: true,
            reject_projection_with_query: false,
            transient_matrix_failures: AtomicU32::new(0),
            broken_block_start: None,
            reverse_completion: false,
            projected_reads: AtomicU32::new(0),
            unprojected_reads: AtomicU32::new(0),
            matrix_reads: AtomicU32::new(0),
            matrix_ranges: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<S: ExperimentStore> ExperimentStore for FlakyStore<S> {
    fn capabilities(&self) -> Capabilities {
        Capabilities { projection_with_query: self.advertise_projection }
    }

    async fn read_obs(&self, request: ObsRead) -> Result<ObsPages, StoreError> {
        match &request {
            ObsRead::Projected { query, .. } => {
                self.projected_reads.fetch_add(1, Ordering::SeqCst);
                if query.is_some() && self.reject_projection_with_query {
                    return Err(StoreError::incompatible("column_names not accepted with a query"));
                }
            }
            ObsRead::Unprojected { .. } => {
                self.unprojected_reads.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.read_obs(request).await
    }

    async fn open_layer(&self, measurement: &str, layer: &str) -> Result<MatrixLayer, StoreError> {
        self.inner.open_layer(measurement, layer).await
    }

    async fn read_matrix_rows(&self, layer: &MatrixLayer, rows: Range<u64>) -> Result<SparseBlock, StoreError> {
        self.matrix_reads.fetch_add(1, Ordering::SeqCst);
        self.matrix_ranges.lock().unwrap().push(rows.clone());
        if self.reverse_completion {
            tokio::time::sleep(Duration::from_millis(50u64.saturating_sub(rows.start * 5))).await;
        }
        if self.broken_block_start == Some(rows.start) {
            return Err(StoreError::malformed("corrupt page"));
        }
        let remaining = self.transient_matrix_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_matrix_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::unavailable("array is being consolidated"));
        }
        self.inner.read_matrix_rows(layer, rows).await
    }

    async fn read_var(&self, measurement: &str) -> Result<RecordBatch, StoreError> {
        self.inner.read_var(measurement).await
    }
}
