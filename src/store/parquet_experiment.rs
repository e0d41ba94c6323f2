//! Experiment store backed by Parquet files on an object store.
//!
//! # Layout
//!
//! ```text
//! <experiment-uri>/
//! ├── obs.parquet
//! └── ms/<measurement>/
//!     ├── var.parquet
//!     └── X/
//!         ├── <layer>.parquet              COO: soma_dim_0, soma_dim_1, soma_data
//!         └── <collection>/<array>.parquet "data" array, else the first array
//! ```
//!
//! Matrix layers are sorted by `soma_dim_0`, so a row-range read only touches the
//! row groups whose statistics overlap the range. The layer shape is taken from
//! the `soma_shape` key/value metadata ("n_rows,n_cols"); without it the column
//! count is the number of rows in `var.parquet`.
//!
//! Reads go through `ParquetObjectReader` with a known file size, so every request
//! is a bounded range request.

use std::ops::Range;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Float32Array, Int64Array, Scalar};
use arrow::compute::kernels::boolean::and;
use arrow::compute::kernels::cmp::{gt_eq, lt};
use arrow::compute::{cast, concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use parquet::arrow::ProjectionMask;
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use parquet::errors::ParquetError;
use parquet::file::metadata::ParquetMetaData;
use parquet::file::statistics::Statistics;
use tracing::debug;

use crate::config::{SliceConfig, DEFAULT_MATRIX_BATCH_SIZE, DEFAULT_OBS_PAGE_SIZE};
use crate::error::StoreError;
use crate::resilient::{with_retries, RetryPolicy};
use crate::sparse_matrix::SparseBlock;
use crate::store::{
    ExperimentStore, MatrixLayer, ObsPages, ObsRead, DATA_COLUMN, DIM_0_COLUMN, DIM_1_COLUMN,
};
use crate::utils::file_interaction_local_and_cloud::get_object_store;

/// File holding the obs table.
pub const OBS_FILE: &str = "obs.parquet";

/// File holding a measurement's var table.
pub const VAR_FILE: &str = "var.parquet";

/// Key/value metadata entry carrying a layer's "n_rows,n_cols".
pub const SHAPE_METADATA_KEY: &str = "soma_shape";

/// Preferred array name inside a layer collection.
const COLLECTION_DEFAULT_ARRAY: &str = "data";

const PARQUET_EXTENSION: &str = ".parquet";

/// An experiment laid out as Parquet files under one URI.
#[derive(Debug, Clone)]
pub struct ParquetExperiment {
    uri: String,
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
    page_size: usize,
    batch_size: usize,
}

impl ParquetExperiment {
    /// Opens the experiment at `uri`.
    ///
    /// An experiment whose obs table is not there yet is reported as
    /// [`StoreError::Unavailable`] so that callers can wait for it.
    pub async fn open(uri: &str) -> Result<Self, StoreError> {
        let (store, root) = get_object_store(uri).await?;
        store
            .head(&root.child(OBS_FILE))
            .await
            .map_err(|e| StoreError::from_object_store(e, true))?;

        Ok(Self {
            uri: uri.to_string(),
            store,
            root,
            page_size: DEFAULT_OBS_PAGE_SIZE,
            batch_size: DEFAULT_MATRIX_BATCH_SIZE,
        })
    }

    /// Opens the experiment, waiting for it to become available.
    pub async fn open_with_retries(uri: &str, config: &SliceConfig) -> crate::error::Result<Self> {
        let operation = format!("open {}", uri);
        let experiment = with_retries(&operation, RetryPolicy::open(config), || Self::open(uri)).await?;
        Ok(experiment
            .with_page_size(config.obs_page_size)
            .with_batch_size(config.matrix_batch_size))
    }

    /// Rows per obs page.
    pub fn with_page_size(mut self, rows: usize) -> Self {
        self.page_size = rows.max(1);
        self
    }

    /// Rows per decoded batch when scanning a matrix layer.
    pub fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows.max(1);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn obs_path(&self) -> ObjectPath {
        self.root.child(OBS_FILE)
    }

    fn measurement_path(&self, measurement: &str) -> ObjectPath {
        self.root.child("ms").child(measurement)
    }

    /// Creates a `ParquetObjectReader` with the file size set, which keeps every
    /// request a bounded range request instead of a suffix request.
    async fn object_reader(&self, path: &ObjectPath) -> Result<ParquetObjectReader, StoreError> {
        let meta = self
            .store
            .head(path)
            .await
            .map_err(|e| StoreError::from_object_store(e, false))?;
        Ok(ParquetObjectReader::new(Arc::clone(&self.store), path.clone()).with_file_size(meta.size))
    }

    async fn stream_builder(
        &self,
        path: &ObjectPath,
    ) -> Result<ParquetRecordBatchStreamBuilder<ParquetObjectReader>, StoreError> {
        let reader = self.object_reader(path).await?;
        ParquetRecordBatchStreamBuilder::new(reader)
            .await
            .map_err(classify_parquet)
    }

    /// Layer names under `ms/<measurement>/X`, each with the array to read.
    async fn list_layers(&self, measurement: &str) -> Result<Vec<(String, ObjectPath)>, StoreError> {
        let x_path = self.measurement_path(measurement).child("X");
        let listing = self
            .store
            .list_with_delimiter(Some(&x_path))
            .await
            .map_err(|e| StoreError::from_object_store(e, false))?;

        let mut layers = Vec::new();
        for object in listing.objects {
            if let Some(name) = object.location.filename().and_then(|f| f.strip_suffix(PARQUET_EXTENSION)) {
                layers.push((name.to_string(), object.location.clone()));
            }
        }
        for collection in listing.common_prefixes {
            let name = match collection.parts().last() {
                Some(part) => part.as_ref().to_string(),
                None => continue,
            };
            if let Some(array) = self.collection_array(&collection).await? {
                layers.push((name, array));
            }
        }
        layers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(layers)
    }

    /// Picks the array of a layer collection: `data` if present, else the first by name.
    async fn collection_array(&self, collection: &ObjectPath) -> Result<Option<ObjectPath>, StoreError> {
        let listing = self
            .store
            .list_with_delimiter(Some(collection))
            .await
            .map_err(|e| StoreError::from_object_store(e, false))?;

        let mut arrays: Vec<(String, ObjectPath)> = listing
            .objects
            .into_iter()
            .filter_map(|o| {
                let stem = o.location.filename()?.strip_suffix(PARQUET_EXTENSION)?.to_string();
                Some((stem, o.location))
            })
            .collect();
        arrays.sort_by(|a, b| a.0.cmp(&b.0));

        let preferred = arrays.iter().position(|(stem, _)| stem == COLLECTION_DEFAULT_ARRAY);
        Ok(match preferred {
            Some(idx) => Some(arrays.swap_remove(idx).1),
            None => arrays.into_iter().next().map(|(_, path)| path),
        })
    }

    /// Row count of a Parquet file, from its footer.
    async fn row_count(&self, path: &ObjectPath) -> Result<u64, StoreError> {
        let builder = self.stream_builder(path).await?;
        Ok(builder.metadata().file_metadata().num_rows().max(0) as u64)
    }
}

#[async_trait]
impl ExperimentStore for ParquetExperiment {
    async fn read_obs(&self, request: ObsRead) -> Result<ObsPages, StoreError> {
        let builder = self.stream_builder(&self.obs_path()).await?;
        let file_schema = builder.schema().clone();

        let available = || file_schema.fields().iter().map(|f| f.name().clone()).collect::<Vec<_>>();
        let check = |column: &str| -> Result<usize, StoreError> {
            file_schema.index_of(column).map_err(|_| StoreError::UnknownColumn {
                column: column.to_string(),
                available: available(),
            })
        };

        let query = request.query().cloned();
        let query_columns = query.as_ref().map(|q| q.columns()).unwrap_or_default();
        for column in &query_columns {
            check(column)?;
        }

        // Columns decoded from the file, and the columns handed back per page
        let (mask, out_schema) = match &request {
            ObsRead::Projected { columns, .. } => {
                let mut leaves = Vec::with_capacity(columns.len() + query_columns.len());
                for column in columns.iter().chain(query_columns.iter()) {
                    leaves.push(check(column)?);
                }
                leaves.sort_unstable();
                leaves.dedup();
                let mask = ProjectionMask::roots(builder.parquet_schema(), leaves);
                let fields = columns
                    .iter()
                    .map(|c| Ok(file_schema.field(check(c)?).clone()))
                    .collect::<Result<Vec<_>, StoreError>>()?;
                (mask, Arc::new(Schema::new(fields)))
            }
            ObsRead::Unprojected { .. } => (ProjectionMask::all(), Arc::clone(&file_schema)),
        };

        let stream = builder
            .with_projection(mask)
            .with_batch_size(self.page_size)
            .build()
            .map_err(classify_parquet)?;

        debug!("reading obs pages from {} ({} output columns)", self.uri, out_schema.fields().len());

        let page_schema: SchemaRef = Arc::clone(&out_schema);
        let pages = stream
            .map(move |page| -> Result<RecordBatch, StoreError> {
                let page = page.map_err(classify_parquet)?;
                let page = match &query {
                    Some(q) => {
                        let keep = q.evaluate(&page)?;
                        filter_record_batch(&page, &keep)?
                    }
                    None => page,
                };
                let indices = page_schema
                    .fields()
                    .iter()
                    .map(|f| page.schema().index_of(f.name()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(page.project(&indices)?)
            })
            .boxed();

        Ok(ObsPages { schema: out_schema, pages })
    }

    async fn open_layer(&self, measurement: &str, layer: &str) -> Result<MatrixLayer, StoreError> {
        let layers = self.list_layers(measurement).await?;
        let location = match layers.iter().find(|(name, _)| name == layer) {
            Some((_, location)) => location.clone(),
            None => {
                return Err(StoreError::LayerNotFound {
                    measurement: measurement.to_string(),
                    layer: layer.to_string(),
                    available: layers.into_iter().map(|(name, _)| name).collect(),
                });
            }
        };

        let builder = self.stream_builder(&location).await?;
        let metadata = builder.metadata();
        for column in [DIM_0_COLUMN, DIM_1_COLUMN, DATA_COLUMN] {
            builder.schema().index_of(column).map_err(|_| {
                StoreError::malformed(format!("layer '{}' has no '{}' column", layer, column))
            })?;
        }

        let (n_rows, n_cols) = match shape_from_metadata(metadata)? {
            Some(shape) => shape,
            None => {
                let n_rows = self.row_count(&self.obs_path()).await?;
                let n_cols = self
                    .row_count(&self.measurement_path(measurement).child(VAR_FILE))
                    .await? as usize;
                (n_rows, n_cols)
            }
        };

        Ok(MatrixLayer {
            measurement: measurement.to_string(),
            name: layer.to_string(),
            location: location.to_string(),
            n_rows,
            n_cols,
        })
    }

    async fn read_matrix_rows(&self, layer: &MatrixLayer, rows: Range<u64>) -> Result<SparseBlock, StoreError> {
        let mut block = SparseBlock::new(rows.clone(), layer.n_cols);
        if rows.is_empty() {
            return Ok(block);
        }

        let location = ObjectPath::from(layer.location.as_str());
        let builder = self.stream_builder(&location).await?;
        let metadata = Arc::clone(builder.metadata());

        let row_groups = overlapping_row_groups(&metadata, &rows);
        if row_groups.is_empty() {
            return Ok(block);
        }

        let schema = builder.schema().clone();
        let leaves = [DIM_0_COLUMN, DIM_1_COLUMN, DATA_COLUMN]
            .iter()
            .map(|c| schema.index_of(c))
            .collect::<Result<Vec<_>, _>>()?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), leaves);

        let mut stream = builder
            .with_projection(mask)
            .with_row_groups(row_groups)
            .with_batch_size(self.batch_size)
            .build()
            .map_err(classify_parquet)?;

        let lower = Scalar::new(Int64Array::from(vec![rows.start as i64]));
        let upper = Scalar::new(Int64Array::from(vec![rows.end as i64]));

        while let Some(batch) = stream.try_next().await.map_err(classify_parquet)? {
            let dim_0 = int64_column(&batch, DIM_0_COLUMN)?;
            let in_range: BooleanArray = and(&gt_eq(&dim_0, &lower)?, &lt(&dim_0, &upper)?)?;
            if in_range.true_count() == 0 {
                continue;
            }
            let batch = filter_record_batch(&batch, &in_range)?;
            append_triplets(&mut block, &batch)?;
        }

        debug!(
            "read {} entries for rows {}..{} of layer {}",
            block.nnz(),
            rows.start,
            rows.end,
            layer.name
        );
        Ok(block)
    }

    async fn read_var(&self, measurement: &str) -> Result<RecordBatch, StoreError> {
        let builder = self
            .stream_builder(&self.measurement_path(measurement).child(VAR_FILE))
            .await?;
        let schema = builder.schema().clone();
        let batches: Vec<RecordBatch> = builder
            .build()
            .map_err(classify_parquet)?
            .try_collect()
            .await
            .map_err(classify_parquet)?;
        Ok(concat_batches(&schema, &batches)?)
    }
}

/// Maps a Parquet error, keeping object-store failures underneath it classifiable.
fn classify_parquet(err: ParquetError) -> StoreError {
    match err {
        ParquetError::External(inner) => match inner.downcast::<object_store::Error>() {
            Ok(os_err) => StoreError::from_object_store(*os_err, false),
            Err(other) => StoreError::Parquet(ParquetError::External(other)),
        },
        other => StoreError::Parquet(other),
    }
}

/// Parses the `soma_shape` key/value entry, if the file carries one.
fn shape_from_metadata(metadata: &ParquetMetaData) -> Result<Option<(u64, usize)>, StoreError> {
    let entry = metadata
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == SHAPE_METADATA_KEY))
        .and_then(|kv| kv.value.as_deref());

    let Some(value) = entry else {
        return Ok(None);
    };

    let bad = || StoreError::malformed(format!("invalid {} metadata '{}'", SHAPE_METADATA_KEY, value));
    let (rows, cols) = value.split_once(',').ok_or_else(bad)?;
    let n_rows = rows.trim().parse::<u64>().map_err(|_| bad())?;
    let n_cols = cols.trim().parse::<usize>().map_err(|_| bad())?;
    Ok(Some((n_rows, n_cols)))
}

/// Row groups whose `soma_dim_0` statistics overlap `rows`. Groups without
/// usable statistics are always read.
fn overlapping_row_groups(metadata: &ParquetMetaData, rows: &Range<u64>) -> Vec<usize> {
    let schema_descr = metadata.file_metadata().schema_descr();
    let dim_0_leaf = schema_descr.columns().iter().position(|c| c.name() == DIM_0_COLUMN);

    let query_min = rows.start as i64;
    let query_max = rows.end as i64 - 1;

    (0..metadata.num_row_groups())
        .filter(|&rg_idx| {
            let Some(leaf) = dim_0_leaf else {
                return true;
            };
            match metadata.row_group(rg_idx).column(leaf).statistics() {
                Some(Statistics::Int64(s)) => {
                    let rg_min = s.min_opt().copied().unwrap_or(i64::MIN);
                    let rg_max = s.max_opt().copied().unwrap_or(i64::MAX);
                    rg_max >= query_min && rg_min <= query_max
                }
                Some(Statistics::Int32(s)) => {
                    let rg_min = s.min_opt().map(|v| *v as i64).unwrap_or(i64::MIN);
                    let rg_max = s.max_opt().map(|v| *v as i64).unwrap_or(i64::MAX);
                    rg_max >= query_min && rg_min <= query_max
                }
                _ => true,
            }
        })
        .collect()
}

fn int64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array, StoreError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::malformed(format!("matrix batch has no '{}' column", name)))?;
    let casted = cast(column, &DataType::Int64)?;
    casted
        .as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| StoreError::malformed(format!("'{}' did not cast to Int64", name)))
}

fn append_triplets(block: &mut SparseBlock, batch: &RecordBatch) -> Result<(), StoreError> {
    let dim_0 = int64_column(batch, DIM_0_COLUMN)?;
    let dim_1 = int64_column(batch, DIM_1_COLUMN)?;
    let data_column = batch
        .column_by_name(DATA_COLUMN)
        .ok_or_else(|| StoreError::malformed("matrix batch has no 'soma_data' column"))?;
    let data = cast(data_column, &DataType::Float32)?;
    let data = data
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| StoreError::malformed("'soma_data' did not cast to Float32"))?;

    if dim_0.null_count() > 0 || dim_1.null_count() > 0 {
        return Err(StoreError::malformed("null matrix coordinate"));
    }

    for i in 0..batch.num_rows() {
        let row = dim_0.value(i);
        let col = dim_1.value(i);
        if row < 0 || col < 0 || col > u32::MAX as i64 {
            return Err(StoreError::malformed(format!("invalid coordinate ({}, {})", row, col)));
        }
        let value = if data.is_null(i) { 0.0 } else { data.value(i) };
        block.push(row as u64, col as u32, value);
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/parquet_experiment_tests.rs"]
mod tests;
