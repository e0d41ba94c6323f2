//! Streaming grouped counts over the obs table.
//!
//! Grouping keys are encoded with arrow's row format, which gives one comparable,
//! hashable byte string per key tuple regardless of the column types involved.
//! Every page is counted on its own and the page counts are then summed into the
//! running totals, so memory grows with the number of distinct groups only.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, SortField};
use futures::StreamExt;
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::config::SliceConfig;
use crate::error::{Result, SliceError};
use crate::obs::{open_obs_pages, page_indices, resolve_fields};
use crate::store::{ExperimentStore, ObsQuery};

/// Name of the count column when the caller does not pick one.
pub const DEFAULT_AGG_NAME: &str = "count_all";

/// Running row counts per grouping key.
///
/// Rows with a null in any grouping column are not counted.
pub struct GroupCounts {
    fields: Vec<FieldRef>,
    converter: RowConverter,
    counts: HashMap<OwnedRow, u64>,
}

impl std::fmt::Debug for GroupCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCounts")
            .field("fields", &self.fields)
            .field("groups", &self.counts.len())
            .finish()
    }
}

impl GroupCounts {
    pub fn new(fields: Vec<FieldRef>) -> Result<Self> {
        if fields.is_empty() {
            return Err(SliceError::config("at least one grouping column is required"));
        }
        let sort_fields = fields
            .iter()
            .map(|f| SortField::new(f.data_type().clone()))
            .collect();
        Ok(Self {
            fields,
            converter: RowConverter::new(sort_fields)?,
            counts: HashMap::new(),
        })
    }

    /// Number of distinct groups seen so far.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Counts one page and adds the page's counts to the totals.
    pub fn update(&mut self, page: &RecordBatch) -> Result<()> {
        if page.num_rows() == 0 {
            return Ok(());
        }
        let partial = self.count_page(page)?;
        self.merge(partial);
        Ok(())
    }

    /// Exact per-group counts of a single page.
    fn count_page(&self, page: &RecordBatch) -> Result<HashMap<OwnedRow, u64>> {
        let indices = page_indices(page, &self.fields)?;
        let columns: Vec<ArrayRef> = indices.iter().map(|&i| Arc::clone(page.column(i))).collect();
        let rows = self.converter.convert_columns(&columns)?;

        let mut counts: HashMap<OwnedRow, u64> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            if columns.iter().any(|c| c.is_null(i)) {
                continue;
            }
            *counts.entry(row.owned()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn merge(&mut self, partial: HashMap<OwnedRow, u64>) {
        for (key, count) in partial {
            *self.counts.entry(key).or_insert(0) += count;
        }
    }

    /// Builds the result table: the grouping columns plus a `agg_name` count
    /// column, sorted by count descending (ties by key ascending).
    pub fn finish(self, agg_name: &str) -> Result<RecordBatch> {
        let mut fields = self.fields.clone();
        fields.push(Arc::new(Field::new(agg_name, DataType::UInt64, false)));
        let schema = Arc::new(Schema::new(fields));

        if self.counts.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }

        let mut entries: Vec<(OwnedRow, u64)> = self.counts.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let decoded = self.converter.convert_rows(entries.iter().map(|(key, _)| key.row()))?;
        // Dictionary keys decode to their value type
        let mut columns = decoded
            .iter()
            .zip(&self.fields)
            .map(|(column, field)| cast(column, field.data_type()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        columns.push(Arc::new(UInt64Array::from_iter_values(entries.iter().map(|(_, n)| *n))));
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

/// Counts obs rows matching `query` per distinct combination of `group_by` values.
///
/// Returns the grouping columns and a count column named `agg_name` (default
/// [`DEFAULT_AGG_NAME`]), largest groups first. When no rows match, the result is an
/// empty table with the same columns.
pub async fn count_groups<S>(
    store: &S,
    group_by: &[String],
    query: Option<&ObsQuery>,
    agg_name: Option<&str>,
    config: &SliceConfig,
) -> Result<RecordBatch>
where
    S: ExperimentStore + ?Sized,
{
    if group_by.is_empty() {
        return Err(SliceError::config("at least one grouping column is required"));
    }

    info!("Counting obs rows grouped by {:?}", group_by);
    let mut read = open_obs_pages(store, group_by, query, config).await?;
    let mut totals = GroupCounts::new(resolve_fields(&read.schema, group_by)?)?;

    let mut pages = 0usize;
    while let Some(page) = read.pages.next().await {
        let page = page.map_err(SliceError::from_store)?;
        totals.update(&page)?;
        pages += 1;
    }

    debug!("merged {} pages into {} groups", pages, totals.len());
    totals.finish(agg_name.unwrap_or(DEFAULT_AGG_NAME))
}
