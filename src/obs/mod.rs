//! Paged readers over the obs table.
//!
//! [`reader::read_obs_table`] keeps the requested columns of every page and
//! concatenates them. [`aggregate::count_groups`] counts rows per grouping key one
//! page at a time and merges the per-page counts, so the ungrouped table is never
//! held in memory.
//!
//! Both open their read through [`open_obs_pages`], which picks the call shape from
//! the store's capabilities and falls back to an unprojected read when the store
//! rejects a projection combined with a query.

pub mod aggregate;
pub mod reader;

use arrow::datatypes::{FieldRef, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::config::SliceConfig;
use crate::error::{Result, SliceError};
use crate::resilient::{with_fallback, with_retries, CallShape, RetryPolicy};
use crate::store::{ExperimentStore, ObsPages, ObsQuery, ObsRead};

pub use aggregate::{count_groups, GroupCounts, DEFAULT_AGG_NAME};
pub use reader::read_obs_table;

/// Opens a paged obs read for `columns`, filtered by `query`.
///
/// Pages may carry more columns than requested when the store only accepted the
/// unprojected call shape; callers select their columns by name.
pub async fn open_obs_pages<S>(
    store: &S,
    columns: &[String],
    query: Option<&ObsQuery>,
    config: &SliceConfig,
) -> Result<ObsPages>
where
    S: ExperimentStore + ?Sized,
{
    let policy = RetryPolicy::read(config);
    let projected = ObsRead::Projected {
        query: query.cloned(),
        columns: columns.to_vec(),
    };

    let Some(query) = query else {
        return with_retries("read obs", policy, || store.read_obs(projected.clone())).await;
    };

    let unprojected = ObsRead::Unprojected { query: Some(query.clone()) };
    let start = if store.capabilities().projection_with_query {
        CallShape::Primary
    } else {
        CallShape::Fallback
    };

    with_fallback(
        "read obs",
        policy,
        start,
        || store.read_obs(projected.clone()),
        || store.read_obs(unprojected.clone()),
    )
    .await
}

/// Looks up `columns` in `schema`, failing with the available names when one is missing.
fn resolve_fields(schema: &SchemaRef, columns: &[String]) -> Result<Vec<FieldRef>> {
    columns
        .iter()
        .map(|column| {
            schema
                .field_with_name(column)
                .map(|f| std::sync::Arc::new(f.clone()))
                .map_err(|_| unknown_column(schema, column))
        })
        .collect()
}

/// Positions of `fields` in one page, matched by name.
fn page_indices(page: &RecordBatch, fields: &[FieldRef]) -> Result<Vec<usize>> {
    let schema = page.schema();
    fields
        .iter()
        .map(|f| schema.index_of(f.name()).map_err(|_| unknown_column(&schema, f.name())))
        .collect()
}

fn unknown_column(schema: &SchemaRef, column: &str) -> SliceError {
    let available: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    SliceError::config(format!("unknown obs column '{}' (available: {:?})", column, available))
}
