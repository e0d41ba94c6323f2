use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use tracing::{debug, info};

use crate::config::SliceConfig;
use crate::error::{Result, SliceError};
use crate::obs::{open_obs_pages, page_indices, resolve_fields};
use crate::store::{ExperimentStore, ObsQuery};

/// Reads the obs rows matching `query` (all rows when `None`), keeping only `columns`.
///
/// Pages are concatenated in the order the store returns them. At least one column
/// must be requested.
///
/// # Errors
///
/// * [`SliceError::Config`] when `columns` is empty or names a column obs does not have
/// * [`SliceError::RetriesExhausted`] when the store stays unavailable
pub async fn read_obs_table<S>(
    store: &S,
    columns: &[String],
    query: Option<&ObsQuery>,
    config: &SliceConfig,
) -> Result<RecordBatch>
where
    S: ExperimentStore + ?Sized,
{
    if columns.is_empty() {
        return Err(SliceError::config("at least one obs column must be requested"));
    }

    info!("Reading obs metadata");
    let mut read = open_obs_pages(store, columns, query, config).await?;
    let fields = resolve_fields(&read.schema, columns)?;
    let schema = Arc::new(Schema::new(fields.clone()));

    let mut kept = Vec::new();
    while let Some(page) = read.pages.next().await {
        let page = page.map_err(SliceError::from_store)?;
        if page.num_rows() == 0 {
            continue;
        }
        let indices = page_indices(&page, &fields)?;
        let projected = page.project(&indices)?;
        // Field metadata can differ between the file schema and a decoded page
        kept.push(RecordBatch::try_new(Arc::clone(&schema), projected.columns().to_vec())?);
    }

    debug!("obs read returned {} non-empty pages", kept.len());
    Ok(concat_batches(&schema, &kept)?)
}
