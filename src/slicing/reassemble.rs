//! Ordering and stacking of fetched partial matrices.

use tracing::info;

use crate::error::{Result, SliceError};
use crate::slicing::fetcher::PartialResult;
use crate::sparse_matrix::CsrMatrix;

/// Stacks partial results into one matrix, ordered by each result's first identifier.
///
/// The row order of the output is ascending identifier order regardless of the
/// order in which `partials` are supplied. Fails with [`SliceError::NoData`] when
/// nothing was fetched and with [`SliceError::ShapeMismatch`] when a result's
/// column count differs from the first result's.
pub fn reassemble(mut partials: Vec<PartialResult>) -> Result<CsrMatrix> {
    if partials.is_empty() {
        return Err(SliceError::no_data("no measurement data was read"));
    }

    partials.sort_by_key(|p| p.first_id());

    let expected = partials[0].matrix.n_cols();
    for (block, partial) in partials.iter().enumerate().skip(1) {
        let actual = partial.matrix.n_cols();
        if actual != expected {
            return Err(SliceError::ShapeMismatch { block, expected, actual });
        }
    }

    info!("Stacking {} blocks", partials.len());
    let parts: Vec<CsrMatrix> = partials.into_iter().map(|p| p.matrix).collect();
    Ok(CsrMatrix::vstack(&parts, expected))
}
