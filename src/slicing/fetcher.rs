//! Concurrent block fetcher.
//!
//! Each [`ContiguousBlock`] is read as one row-range read across all columns, then
//! cut down to its member rows. With one worker the blocks are read in order on the
//! calling task. With more, the blocks are queued on a job channel drained by a
//! fixed set of worker tasks; results land in a slot keyed by block index, so the
//! order in which reads complete never matters.
//!
//! The first failing block stops workers from taking new jobs. Reads already in
//! flight are allowed to finish before the error is returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{Result, SliceError};
use crate::resilient::{with_retries, RetryPolicy};
use crate::slicing::blocks::ContiguousBlock;
use crate::sparse_matrix::CsrMatrix;
use crate::store::{ExperimentStore, MatrixLayer};

/// The rows of one block, in member order.
///
/// `matrix` has exactly `members.len()` rows and the layer's full column count.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub members: Vec<u64>,
    pub matrix: CsrMatrix,
}

impl PartialResult {
    pub fn first_id(&self) -> Option<u64> {
        self.members.first().copied()
    }
}

/// How many blocks pass between progress messages.
pub fn status_interval(total_blocks: usize) -> usize {
    if total_blocks < 1000 { 10 } else { 100 }
}

/// Reads and subselects one block, retrying transient store failures.
///
/// Any failure comes back as [`SliceError::BlockFetch`] carrying the block's range,
/// including a block that reaches past the layer's last row.
pub async fn fetch_block<S>(
    store: &S,
    layer: &MatrixLayer,
    block: &ContiguousBlock,
    policy: RetryPolicy,
) -> Result<PartialResult>
where
    S: ExperimentStore + ?Sized,
{
    let read = async {
        if block.end > layer.n_rows {
            return Err(SliceError::RowsOutOfBounds {
                layer: layer.name.clone(),
                start: block.start,
                end: block.end,
                n_rows: layer.n_rows,
            });
        }
        let operation = format!("read rows {}..{} of {}", block.start, block.end, layer.name);
        let sparse = with_retries(&operation, policy, || store.read_matrix_rows(layer, block.range())).await?;
        let matrix = sparse.extract_rows(&block.members)?;
        Ok::<_, SliceError>(matrix)
    };

    match read.await {
        Ok(matrix) => {
            debug!("block {}..{}: {} rows, {} entries", block.start, block.end, matrix.n_rows(), matrix.nnz());
            Ok(PartialResult { members: block.members.clone(), matrix })
        }
        Err(source) => Err(SliceError::BlockFetch {
            start: block.start,
            end: block.end,
            source: Box::new(source),
        }),
    }
}

/// Fetches every block, sequentially when `workers <= 1`, otherwise on up to
/// `workers` concurrent tasks.
///
/// Results are returned in block order. One failed block fails the whole fetch.
pub async fn fetch_blocks<S>(
    store: Arc<S>,
    layer: &MatrixLayer,
    blocks: Vec<ContiguousBlock>,
    workers: usize,
    policy: RetryPolicy,
) -> Result<Vec<PartialResult>>
where
    S: ExperimentStore + ?Sized + 'static,
{
    let total = blocks.len();
    let status_div = status_interval(total);

    if workers <= 1 || total <= 1 {
        let mut results = Vec::with_capacity(total);
        for (i, block) in blocks.iter().enumerate() {
            results.push(fetch_block(store.as_ref(), layer, block, policy).await?);
            if (i + 1) % status_div == 0 {
                info!("Processed {}/{} blocks", i + 1, total);
            }
        }
        return Ok(results);
    }

    let (job_tx, job_rx) = mpsc::channel::<(usize, ContiguousBlock)>(total);
    for job in blocks.into_iter().enumerate() {
        job_tx
            .send(job)
            .await
            .map_err(|e| SliceError::Task(format!("job queue closed: {}", e)))?;
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let stop = Arc::new(AtomicBool::new(false));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, Result<PartialResult>)>();

    let mut tasks = JoinSet::new();
    for _ in 0..workers.min(total) {
        let store = Arc::clone(&store);
        let layer = layer.clone();
        let job_rx = Arc::clone(&job_rx);
        let stop = Arc::clone(&stop);
        let result_tx = result_tx.clone();

        tasks.spawn(async move {
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let next = job_rx.lock().await.recv().await;
                let Some((index, block)) = next else {
                    break;
                };
                let outcome = fetch_block(store.as_ref(), &layer, &block, policy).await;
                if outcome.is_err() {
                    stop.store(true, Ordering::SeqCst);
                }
                if result_tx.send((index, outcome)).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut slots: Vec<Option<PartialResult>> = vec![None; total];
    let mut processed = 0usize;
    let mut first_error: Option<SliceError> = None;

    while let Some((index, outcome)) = result_rx.recv().await {
        match outcome {
            Ok(partial) => {
                slots[index] = Some(partial);
                processed += 1;
                if processed % status_div == 0 {
                    info!("Processed {}/{} blocks", processed, total);
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            first_error.get_or_insert(SliceError::Task(e.to_string()));
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| slot.ok_or_else(|| SliceError::Task(format!("block {} produced no result", i))))
        .collect()
}
