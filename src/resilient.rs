//! Retry wrapper for remote store calls.
//!
//! A store that is still coming up reports [`StoreError::Unavailable`]. Calls made
//! through [`with_retries`] wait a linearly growing delay and try again, up to the
//! policy's attempt budget. Any other error is returned immediately.
//!
//! Some store versions reject a call shape (for example a predicate combined with
//! a column projection). [`with_fallback`] takes the primary shape and a simpler
//! fallback shape; an [`StoreError::Incompatible`] answer switches to the fallback
//! once and does not count against the attempt budget.
//!
//! No state survives between invocations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::SliceConfig;
use crate::error::{Result, SliceError, StoreError};

/// Attempt budget and delay schedule for one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
    /// Added to the zero-based attempt index to get the delay multiplier.
    pub offset: u32,
}

impl RetryPolicy {
    /// Policy for opening a store: waits 1, 2, 3... units.
    pub fn open(config: &SliceConfig) -> Self {
        Self {
            max_attempts: config.max_tries.max(1),
            unit: config.retry_unit,
            offset: 1,
        }
    }

    /// Policy for reads against an open store: waits 2, 3, 4... units.
    pub fn read(config: &SliceConfig) -> Self {
        Self {
            max_attempts: config.max_tries.max(1),
            unit: config.retry_unit,
            offset: 2,
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.unit * (attempt + self.offset)
    }
}

/// Which call shape a fallback-capable operation starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Primary,
    Fallback,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or exhausts the budget.
pub async fn with_retries<T, F, Fut>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => back_off(operation, policy, &mut attempt, err).await?,
        }
    }
}

/// Sleeps before the next attempt after a transient failure.
///
/// Fails with [`SliceError::RetriesExhausted`] once `attempt` reaches the budget and
/// lifts non-transient errors without sleeping.
async fn back_off(operation: &str, policy: RetryPolicy, attempt: &mut u32, err: StoreError) -> Result<()> {
    if !err.is_transient() {
        return Err(SliceError::from_store(err));
    }
    *attempt += 1;
    if *attempt >= policy.max_attempts {
        return Err(SliceError::RetriesExhausted {
            operation: operation.to_string(),
            attempts: *attempt,
            source: err,
        });
    }
    let delay = policy.delay_for(*attempt - 1);
    warn!(
        "{} failed on try {}/{} ({}). Retrying in {:?}...",
        operation, attempt, policy.max_attempts, err, delay
    );
    tokio::time::sleep(delay).await;
    Ok(())
}

/// Like [`with_retries`], with a one-time switch from `primary` to `fallback`
/// when the store rejects the primary call shape.
///
/// `start` comes from the store's capability probe; a store known not to support
/// the primary shape starts directly on the fallback.
pub async fn with_fallback<T, P, PFut, F, FFut>(
    operation: &str,
    policy: RetryPolicy,
    start: CallShape,
    mut primary: P,
    mut fallback: F,
) -> Result<T>
where
    P: FnMut() -> PFut,
    PFut: Future<Output = std::result::Result<T, StoreError>>,
    F: FnMut() -> FFut,
    FFut: Future<Output = std::result::Result<T, StoreError>>,
{
    let mut shape = start;
    let mut attempt = 0u32;
    loop {
        let outcome = match shape {
            CallShape::Primary => primary().await,
            CallShape::Fallback => fallback().await,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(StoreError::Incompatible(reason)) if shape == CallShape::Primary => {
                warn!("{}: store rejected call shape ({}), falling back", operation, reason);
                shape = CallShape::Fallback;
            }
            Err(err) => back_off(operation, policy, &mut attempt, err).await?,
        }
    }
}
