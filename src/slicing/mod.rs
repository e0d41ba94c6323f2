//! Partition, fetch and reassemble a row-filtered slice of a matrix layer.
//!
//! 1. [`blocks::group_contiguous`] turns the selected row identifiers into maximal
//!    runs of consecutive identifiers.
//! 2. [`fetcher::fetch_blocks`] reads each run as one row-range read, with retries,
//!    sequentially or across a bounded set of workers, and keeps only the member rows.
//! 3. [`reassemble::reassemble`] orders the partial matrices by first identifier,
//!    checks that their column counts agree, and stacks them.

pub mod blocks;
pub mod fetcher;
pub mod reassemble;

pub use blocks::{group_contiguous, ContiguousBlock};
pub use fetcher::{fetch_blocks, PartialResult};
pub use reassemble::reassemble;

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;
