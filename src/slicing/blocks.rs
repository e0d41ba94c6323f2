//! Grouping of row identifiers into contiguous blocks.
//!
//! Each block becomes one range read against the matrix store. Grouping favors
//! fewer reads over smaller reads: a run of consecutive identifiers is always
//! fetched as a single range.

use std::ops::Range;

/// A maximal run of consecutive row identifiers.
///
/// `members` is sorted, non-empty, and strictly consecutive; `end == last member + 1`.
/// The member list is kept (not just the range) because a range read may return
/// rows that were not asked for, and extraction indexes by these exact identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousBlock {
    pub start: u64,
    pub end: u64,
    pub members: Vec<u64>,
}

impl ContiguousBlock {
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn first_id(&self) -> u64 {
        self.start
    }

    fn from_run(members: Vec<u64>) -> Self {
        let start = members[0];
        let end = members[members.len() - 1] + 1;
        Self { start, end, members }
    }
}

/// Groups row identifiers into contiguous blocks, ordered by first identifier.
///
/// The input does not need to be sorted. A new block starts whenever the next
/// identifier is not exactly one greater than the last one in the current block.
///
/// # Examples
///
/// ```
/// use cellslice::slicing::blocks::group_contiguous;
///
/// let blocks = group_contiguous(&[10, 1, 2, 3, 7, 8]);
/// let ranges: Vec<_> = blocks.iter().map(|b| (b.start, b.end)).collect();
/// assert_eq!(ranges, vec![(1, 4), (7, 9), (10, 11)]);
/// ```
pub fn group_contiguous(ids: &[u64]) -> Vec<ContiguousBlock> {
    if ids.is_empty() {
        return Vec::new();
    }

    let sorted: Vec<u64> = if ids.windows(2).all(|w| w[0] <= w[1]) {
        ids.to_vec()
    } else {
        let mut v = ids.to_vec();
        v.sort_unstable();
        v
    };

    let mut blocks = Vec::new();
    let mut current: Vec<u64> = vec![sorted[0]];

    for &id in &sorted[1..] {
        // `current` is never empty here
        let last = current[current.len() - 1];
        if last.checked_add(1) == Some(id) {
            current.push(id);
        } else {
            blocks.push(ContiguousBlock::from_run(std::mem::replace(&mut current, vec![id])));
        }
    }
    blocks.push(ContiguousBlock::from_run(current));

    blocks
}
