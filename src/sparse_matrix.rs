//! Compressed sparse row matrices and the raw blocks they are built from.

use std::ops::Range;

use crate::error::StoreError;

/// Raw coordinates returned by one row-range read of a matrix layer.
///
/// Row coordinates are absolute row identifiers, not offsets into `rows`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseBlock {
    /// Row-identifier window that was requested.
    pub rows: Range<u64>,
    /// Full column count of the layer.
    pub n_cols: usize,
    pub row_ids: Vec<u64>,
    pub col_ids: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseBlock {
    pub fn new(rows: Range<u64>, n_cols: usize) -> Self {
        Self { rows, n_cols, ..Default::default() }
    }

    pub fn push(&mut self, row: u64, col: u32, value: f32) {
        self.row_ids.push(row);
        self.col_ids.push(col);
        self.values.push(value);
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Builds a CSR matrix holding exactly the rows named by `members`, in that order.
    ///
    /// `members` are absolute row identifiers inside the block's window. Rows the
    /// store returned that are not members are dropped.
    pub fn extract_rows(&self, members: &[u64]) -> Result<CsrMatrix, StoreError> {
        let start = self.rows.start;
        let window = self.rows.end.saturating_sub(start) as usize;

        let mut local_rows = Vec::with_capacity(self.row_ids.len());
        for &row in &self.row_ids {
            if !self.rows.contains(&row) {
                return Err(StoreError::malformed(format!(
                    "row {} outside requested range {}..{}",
                    row, self.rows.start, self.rows.end
                )));
            }
            local_rows.push((row - start) as usize);
        }

        let window_matrix =
            CsrMatrix::from_triplets(window, self.n_cols, &local_rows, &self.col_ids, &self.values)?;

        let mut selection = Vec::with_capacity(members.len());
        for &id in members {
            if !self.rows.contains(&id) {
                return Err(StoreError::malformed(format!(
                    "member row {} outside block {}..{}",
                    id, self.rows.start, self.rows.end
                )));
            }
            selection.push((id - start) as usize);
        }

        Ok(window_matrix.select_rows(&selection))
    }
}

/// Sparse matrix in compressed sparse row layout with `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<u32>,
    data: Vec<f32>,
}

impl CsrMatrix {
    /// A matrix with no rows.
    pub fn empty(n_cols: usize) -> Self {
        Self {
            n_rows: 0,
            n_cols,
            indptr: vec![0],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Builds a matrix from coordinate triplets. Duplicate coordinates are summed.
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        rows: &[usize],
        cols: &[u32],
        values: &[f32],
    ) -> Result<Self, StoreError> {
        if rows.len() != cols.len() || rows.len() != values.len() {
            return Err(StoreError::malformed(format!(
                "coordinate arrays differ in length ({}, {}, {})",
                rows.len(),
                cols.len(),
                values.len()
            )));
        }

        // Counting sort by row
        let mut counts = vec![0usize; n_rows + 1];
        for (&r, &c) in rows.iter().zip(cols) {
            if r >= n_rows || c as usize >= n_cols {
                return Err(StoreError::malformed(format!(
                    "coordinate ({}, {}) outside shape ({}, {})",
                    r, c, n_rows, n_cols
                )));
            }
            counts[r + 1] += 1;
        }
        for i in 0..n_rows {
            counts[i + 1] += counts[i];
        }

        let mut next = counts.clone();
        let mut indices = vec![0u32; rows.len()];
        let mut data = vec![0f32; rows.len()];
        for ((&r, &c), &v) in rows.iter().zip(cols).zip(values) {
            let slot = next[r];
            indices[slot] = c;
            data[slot] = v;
            next[r] += 1;
        }

        // Sort each row by column and fold duplicates
        let mut indptr = Vec::with_capacity(n_rows + 1);
        indptr.push(0);
        let mut out_indices = Vec::with_capacity(indices.len());
        let mut out_data = Vec::with_capacity(data.len());
        for r in 0..n_rows {
            let mut entries: Vec<(u32, f32)> = (counts[r]..counts[r + 1])
                .map(|k| (indices[k], data[k]))
                .collect();
            entries.sort_by_key(|&(c, _)| c);
            for (c, v) in entries {
                if out_indices.len() > indptr[r] && out_indices.last() == Some(&c) {
                    if let Some(last) = out_data.last_mut() {
                        *last += v;
                    }
                } else {
                    out_indices.push(c);
                    out_data.push(v);
                }
            }
            indptr.push(out_indices.len());
        }

        Ok(Self {
            n_rows,
            n_cols,
            indptr,
            indices: out_indices,
            data: out_data,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Column indices and values stored for row `i`.
    pub fn row(&self, i: usize) -> (&[u32], &[f32]) {
        let span = self.indptr[i]..self.indptr[i + 1];
        (&self.indices[span.clone()], &self.data[span])
    }

    /// Value at `(row, col)`, zero when not stored.
    pub fn get(&self, row: usize, col: u32) -> f32 {
        let (cols, vals) = self.row(row);
        match cols.binary_search(&col) {
            Ok(k) => vals[k],
            Err(_) => 0.0,
        }
    }

    /// New matrix made of the given rows, in the given order.
    ///
    /// Every entry of `rows` must be `< n_rows`.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let nnz: usize = rows.iter().map(|&r| self.indptr[r + 1] - self.indptr[r]).sum();
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut data = Vec::with_capacity(nnz);
        indptr.push(0);
        for &r in rows {
            let (cols, vals) = self.row(r);
            indices.extend_from_slice(cols);
            data.extend_from_slice(vals);
            indptr.push(indices.len());
        }
        Self {
            n_rows: rows.len(),
            n_cols: self.n_cols,
            indptr,
            indices,
            data,
        }
    }

    /// Stacks matrices vertically. Callers check that every part has `n_cols` columns.
    pub fn vstack(parts: &[CsrMatrix], n_cols: usize) -> Self {
        let n_rows = parts.iter().map(|p| p.n_rows).sum();
        let nnz = parts.iter().map(|p| p.nnz()).sum();
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut data = Vec::with_capacity(nnz);
        indptr.push(0);
        for part in parts {
            let base = indices.len();
            indptr.extend(part.indptr[1..].iter().map(|&p| p + base));
            indices.extend_from_slice(&part.indices);
            data.extend_from_slice(&part.data);
        }
        Self { n_rows, n_cols, indptr, indices, data }
    }
}
