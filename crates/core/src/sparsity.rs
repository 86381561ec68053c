//! # Sparsity Patterns
//!
//! A sparsity pattern is the *type* of a matrix expression: its dimensions
//! plus the set of positions that may be nonzero. Every buffer in the graph
//! stores one value per declared nonzero, in column-major order, so two
//! expressions with equal patterns have interchangeable buffers.
//!
//! ## Storage
//!
//! Compressed column storage (CCS):
//!
//! - `colind[c]..colind[c + 1]` is the range of nonzeros in column `c`
//! - `row[k]` is the row of nonzero `k`, strictly increasing within a column
//!
//! Patterns are immutable and shared by value (`Arc`). Equality is
//! structural. An optional process-wide intern pool deduplicates equal
//! patterns so that equality usually short-circuits on pointer identity.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Pattern {
    nrow: usize,
    ncol: usize,
    colind: Vec<usize>,
    row: Vec<usize>,
}

/// Immutable structural description of a matrix's nonzero layout.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "CompressedSparsity", into = "CompressedSparsity")]
pub struct SparsityPattern {
    inner: Arc<Pattern>,
}

/// Plain serialized form of a [`SparsityPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSparsity {
    pub nrow: usize,
    pub ncol: usize,
    pub colind: Vec<usize>,
    pub row: Vec<usize>,
}

impl TryFrom<CompressedSparsity> for SparsityPattern {
    type Error = CoreError;

    fn try_from(c: CompressedSparsity) -> Result<Self, Self::Error> {
        SparsityPattern::new(c.nrow, c.ncol, c.colind, c.row)
    }
}

impl From<SparsityPattern> for CompressedSparsity {
    fn from(sp: SparsityPattern) -> Self {
        CompressedSparsity {
            nrow: sp.nrow(),
            ncol: sp.ncol(),
            colind: sp.colind().to_vec(),
            row: sp.row().to_vec(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidSparsity {
        reason: reason.into(),
    }
}

impl SparsityPattern {
    fn from_parts(nrow: usize, ncol: usize, colind: Vec<usize>, row: Vec<usize>) -> Self {
        Self {
            inner: Arc::new(Pattern {
                nrow,
                ncol,
                colind,
                row,
            }),
        }
    }

    /// Create a pattern from compressed column storage.
    ///
    /// Returns an error if `colind` is not a monotone offset vector of
    /// length `ncol + 1`, or if rows are out of range or unsorted.
    pub fn new(
        nrow: usize,
        ncol: usize,
        colind: Vec<usize>,
        row: Vec<usize>,
    ) -> Result<Self, CoreError> {
        let expected = ncol
            .checked_add(1)
            .ok_or_else(|| invalid(format!("column count {ncol} too large")))?;
        if colind.len() != expected {
            return Err(invalid(format!(
                "colind has length {}, expected {expected}",
                colind.len()
            )));
        }
        if colind[0] != 0 || colind[ncol] != row.len() {
            return Err(invalid("colind must start at 0 and end at nnz"));
        }
        if let Some(c) = colind.windows(2).position(|w| w[0] > w[1]) {
            return Err(invalid(format!("colind decreases at column {c}")));
        }
        for c in 0..ncol {
            let rows = &row[colind[c]..colind[c + 1]];
            for (i, &r) in rows.iter().enumerate() {
                if r >= nrow {
                    return Err(invalid(format!("row {r} out of range in column {c}")));
                }
                if i > 0 && rows[i - 1] >= r {
                    return Err(invalid(format!("rows not strictly increasing in column {c}")));
                }
            }
        }
        Ok(Self::from_parts(nrow, ncol, colind, row))
    }

    /// Fully dense `nrow x ncol` pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let colind = (0..=ncol).map(|c| c * nrow).collect();
        let row = (0..ncol).flat_map(|_| 0..nrow).collect();
        Self::from_parts(nrow, ncol, colind, row)
    }

    /// Pattern with no structural nonzeros.
    pub fn empty(nrow: usize, ncol: usize) -> Self {
        Self::from_parts(nrow, ncol, vec![0; ncol + 1], Vec::new())
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Self::dense(1, 1)
    }

    /// Dense `n x 1` column.
    pub fn dense_column(n: usize) -> Self {
        Self::dense(n, 1)
    }

    /// `n x n` diagonal pattern.
    pub fn diagonal(n: usize) -> Self {
        Self::from_parts(n, n, (0..=n).collect(), (0..n).collect())
    }

    /// Build a pattern from `(row, col)` coordinates. Duplicates are merged.
    pub fn from_triplets(
        nrow: usize,
        ncol: usize,
        entries: &[(usize, usize)],
    ) -> Result<Self, CoreError> {
        let mut sorted = entries.to_vec();
        for &(r, c) in &sorted {
            if r >= nrow || c >= ncol {
                return Err(invalid(format!(
                    "entry ({r}, {c}) outside {nrow}x{ncol}"
                )));
            }
        }
        sorted.sort_by_key(|&(r, c)| (c, r));
        sorted.dedup();

        let mut colind = vec![0; ncol + 1];
        for &(_, c) in &sorted {
            colind[c + 1] += 1;
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        let row = sorted.iter().map(|&(r, _)| r).collect();
        Ok(Self::from_parts(nrow, ncol, colind, row))
    }

    /// Parse the compressed integer form `[nrow, ncol, colind.., row..]`.
    pub fn from_compressed(data: &[usize]) -> Result<Self, CoreError> {
        if data.len() < 2 {
            return Err(invalid("compressed form needs at least nrow and ncol"));
        }
        let (nrow, ncol) = (data[0], data[1]);
        let colind_end = ncol
            .checked_add(3)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| invalid("compressed form truncated in colind"))?;
        let colind = data[2..colind_end].to_vec();
        let nnz = colind[ncol];
        let expected = colind_end
            .checked_add(nnz)
            .ok_or_else(|| invalid(format!("nonzero count {nnz} too large")))?;
        if data.len() != expected {
            return Err(invalid(format!(
                "compressed form has length {}, expected {expected}",
                data.len()
            )));
        }
        Self::new(nrow, ncol, colind, data[colind_end..].to_vec())
    }

    /// Export as `[nrow, ncol, colind[0..=ncol], row[0..nnz]]`.
    pub fn compressed(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(3 + self.ncol() + self.nnz());
        out.push(self.nrow());
        out.push(self.ncol());
        out.extend_from_slice(self.colind());
        out.extend_from_slice(self.row());
        out
    }

    pub fn nrow(&self) -> usize {
        self.inner.nrow
    }

    pub fn ncol(&self) -> usize {
        self.inner.ncol
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.inner.row.len()
    }

    /// Number of elements, zero or not.
    pub fn numel(&self) -> usize {
        self.nrow() * self.ncol()
    }

    pub fn colind(&self) -> &[usize] {
        &self.inner.colind
    }

    pub fn row(&self) -> &[usize] {
        &self.inner.row
    }

    /// Nonzero index range of column `c`.
    pub fn col_range(&self, c: usize) -> Range<usize> {
        self.inner.colind[c]..self.inner.colind[c + 1]
    }

    pub fn is_dense(&self) -> bool {
        self.nnz() == self.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.nrow() == 1 && self.ncol() == 1
    }

    pub fn is_column(&self) -> bool {
        self.ncol() == 1
    }

    /// Same dimensions, regardless of structure.
    pub fn same_dims(&self, other: &SparsityPattern) -> bool {
        self.nrow() == other.nrow() && self.ncol() == other.ncol()
    }

    /// Dimensions as `"RxC"`, used in error messages.
    pub fn dims(&self) -> String {
        format!("{}x{}", self.nrow(), self.ncol())
    }

    /// Nonzero index of position `(r, c)`, if structurally present.
    pub fn get_nz(&self, r: usize, c: usize) -> Option<usize> {
        if r >= self.nrow() || c >= self.ncol() {
            return None;
        }
        let range = self.col_range(c);
        let start = range.start;
        self.inner.row[range]
            .binary_search(&r)
            .ok()
            .map(|i| start + i)
    }

    /// Iterate `(row, col, nz)` in storage order.
    pub fn nonzeros(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.ncol()).flat_map(move |c| self.col_range(c).map(move |k| (self.inner.row[k], c, k)))
    }

    /// Structural union of two patterns with equal dimensions.
    pub fn union(&self, other: &SparsityPattern) -> SparsityPattern {
        debug_assert!(self.same_dims(other));
        if self == other {
            return self.clone();
        }
        let mut colind = Vec::with_capacity(self.ncol() + 1);
        let mut row = Vec::with_capacity(self.nnz().max(other.nnz()));
        colind.push(0);
        for c in 0..self.ncol() {
            let a = &self.row()[self.col_range(c)];
            let b = &other.row()[other.col_range(c)];
            let (mut i, mut j) = (0, 0);
            while i < a.len() || j < b.len() {
                let next = match (a.get(i), b.get(j)) {
                    (Some(&x), Some(&y)) if x == y => {
                        i += 1;
                        j += 1;
                        x
                    }
                    (Some(&x), Some(&y)) if x < y => {
                        i += 1;
                        x
                    }
                    (Some(_), Some(&y)) => {
                        j += 1;
                        y
                    }
                    (Some(&x), None) => {
                        i += 1;
                        x
                    }
                    (None, Some(&y)) => {
                        j += 1;
                        y
                    }
                    (None, None) => break,
                };
                row.push(next);
            }
            colind.push(row.len());
        }
        Self::from_parts(self.nrow(), self.ncol(), colind, row)
    }

    /// True if every nonzero of `self` is also a nonzero of `other`.
    pub fn is_subset(&self, other: &SparsityPattern) -> bool {
        self.same_dims(other) && self.nonzeros().all(|(r, c, _)| other.get_nz(r, c).is_some())
    }

    /// Position of each nonzero of `sub` inside `self`.
    ///
    /// Returns `None` unless `sub` is structurally contained in `self`.
    pub fn nz_map(&self, sub: &SparsityPattern) -> Option<Vec<usize>> {
        if !self.same_dims(sub) {
            return None;
        }
        if self == sub {
            return Some((0..self.nnz()).collect());
        }
        sub.nonzeros().map(|(r, c, _)| self.get_nz(r, c)).collect()
    }

    /// Tile horizontally `n` times. In column-major storage the nonzero
    /// vector of the result is the source nonzero vector repeated.
    pub fn horzrep(&self, n: usize) -> SparsityPattern {
        let nnz = self.nnz();
        let mut colind = Vec::with_capacity(self.ncol() * n + 1);
        colind.push(0);
        for rep in 0..n {
            colind.extend(self.colind()[1..].iter().map(|&k| rep * nnz + k));
        }
        let row = self.row().repeat(n);
        Self::from_parts(self.nrow(), self.ncol() * n, colind, row)
    }

    /// Split into `n` equal-width horizontal blocks and return the union of
    /// the block patterns, plus for every nonzero of `self` its position in
    /// that union.
    pub fn horzsplit_union(&self, n: usize) -> Result<(SparsityPattern, Vec<usize>), CoreError> {
        if n == 0 {
            return Err(CoreError::InvalidReplication { n });
        }
        if self.ncol() % n != 0 {
            return Err(CoreError::IndivisibleColumns {
                ncol: self.ncol(),
                n,
            });
        }
        let width = self.ncol() / n;
        let mut entries = Vec::with_capacity(self.nnz());
        for (r, c, _) in self.nonzeros() {
            entries.push((r, c % width));
        }
        let block = Self::from_triplets(self.nrow(), width, &entries)?;
        let mut map = Vec::with_capacity(self.nnz());
        for (r, c, _) in self.nonzeros() {
            let k = block.get_nz(r, c % width).ok_or_else(|| {
                invalid("block union lost an entry")
            })?;
            map.push(k);
        }
        Ok((block, map))
    }

    /// Transposed pattern and, for each nonzero of the result, the index of
    /// the source nonzero it comes from.
    pub fn transpose_with_map(&self) -> (SparsityPattern, Vec<usize>) {
        let (nrow, ncol, nnz) = (self.nrow(), self.ncol(), self.nnz());
        let mut colind = vec![0; nrow + 1];
        for &r in self.row() {
            colind[r + 1] += 1;
        }
        for r in 0..nrow {
            colind[r + 1] += colind[r];
        }
        let mut next = colind.clone();
        let mut row = vec![0; nnz];
        let mut map = vec![0; nnz];
        for c in 0..ncol {
            for k in self.col_range(c) {
                let r = self.row()[k];
                let dst = next[r];
                next[r] += 1;
                row[dst] = c;
                map[dst] = k;
            }
        }
        (Self::from_parts(ncol, nrow, colind, row), map)
    }

    pub fn transpose(&self) -> SparsityPattern {
        self.transpose_with_map().0
    }

    /// Pattern of the product `self * other`.
    pub fn mtimes(&self, other: &SparsityPattern) -> SparsityPattern {
        debug_assert_eq!(self.ncol(), other.nrow());
        let m = self.nrow();
        let mut mark = vec![usize::MAX; m];
        let mut colind = Vec::with_capacity(other.ncol() + 1);
        let mut row = Vec::new();
        colind.push(0);
        for j in 0..other.ncol() {
            let start = row.len();
            for kb in other.col_range(j) {
                let kk = other.row()[kb];
                for ka in self.col_range(kk) {
                    let i = self.row()[ka];
                    if mark[i] != j {
                        mark[i] = j;
                        row.push(i);
                    }
                }
            }
            row[start..].sort_unstable();
            colind.push(row.len());
        }
        Self::from_parts(m, other.ncol(), colind, row)
    }

    /// Pattern of `x * y'` for column vectors `x` (m x 1) and `y` (n x 1).
    pub fn outer(x: &SparsityPattern, y: &SparsityPattern) -> SparsityPattern {
        let (m, n) = (x.nrow(), y.nrow());
        let xrows = x.row();
        let mut colind = vec![0; n + 1];
        let mut row = Vec::with_capacity(xrows.len() * y.nnz());
        let mut ycols = y.row().iter().peekable();
        for (c, slot) in colind.iter_mut().skip(1).enumerate() {
            if ycols.peek() == Some(&&c) {
                ycols.next();
                row.extend_from_slice(xrows);
            }
            *slot = row.len();
        }
        Self::from_parts(m, n, colind, row)
    }

    /// Expand nonzero values into a dense column-major buffer.
    pub fn dense_values(&self, nz: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.numel()];
        for (r, c, k) in self.nonzeros() {
            out[c * self.nrow() + r] = nz[k];
        }
        out
    }

    /// Return the pooled instance equal to this pattern, inserting it if
    /// absent. The pool is process-wide and guarded by a mutex.
    pub fn interned(self) -> SparsityPattern {
        static POOL: OnceLock<Mutex<HashSet<Arc<Pattern>>>> = OnceLock::new();
        let pool = POOL.get_or_init(|| Mutex::new(HashSet::new()));
        let mut pool = pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = pool.get(&self.inner) {
            return SparsityPattern {
                inner: Arc::clone(existing),
            };
        }
        pool.insert(Arc::clone(&self.inner));
        self
    }

    /// True if both handles point at the same shared pattern.
    pub fn ptr_eq(&self, other: &SparsityPattern) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for SparsityPattern {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.inner == other.inner
    }
}

impl Eq for SparsityPattern {}

impl Hash for SparsityPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl fmt::Debug for SparsityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SparsityPattern({self})")
    }
}

impl fmt::Display for SparsityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dense() {
            write!(f, "dense {}", self.dims())
        } else {
            write!(f, "{} ({} nnz)", self.dims(), self.nnz())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layout() {
        let sp = SparsityPattern::dense(2, 3);
        assert_eq!(sp.colind(), &[0, 2, 4, 6]);
        assert_eq!(sp.row(), &[0, 1, 0, 1, 0, 1]);
        assert!(sp.is_dense());
        assert_eq!(sp.get_nz(1, 2), Some(5));
    }

    #[test]
    fn test_new_rejects_unsorted_rows() {
        let err = SparsityPattern::new(3, 1, vec![0, 2], vec![2, 1]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSparsity { .. }));
    }

    #[test]
    fn test_union_and_subset() {
        let a = SparsityPattern::diagonal(2);
        let b = SparsityPattern::from_triplets(2, 2, &[(0, 1)]).unwrap();
        let u = a.union(&b);
        assert_eq!(u.nnz(), 3);
        assert!(a.is_subset(&u));
        assert!(b.is_subset(&u));
        assert!(!u.is_subset(&a));
        assert_eq!(u.nz_map(&b), Some(vec![1]));
        assert_eq!(a.nz_map(&u), None);
    }

    #[test]
    fn test_horzrep_repeats_nonzeros() {
        let x = SparsityPattern::from_triplets(2, 2, &[(0, 0), (1, 1)]).unwrap();
        let r = x.horzrep(3);
        assert_eq!(r.ncol(), 6);
        assert_eq!(r.nnz(), 6);
        assert_eq!(r.row(), &[0, 1, 0, 1, 0, 1]);
        assert_eq!(r.get_nz(1, 5), Some(5));
    }

    #[test]
    fn test_horzsplit_union() {
        // Block 0 has (0,0), block 1 has (1,0).
        let x = SparsityPattern::from_triplets(2, 2, &[(0, 0), (1, 1)]).unwrap();
        let (block, map) = x.horzsplit_union(2).unwrap();
        assert_eq!(block, SparsityPattern::dense_column(2));
        assert_eq!(map, vec![0, 1]);
        assert!(matches!(
            x.horzsplit_union(3),
            Err(CoreError::IndivisibleColumns { ncol: 2, n: 3 })
        ));
    }

    #[test]
    fn test_transpose_map() {
        let x = SparsityPattern::from_triplets(2, 3, &[(0, 2), (1, 0)]).unwrap();
        let (t, map) = x.transpose_with_map();
        assert_eq!(t.dims(), "3x2");
        assert_eq!(t.get_nz(2, 0), Some(0));
        assert_eq!(t.get_nz(0, 1), Some(1));
        assert_eq!(map, vec![1, 0]);
    }

    #[test]
    fn test_mtimes_pattern() {
        let a = SparsityPattern::diagonal(3);
        let b = SparsityPattern::from_triplets(3, 1, &[(1, 0)]).unwrap();
        let c = a.mtimes(&b);
        assert_eq!(c, b);
    }

    #[test]
    fn test_outer_pattern() {
        let x = SparsityPattern::from_triplets(3, 1, &[(0, 0), (2, 0)]).unwrap();
        let y = SparsityPattern::from_triplets(2, 1, &[(1, 0)]).unwrap();
        let o = SparsityPattern::outer(&x, &y);
        assert_eq!(o.dims(), "3x2");
        assert_eq!(o.nnz(), 2);
        assert!(o.get_nz(0, 1).is_some());
        assert!(o.get_nz(2, 1).is_some());
        assert!(o.get_nz(0, 0).is_none());
    }

    #[test]
    fn test_compressed_roundtrip() {
        let x = SparsityPattern::from_triplets(3, 2, &[(2, 0), (0, 1)]).unwrap();
        let c = x.compressed();
        assert_eq!(c, vec![3, 2, 0, 1, 2, 2, 0]);
        assert_eq!(SparsityPattern::from_compressed(&c).unwrap(), x);
        assert!(SparsityPattern::from_compressed(&c[..5]).is_err());
    }

    #[test]
    fn test_compressed_rejects_oversized_header() {
        for data in [
            vec![1, usize::MAX],
            vec![1, usize::MAX - 2],
            vec![1, 1, 0, usize::MAX],
        ] {
            let err = SparsityPattern::from_compressed(&data).unwrap_err();
            assert!(matches!(err, CoreError::InvalidSparsity { .. }), "{data:?}");
        }
        let err = SparsityPattern::new(1, usize::MAX, vec![0], vec![]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSparsity { .. }));
    }

    #[test]
    fn test_interning_shares_storage() {
        let a = SparsityPattern::dense(7, 5).interned();
        let b = SparsityPattern::dense(7, 5).interned();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_serde_validates() {
        let sp = SparsityPattern::diagonal(2);
        let json = serde_json::to_string(&sp).unwrap();
        let back: SparsityPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sp);

        let bad = r#"{"nrow":1,"ncol":1,"colind":[0,1],"row":[3]}"#;
        assert!(serde_json::from_str::<SparsityPattern>(bad).is_err());
    }
}
