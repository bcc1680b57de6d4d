//! Hard permutations of set elements

use crate::{CanonError, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Bijection on `0..n`.
///
/// `indices()[r]` is the element that lands in slot `r` after sorting, so
/// gathering with a permutation sorts and scattering with it unsorts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permutation {
    indices: Vec<usize>,
}

impl Permutation {
    /// Identity permutation on `n` elements
    pub fn identity(n: usize) -> Self {
        Permutation {
            indices: (0..n).collect(),
        }
    }

    /// Build from an index sequence, rejecting anything that is not a bijection
    pub fn from_indices(indices: Vec<usize>) -> Result<Self> {
        let perm = Permutation { indices };
        if perm.is_bijection() {
            Ok(perm)
        } else {
            Err(CanonError::InvalidInput(format!(
                "{:?} is not a permutation of 0..{}",
                perm.indices,
                perm.len()
            )))
        }
    }

    /// Ascending argsort. Ties keep their original relative order.
    pub fn argsort(scores: ArrayView1<f32>) -> Self {
        let mut indices: Vec<usize> = (0..scores.len()).collect();
        indices.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
        Permutation { indices }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True for the empty permutation
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Index sequence
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Inverse permutation. Its indices are the integer ranks of the elements.
    pub fn inverse(&self) -> Self {
        let mut inverse = vec![0; self.len()];
        for (slot, &element) in self.indices.iter().enumerate() {
            inverse[element] = slot;
        }
        Permutation { indices: inverse }
    }

    /// Every index in `0..n` appears exactly once
    pub fn is_bijection(&self) -> bool {
        let mut seen = vec![false; self.len()];
        for &i in &self.indices {
            if i >= seen.len() || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        true
    }

    /// `out[r] = rows[indices[r]]`
    pub fn gather(&self, rows: ArrayView2<f32>) -> Array2<f32> {
        rows.select(Axis(0), &self.indices)
    }

    /// `out[indices[r]] = rows[r]`, the inverse of [`gather`](Self::gather)
    pub fn scatter(&self, rows: ArrayView2<f32>) -> Array2<f32> {
        let mut out = Array2::zeros(rows.raw_dim());
        for (slot, &element) in self.indices.iter().enumerate() {
            out.row_mut(element).assign(&rows.row(slot));
        }
        out
    }
}

/// Ascending argsort of every row of a `[B, N]` score matrix
pub fn argsort_rows(score: &Array2<f32>) -> Vec<Permutation> {
    score.outer_iter().map(Permutation::argsort).collect()
}
