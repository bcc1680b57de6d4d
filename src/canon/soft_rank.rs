//! Differentiable ranking.
//!
//! Soft ranks are the Euclidean projection of `score / strength` onto the
//! permutahedron spanned by `(1, ..., n)`, computed through a decreasing
//! isotonic regression solved with pool-adjacent-violators. Small strengths
//! reproduce integer ranks exactly; large strengths pull every rank towards
//! the mean rank `(n + 1) / 2`.
//!
//! Ranks returned here are 0-based and ascending: the smallest score gets
//! rank 0.

use crate::canon::numeric::{check_shape, ensure_finite};
use crate::{CanonError, Result};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::ops::Range;

/// Soft ranks of one row plus the pooling structure its backward pass needs
#[derive(Clone, Debug)]
pub struct SoftRankRow {
    values: Array1<f32>,
    /// Element indices in descending score order
    order: Vec<usize>,
    /// Pooled blocks, as ranges over positions in `order`
    blocks: Vec<Range<usize>>,
    strength: f32,
}

impl SoftRankRow {
    /// Rank the scores of one row
    pub fn new(scores: ArrayView1<f32>, strength: f32) -> Self {
        let n = scores.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let strength64 = f64::from(strength);
        let sorted: Vec<f64> = order
            .iter()
            .map(|&i| f64::from(scores[i]) / strength64)
            .collect();
        // Target vertex (n, n-1, ..., 1) in descending order
        let target: Vec<f64> = sorted
            .iter()
            .enumerate()
            .map(|(k, s)| s - (n - k) as f64)
            .collect();
        let (fit, blocks) = isotonic_decreasing(&target);

        let mut values = Array1::zeros(n);
        for (k, &element) in order.iter().enumerate() {
            values[element] = (sorted[k] - fit[k] - 1.0) as f32;
        }

        SoftRankRow {
            values,
            order,
            blocks,
            strength,
        }
    }

    /// 0-based soft ranks, indexed like the input scores
    pub fn values(&self) -> &Array1<f32> {
        &self.values
    }

    /// Vector-Jacobian product: gradient w.r.t. the scores given the
    /// gradient w.r.t. the ranks.
    pub fn vjp(&self, grad_rank: ArrayView1<f32>) -> Result<Array1<f32>> {
        check_shape("soft rank backward", grad_rank.shape(), self.values.shape())?;
        let mut grad_score = Array1::zeros(self.values.len());
        for block in &self.blocks {
            let members = &self.order[block.clone()];
            let mean = members.iter().map(|&i| grad_rank[i]).sum::<f32>() / members.len() as f32;
            for &i in members {
                grad_score[i] = (grad_rank[i] - mean) / self.strength;
            }
        }
        Ok(grad_score)
    }
}

/// Decreasing isotonic regression `argmin_{v_1 >= ... >= v_n} |v - y|^2`.
///
/// Returns the fitted values and the pooled blocks.
fn isotonic_decreasing(y: &[f64]) -> (Vec<f64>, Vec<Range<usize>>) {
    // (sum, start, len)
    let mut blocks: Vec<(f64, usize, usize)> = Vec::with_capacity(y.len());
    for (i, &v) in y.iter().enumerate() {
        blocks.push((v, i, 1));
        while blocks.len() > 1 {
            let (sum, start, len) = blocks[blocks.len() - 1];
            let (prev_sum, prev_start, prev_len) = blocks[blocks.len() - 2];
            if prev_sum / prev_len as f64 > sum / len as f64 {
                break;
            }
            blocks.pop();
            let merged = blocks.len() - 1;
            blocks[merged] = (prev_sum + sum, prev_start.min(start), prev_len + len);
        }
    }

    let mut fit = vec![0.0; y.len()];
    let mut ranges = Vec::with_capacity(blocks.len());
    for (sum, start, len) in blocks {
        let mean = sum / len as f64;
        fit[start..start + len].iter_mut().for_each(|v| *v = mean);
        ranges.push(start..start + len);
    }
    (fit, ranges)
}

/// Soft-rank every row of a `[B, N]` score matrix, rows in parallel
pub fn soft_rank_rows(score: &Array2<f32>, strength: f32) -> Result<Vec<SoftRankRow>> {
    if !(strength > 0.0 && strength.is_finite()) {
        return Err(CanonError::InvalidConfig(format!(
            "regularization strength must be positive and finite, got {strength}"
        )));
    }
    ensure_finite(score, "soft_rank input")?;
    Ok(score
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| SoftRankRow::new(row, strength))
        .collect())
}

/// 0-based soft ranks of a `[B, N]` score matrix
pub fn soft_rank(score: &Array2<f32>, strength: f32) -> Result<Array2<f32>> {
    let rows = soft_rank_rows(score, strength)?;
    let mut ranks = Array2::zeros(score.raw_dim());
    for (mut out, row) in ranks.outer_iter_mut().zip(&rows) {
        out.assign(row.values());
    }
    ensure_finite(&ranks, "soft_rank")?;
    Ok(ranks)
}
