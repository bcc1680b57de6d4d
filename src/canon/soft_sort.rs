//! Soft permutation engine: sort a batched set by score and undo the sort.
//!
//! The forward value is an exact argsort gather. The gradient surrogate
//! places every element between the two sorted slots bracketing its soft
//! rank, so scores receive gradients even though the sort itself is
//! discrete. Slot `N - 1` blends with slot `0`: the set is treated as
//! circular for interpolation. Ranks are clamped to `[0, N - 1]`, so the
//! wrapped partner never carries weight in the value, but the gradient of an
//! element at the top rank with respect to its fraction points at slot `0`.

use super::dual::StraightThrough;
use super::numeric::{check_shape, ensure_finite};
use super::permutation::Permutation;
use super::soft_rank::{soft_rank_rows, SoftRankRow};
use crate::core::SoftSortConfig;
use crate::{CanonError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use tracing::debug;

/// Gradients of a transform w.r.t. its set input and its score
#[derive(Clone, Debug)]
pub struct SetGradients {
    /// Gradient w.r.t. the `[B, N, D]` set
    pub input: Array3<f32>,
    /// Gradient w.r.t. the `[B, N]` score
    pub score: Array2<f32>,
}

/// Interpolation of one element between two neighbouring sorted slots
#[derive(Clone, Copy, Debug, PartialEq)]
struct Blend {
    left: usize,
    right: usize,
    frac: f32,
}

impl Blend {
    fn from_rank(rank: f32, n: usize) -> Self {
        let rank = rank.clamp(0.0, (n - 1) as f32);
        let left = rank.floor() as usize;
        Blend {
            left,
            right: (left + 1) % n,
            frac: rank - left as f32,
        }
    }
}

/// Everything one batch row needs: hard order and soft blends
struct RowPlan {
    permutation: Permutation,
    blends: Vec<Blend>,
    ranks: SoftRankRow,
}

/// Straight-through soft sorting of batched sets
#[derive(Clone, Debug, PartialEq)]
pub struct SoftPermutation {
    regularization_strength: f32,
}

impl SoftPermutation {
    /// Create an engine with the given soft-rank regularization strength
    pub fn new(regularization_strength: f32) -> Result<Self> {
        if !(regularization_strength > 0.0 && regularization_strength.is_finite()) {
            return Err(CanonError::InvalidConfig(format!(
                "regularization strength must be positive and finite, got {regularization_strength}"
            )));
        }
        Ok(SoftPermutation {
            regularization_strength,
        })
    }

    /// Create an engine from its configuration section
    pub fn from_config(config: &SoftSortConfig) -> Result<Self> {
        Self::new(config.regularization_strength)
    }

    /// Soft-rank regularization strength
    pub fn regularization_strength(&self) -> f32 {
        self.regularization_strength
    }

    /// Hard ascending permutation of every row
    pub fn permutations(&self, score: &Array2<f32>) -> Result<Vec<Permutation>> {
        ensure_finite(score, "soft sort score")?;
        Ok(score.outer_iter().map(Permutation::argsort).collect())
    }

    /// 0-based soft ranks of every row
    pub fn soft_ranks(&self, score: &Array2<f32>) -> Result<Array2<f32>> {
        super::soft_rank::soft_rank(score, self.regularization_strength)
    }

    /// Sort every set in `x` by ascending score.
    ///
    /// The primary value is the exact sorted set; the surrogate is the
    /// soft-rank blend that carries gradients to `score`.
    pub fn forward_transform(
        &self,
        x: &Array3<f32>,
        score: &Array2<f32>,
    ) -> Result<StraightThrough<Array3<f32>>> {
        let plans = self.plan(x, score)?;
        debug!(shape = ?x.shape(), "soft sort forward");

        let mut primary = Array3::zeros(x.raw_dim());
        let mut surrogate = Array3::zeros(x.raw_dim());
        primary
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(surrogate.axis_iter_mut(Axis(0)))
            .zip(x.axis_iter(Axis(0)))
            .zip(plans.par_iter())
            .for_each(|(((mut p, s), xb), plan)| {
                p.assign(&plan.permutation.gather(xb));
                scatter_blend(xb, &plan.blends, s);
            });

        ensure_finite(&surrogate, "soft sort forward")?;
        Ok(StraightThrough::new(primary, surrogate))
    }

    /// Undo [`forward_transform`](Self::forward_transform) for sets living in
    /// sorted order.
    pub fn inverse_transform(
        &self,
        y: &Array3<f32>,
        score: &Array2<f32>,
    ) -> Result<StraightThrough<Array3<f32>>> {
        let plans = self.plan(y, score)?;
        debug!(shape = ?y.shape(), "soft sort inverse");

        let mut primary = Array3::zeros(y.raw_dim());
        let mut surrogate = Array3::zeros(y.raw_dim());
        primary
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(surrogate.axis_iter_mut(Axis(0)))
            .zip(y.axis_iter(Axis(0)))
            .zip(plans.par_iter())
            .for_each(|(((mut p, s), yb), plan)| {
                p.assign(&plan.permutation.scatter(yb));
                gather_blend(yb, &plan.blends, s);
            });

        ensure_finite(&surrogate, "soft sort inverse")?;
        Ok(StraightThrough::new(primary, surrogate))
    }

    /// Backward pass of [`forward_transform`](Self::forward_transform) through
    /// its surrogate, given the gradient w.r.t. its output.
    pub fn forward_backward(
        &self,
        x: &Array3<f32>,
        score: &Array2<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        check_shape("soft sort backward", grad_out.shape(), x.shape())?;
        let plans = self.plan(x, score)?;

        let mut input = Array3::zeros(x.raw_dim());
        let mut grad_score = Array2::zeros(score.raw_dim());
        for (b, plan) in plans.iter().enumerate() {
            let xb = x.index_axis(Axis(0), b);
            let gb = grad_out.index_axis(Axis(0), b);
            let mut gx = input.index_axis_mut(Axis(0), b);
            let mut grad_rank = Array1::zeros(plan.blends.len());

            for (i, blend) in plan.blends.iter().enumerate() {
                let left = gb.row(blend.left);
                let right = gb.row(blend.right);
                gx.row_mut(i)
                    .assign(&(&left * (1.0 - blend.frac) + &right * blend.frac));
                grad_rank[i] = (&right - &left).dot(&xb.row(i));
            }
            grad_score
                .row_mut(b)
                .assign(&plan.ranks.vjp(grad_rank.view())?);
        }

        ensure_finite(&grad_score, "soft sort backward")?;
        Ok(SetGradients {
            input,
            score: grad_score,
        })
    }

    /// Backward pass of [`inverse_transform`](Self::inverse_transform) through
    /// its surrogate, given the gradient w.r.t. its output.
    pub fn inverse_backward(
        &self,
        y: &Array3<f32>,
        score: &Array2<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        check_shape("soft unsort backward", grad_out.shape(), y.shape())?;
        let plans = self.plan(y, score)?;

        let mut input = Array3::zeros(y.raw_dim());
        let mut grad_score = Array2::zeros(score.raw_dim());
        for (b, plan) in plans.iter().enumerate() {
            let yb = y.index_axis(Axis(0), b);
            let gb = grad_out.index_axis(Axis(0), b);
            let gy = input.index_axis_mut(Axis(0), b);
            scatter_blend(gb, &plan.blends, gy);

            let grad_rank = Array1::from_iter(plan.blends.iter().enumerate().map(|(i, blend)| {
                gb.row(i)
                    .dot(&(&yb.row(blend.right) - &yb.row(blend.left)))
            }));
            grad_score
                .row_mut(b)
                .assign(&plan.ranks.vjp(grad_rank.view())?);
        }

        ensure_finite(&grad_score, "soft unsort backward")?;
        Ok(SetGradients {
            input,
            score: grad_score,
        })
    }

    fn plan(&self, x: &Array3<f32>, score: &Array2<f32>) -> Result<Vec<RowPlan>> {
        let (batch, n) = (x.len_of(Axis(0)), x.len_of(Axis(1)));
        check_shape("soft sort score", score.shape(), &[batch, n])?;
        if n < 2 {
            return Err(CanonError::InvalidInput(format!(
                "soft sorting needs at least 2 set elements, got {n}"
            )));
        }
        ensure_finite(x, "soft sort input")?;

        let rows = soft_rank_rows(score, self.regularization_strength)?;
        Ok(score
            .outer_iter()
            .zip(rows)
            .map(|(row, ranks)| RowPlan {
                permutation: Permutation::argsort(row),
                blends: blends(ranks.values().view(), n),
                ranks,
            })
            .collect())
    }
}

fn blends(ranks: ArrayView1<f32>, n: usize) -> Vec<Blend> {
    ranks.iter().map(|&r| Blend::from_rank(r, n)).collect()
}

/// `out[left_i] += (1 - frac_i) x_i`, `out[right_i] += frac_i x_i`
fn scatter_blend(x: ArrayView2<f32>, blends: &[Blend], mut out: ArrayViewMut2<f32>) {
    for (i, blend) in blends.iter().enumerate() {
        out.row_mut(blend.left)
            .scaled_add(1.0 - blend.frac, &x.row(i));
        out.row_mut(blend.right).scaled_add(blend.frac, &x.row(i));
    }
}

/// `out[i] = (1 - frac_i) y[left_i] + frac_i y[right_i]`
fn gather_blend(y: ArrayView2<f32>, blends: &[Blend], mut out: ArrayViewMut2<f32>) {
    for (i, blend) in blends.iter().enumerate() {
        let mut row = out.row_mut(i);
        row.scaled_add(1.0 - blend.frac, &y.row(blend.left));
        row.scaled_add(blend.frac, &y.row(blend.right));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn concrete_set() -> (Array3<f32>, Array2<f32>) {
        let x = array![[[0.9f32, 9.0], [0.1, 1.0], [0.5, 5.0], [0.3, 3.0]]];
        let score = array![[0.9f32, 0.1, 0.5, 0.3]];
        (x, score)
    }

    #[test]
    fn test_concrete_scenario_round_trip() {
        let (x, score) = concrete_set();
        let engine = SoftPermutation::new(1.0).unwrap();

        let sorted = engine.forward_transform(&x, &score).unwrap();
        assert_eq!(
            sorted.primary(),
            &array![[[0.1f32, 1.0], [0.3, 3.0], [0.5, 5.0], [0.9, 9.0]]]
        );

        let restored = engine
            .inverse_transform(sorted.primary(), &score)
            .unwrap();
        assert_eq!(restored.primary(), &x);
    }

    #[test]
    fn test_hard_and_soft_ranks() {
        let (_, score) = concrete_set();
        let engine = SoftPermutation::new(1e-3).unwrap();
        assert_eq!(engine.regularization_strength(), 1e-3);

        let perms = engine.permutations(&score).unwrap();
        assert_eq!(perms[0].indices(), &[1, 3, 2, 0]);
        assert_eq!(perms, crate::canon::argsort_rows(&score));
        assert_eq!(
            engine.soft_ranks(&score).unwrap(),
            array![[3.0f32, 0.0, 2.0, 1.0]]
        );
        assert!(engine.permutations(&array![[0.0f32, f32::NAN]]).is_err());
    }

    #[test]
    fn test_surrogate_matches_hard_path_at_small_strength() {
        let (x, score) = concrete_set();
        let engine = SoftPermutation::new(1e-3).unwrap();

        let sorted = engine.forward_transform(&x, &score).unwrap();
        assert!(sorted.surrogate_gap() < 1e-5);

        let restored = engine
            .inverse_transform(sorted.primary(), &score)
            .unwrap();
        assert!(restored.surrogate_gap() < 1e-5);
    }

    #[test]
    fn test_surrogate_gap_shrinks_with_strength() {
        let (x, score) = concrete_set();
        let gaps: Vec<f32> = [1.0, 0.1, 0.01, 0.001]
            .iter()
            .map(|&s| {
                SoftPermutation::new(s)
                    .unwrap()
                    .forward_transform(&x, &score)
                    .unwrap()
                    .surrogate_gap()
            })
            .collect();
        assert!(gaps[0] > 0.0);
        for pair in gaps.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-6, "gaps not shrinking: {gaps:?}");
        }
        assert!(gaps[3] < 1e-5);
    }

    #[test]
    fn test_wrap_around_at_top_rank() {
        let blend = Blend::from_rank(3.25, 4);
        assert_eq!(blend.left, 3);
        assert_eq!(blend.right, 0);
        assert!((blend.frac - 0.25).abs() < 1e-6);

        let clamped = Blend::from_rank(3.0 + 1e-3, 4);
        assert_eq!(clamped.left, 3);
        assert!((clamped.frac - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let engine = SoftPermutation::new(1.0).unwrap();
        let x = Array3::<f32>::zeros((2, 4, 3));
        assert!(matches!(
            engine.forward_transform(&x, &Array2::zeros((2, 3))),
            Err(CanonError::ShapeMismatch { .. })
        ));

        let single = Array3::<f32>::zeros((2, 1, 3));
        assert!(matches!(
            engine.forward_transform(&single, &Array2::zeros((2, 1))),
            Err(CanonError::InvalidInput(_))
        ));
        assert!(SoftPermutation::new(-1.0).is_err());
    }

    fn surrogate_loss(
        engine: &SoftPermutation,
        x: &Array3<f32>,
        score: &Array2<f32>,
        weights: &Array3<f32>,
        inverse: bool,
    ) -> f32 {
        let out = if inverse {
            engine.inverse_transform(x, score).unwrap()
        } else {
            engine.forward_transform(x, score).unwrap()
        };
        (out.surrogate() * weights).sum()
    }

    fn check_gradients(inverse: bool) {
        let engine = SoftPermutation::new(1.0).unwrap();
        let x = array![[[1.0f32, -2.0], [0.5, 3.0], [-1.5, 0.25]]];
        // Soft ranks 1.13, 0.98, 0.88: all away from integer boundaries
        let score = array![[0.35f32, 0.1, 0.2]];
        let weights = array![[[0.3f32, -0.7], [1.1, 0.2], [-0.4, 0.9]]];

        let grads = if inverse {
            engine.inverse_backward(&x, &score, &weights).unwrap()
        } else {
            engine.forward_backward(&x, &score, &weights).unwrap()
        };

        let h = 1e-3f32;
        for i in 0..3 {
            let mut plus = score.clone();
            plus[(0, i)] += h;
            let mut minus = score.clone();
            minus[(0, i)] -= h;
            let numeric = (surrogate_loss(&engine, &x, &plus, &weights, inverse)
                - surrogate_loss(&engine, &x, &minus, &weights, inverse))
                / (2.0 * h);
            assert!(
                (numeric - grads.score[(0, i)]).abs() < 2e-2,
                "score[{i}]: numeric {numeric}, analytic {}",
                grads.score[(0, i)]
            );
        }

        for i in 0..3 {
            for d in 0..2 {
                let mut plus = x.clone();
                plus[(0, i, d)] += h;
                let mut minus = x.clone();
                minus[(0, i, d)] -= h;
                let numeric = (surrogate_loss(&engine, &plus, &score, &weights, inverse)
                    - surrogate_loss(&engine, &minus, &score, &weights, inverse))
                    / (2.0 * h);
                assert!(
                    (numeric - grads.input[(0, i, d)]).abs() < 2e-2,
                    "x[{i},{d}]: numeric {numeric}, analytic {}",
                    grads.input[(0, i, d)]
                );
            }
        }
    }

    #[test]
    fn test_forward_backward_matches_finite_differences() {
        check_gradients(false);
    }

    #[test]
    fn test_inverse_backward_matches_finite_differences() {
        check_gradients(true);
    }
}
