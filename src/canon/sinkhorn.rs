//! Sinkhorn normalization and Gumbel-Sinkhorn soft permutations.
//!
//! All normalization happens in log space. The result is only approximately
//! doubly stochastic: the marginal error shrinks with every iteration but is
//! never zero after finitely many.

use super::dual::StraightThrough;
use super::numeric::{check_shape, ensure_finite, log_sum_exp};
use super::permutation::Permutation;
use super::soft_sort::SetGradients;
use crate::core::SinkhornConfig;
use crate::{CanonError, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use rand::{Rng, RngCore};
use tracing::{debug, warn};

/// Sinkhorn-normalize a batch of `[N, N]` log-affinities.
///
/// Divides by `temperature`, then alternates row and column log-normalization
/// `n_iter` times and exponentiates.
pub fn sinkhorn(log_alpha: &Array3<f32>, n_iter: usize, temperature: f32) -> Result<Array3<f32>> {
    validate(log_alpha, temperature)?;

    let mut out = Array3::zeros(log_alpha.raw_dim());
    Zip::from(out.outer_iter_mut())
        .and(log_alpha.outer_iter())
        .par_for_each(|mut o, a| {
            let steps = normalize(a, n_iter, temperature);
            o.assign(&steps.last().map_or_else(|| &a / temperature, |s| s.clone()).mapv(f32::exp));
        });

    ensure_finite(&out, "sinkhorn")?;
    Ok(out)
}

/// Gumbel-Sinkhorn: optionally perturb `log_alpha` with i.i.d. Gumbel noise,
/// scale by `1 / tau` and Sinkhorn-normalize.
///
/// With `noise == false` the random source is never touched and the result
/// is a pure function of the input.
pub fn gumbel_sinkhorn<R: Rng + ?Sized>(
    log_alpha: &Array3<f32>,
    tau: f32,
    n_iter: usize,
    noise: bool,
    rng: &mut R,
) -> Result<Array3<f32>> {
    if noise {
        let perturbed = log_alpha + &sample_gumbel(log_alpha.raw_dim(), DEFAULT_NOISE_EPS, rng);
        sinkhorn(&perturbed, n_iter, tau)
    } else {
        sinkhorn(log_alpha, n_iter, tau)
    }
}

/// Stabilizer inside the Gumbel double logarithm
pub const DEFAULT_NOISE_EPS: f32 = 1e-20;

/// Standard Gumbel samples `-ln(-ln(U + eps) + eps)` with `U ~ Uniform(0, 1)`
pub fn sample_gumbel<R: Rng + ?Sized>(shape: ndarray::Ix3, eps: f32, rng: &mut R) -> Array3<f32> {
    Array3::from_shape_simple_fn(shape, || {
        let u: f32 = rng.gen();
        -(-(u + eps).ln() + eps).ln()
    })
}

/// Vector-Jacobian product of [`sinkhorn`] w.r.t. `log_alpha`.
///
/// Replays the normalization steps and differentiates through each
/// log-softmax in reverse.
pub fn sinkhorn_backward(
    log_alpha: &Array3<f32>,
    n_iter: usize,
    temperature: f32,
    grad_out: &Array3<f32>,
) -> Result<Array3<f32>> {
    validate(log_alpha, temperature)?;
    check_shape("sinkhorn backward", grad_out.shape(), log_alpha.shape())?;

    let mut grad = Array3::zeros(log_alpha.raw_dim());
    Zip::from(grad.outer_iter_mut())
        .and(log_alpha.outer_iter())
        .and(grad_out.outer_iter())
        .par_for_each(|mut g_in, a, g_out| {
            let steps = normalize(a, n_iter, temperature);
            let last = steps
                .last()
                .map_or_else(|| &a / temperature, |s| s.clone());
            let mut g = &g_out * &last.mapv(f32::exp);

            // Step k normalized rows when k is even, columns when odd
            for (k, step) in steps.iter().enumerate().rev() {
                let axis = if k % 2 == 0 { Axis(1) } else { Axis(0) };
                let sums = g.sum_axis(axis).insert_axis(axis);
                g = &g - &(step.mapv(f32::exp) * &sums);
            }
            g_in.assign(&(g / temperature));
        });

    ensure_finite(&grad, "sinkhorn backward")?;
    Ok(grad)
}

/// Sum of absolute deviations of every row and column sum from 1
pub fn marginal_error(p: &Array3<f32>) -> f32 {
    let rows = p.sum_axis(Axis(2)).mapv(|s| (s - 1.0).abs()).sum();
    let cols = p.sum_axis(Axis(1)).mapv(|s| (s - 1.0).abs()).sum();
    rows + cols
}

/// Move a set into the order described by a soft permutation: `x' = Pᵗ x`
pub fn transport_forward(p: &Array3<f32>, x: &Array3<f32>) -> Result<Array3<f32>> {
    contract(p, x, true)
}

/// Move a set back out of the order described by a soft permutation: `x = P x'`
pub fn transport_inverse(p: &Array3<f32>, x: &Array3<f32>) -> Result<Array3<f32>> {
    contract(p, x, false)
}

/// Gradients of a transport contraction
#[derive(Clone, Debug)]
pub struct TransportGradients {
    /// Gradient w.r.t. the `[B, N, N]` soft permutation
    pub plan: Array3<f32>,
    /// Gradient w.r.t. the `[B, N, D]` set
    pub input: Array3<f32>,
}

/// Vector-Jacobian product of [`transport_forward`]
pub fn transport_forward_backward(
    p: &Array3<f32>,
    x: &Array3<f32>,
    grad_out: &Array3<f32>,
) -> Result<TransportGradients> {
    contract_backward(p, x, grad_out, true)
}

/// Vector-Jacobian product of [`transport_inverse`]
pub fn transport_inverse_backward(
    p: &Array3<f32>,
    x: &Array3<f32>,
    grad_out: &Array3<f32>,
) -> Result<TransportGradients> {
    contract_backward(p, x, grad_out, false)
}

/// Log-affinity between each element and each sorted slot:
/// `-(score_i - sorted_r)^2`. At low temperature Sinkhorn turns this into
/// the hard sorting permutation with `P[i, rank_i] = 1`.
pub fn affinity_from_scores(score: &Array2<f32>) -> Array3<f32> {
    let (batch, n) = score.dim();
    let mut affinity = Array3::zeros((batch, n, n));
    for (mut out, row) in affinity.outer_iter_mut().zip(score.outer_iter()) {
        let mut sorted = row.to_vec();
        sorted.sort_by(f32::total_cmp);
        for ((i, r), a) in out.indexed_iter_mut() {
            let d = row[i] - sorted[r];
            *a = -d * d;
        }
    }
    affinity
}

/// Vector-Jacobian product of [`affinity_from_scores`].
///
/// Each entry depends on `score_i` and on the score sorted into slot `r`;
/// the sort itself is piecewise constant and contributes nothing.
pub fn affinity_from_scores_backward(
    score: &Array2<f32>,
    grad_affinity: &Array3<f32>,
) -> Result<Array2<f32>> {
    let (batch, n) = score.dim();
    check_shape("affinity backward", grad_affinity.shape(), &[batch, n, n])?;

    let mut grad = Array2::zeros((batch, n));
    for ((mut out, row), g) in grad
        .outer_iter_mut()
        .zip(score.outer_iter())
        .zip(grad_affinity.outer_iter())
    {
        let order = Permutation::argsort(row);
        for ((i, r), &g_ir) in g.indexed_iter() {
            let slot = order.indices()[r];
            let d = 2.0 * g_ir * (row[i] - row[slot]);
            out[i] -= d;
            out[slot] += d;
        }
    }
    ensure_finite(&grad, "affinity backward")?;
    Ok(grad)
}

/// Soft permutation built from scores, with what its backward pass needs
#[derive(Clone, Debug, PartialEq)]
pub struct TransportPlan {
    score: Array2<f32>,
    log_alpha: Array3<f32>,
    matrix: Array3<f32>,
}

impl TransportPlan {
    /// `[B, N]` scores the plan was built from
    pub fn score(&self) -> &Array2<f32> {
        &self.score
    }

    /// Log-affinities that were normalized, Gumbel noise included
    pub fn log_alpha(&self) -> &Array3<f32> {
        &self.log_alpha
    }

    /// `[B, N, N]` soft permutation
    pub fn matrix(&self) -> &Array3<f32> {
        &self.matrix
    }
}

/// Configured Gumbel-Sinkhorn engine
#[derive(Clone, Debug, PartialEq)]
pub struct SinkhornEngine {
    config: SinkhornConfig,
}

impl SinkhornEngine {
    /// Create an engine from a validated configuration section
    pub fn new(config: SinkhornConfig) -> Result<Self> {
        config.validate()?;
        Ok(SinkhornEngine { config })
    }

    /// Engine configuration
    pub fn config(&self) -> &SinkhornConfig {
        &self.config
    }

    /// Soft permutation for `log_alpha`. Noise is drawn only when the
    /// configuration enables it and a random source is supplied.
    pub fn soft_permutation(
        &self,
        log_alpha: &Array3<f32>,
        rng: Option<&mut dyn RngCore>,
    ) -> Result<Array3<f32>> {
        self.normalize_logged(&self.perturb(log_alpha, rng))
    }

    /// Soft permutation of the score affinities, kept together with the
    /// inputs [`forward_backward`](Self::forward_backward) needs
    pub fn transport_plan(
        &self,
        score: &Array2<f32>,
        rng: Option<&mut dyn RngCore>,
    ) -> Result<TransportPlan> {
        ensure_finite(score, "transport score")?;
        let log_alpha = self.perturb(&affinity_from_scores(score), rng);
        let matrix = self.normalize_logged(&log_alpha)?;
        Ok(TransportPlan {
            score: score.clone(),
            log_alpha,
            matrix,
        })
    }

    /// Sort `x` with the soft permutation of its scores; `Pᵗ` forward
    pub fn forward_transform(
        &self,
        x: &Array3<f32>,
        p: &Array3<f32>,
    ) -> Result<StraightThrough<Array3<f32>>> {
        transport_forward(p, x).map(StraightThrough::exact)
    }

    /// Undo [`forward_transform`](Self::forward_transform) with `P`
    pub fn inverse_transform(
        &self,
        y: &Array3<f32>,
        p: &Array3<f32>,
    ) -> Result<StraightThrough<Array3<f32>>> {
        transport_inverse(p, y).map(StraightThrough::exact)
    }

    /// Gradients of `Pᵗx` w.r.t. the set and, through Sinkhorn and the
    /// affinities, the scores of `plan`
    pub fn forward_backward(
        &self,
        x: &Array3<f32>,
        plan: &TransportPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        let grads = transport_forward_backward(&plan.matrix, x, grad_out)?;
        Ok(SetGradients {
            score: self.plan_backward(plan, &grads.plan)?,
            input: grads.input,
        })
    }

    /// Gradients of `P y` w.r.t. the set and the scores of `plan`
    pub fn inverse_backward(
        &self,
        y: &Array3<f32>,
        plan: &TransportPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        let grads = transport_inverse_backward(&plan.matrix, y, grad_out)?;
        Ok(SetGradients {
            score: self.plan_backward(plan, &grads.plan)?,
            input: grads.input,
        })
    }

    fn temperature(&self) -> f32 {
        self.config.tau * self.config.temperature
    }

    fn perturb(&self, log_alpha: &Array3<f32>, rng: Option<&mut dyn RngCore>) -> Array3<f32> {
        match rng {
            Some(rng) if self.config.noise => {
                log_alpha + &sample_gumbel(log_alpha.raw_dim(), self.config.noise_eps, rng)
            }
            _ => log_alpha.clone(),
        }
    }

    fn normalize_logged(&self, log_alpha: &Array3<f32>) -> Result<Array3<f32>> {
        let cfg = &self.config;
        let p = sinkhorn(log_alpha, cfg.n_iter, self.temperature())?;

        let error = marginal_error(&p) / p.len_of(Axis(0)).max(1) as f32;
        debug!(n_iter = cfg.n_iter, marginal_error = error, "sinkhorn");
        if error > cfg.warn_marginal_error {
            warn!(
                marginal_error = error,
                n_iter = cfg.n_iter,
                "sinkhorn output far from doubly stochastic"
            );
        }
        Ok(p)
    }

    fn plan_backward(&self, plan: &TransportPlan, grad_matrix: &Array3<f32>) -> Result<Array2<f32>> {
        let grad_affinity = sinkhorn_backward(
            &plan.log_alpha,
            self.config.n_iter,
            self.temperature(),
            grad_matrix,
        )?;
        affinity_from_scores_backward(&plan.score, &grad_affinity)
    }
}

fn validate(log_alpha: &Array3<f32>, temperature: f32) -> Result<()> {
    let (_, n, m) = log_alpha.dim();
    if n != m {
        return Err(CanonError::ShapeMismatch {
            context: "sinkhorn",
            expected: vec![0, n, n],
            got: log_alpha.shape().to_vec(),
        });
    }
    if !(temperature > 0.0 && temperature.is_finite()) {
        return Err(CanonError::InvalidConfig(format!(
            "sinkhorn temperature must be positive and finite, got {temperature}"
        )));
    }
    ensure_finite(log_alpha, "sinkhorn input")
}

/// Log-domain outputs of every normalization step, in order.
/// Even steps normalize rows, odd steps columns.
fn normalize(log_alpha: ArrayView2<f32>, n_iter: usize, temperature: f32) -> Vec<Array2<f32>> {
    let mut steps = Vec::with_capacity(2 * n_iter);
    let mut current = &log_alpha / temperature;
    for _ in 0..n_iter {
        for axis in [Axis(1), Axis(0)] {
            let lse = current.map_axis(axis, log_sum_exp).insert_axis(axis);
            current = &current - &lse;
            steps.push(current.clone());
        }
    }
    steps
}

fn contract(p: &Array3<f32>, x: &Array3<f32>, transpose: bool) -> Result<Array3<f32>> {
    let (batch, n, _) = x.dim();
    check_shape("transport plan", p.shape(), &[batch, n, n])?;

    let mut out = Array3::zeros(x.raw_dim());
    Zip::from(out.outer_iter_mut())
        .and(p.outer_iter())
        .and(x.outer_iter())
        .par_for_each(|mut o, pb, xb| {
            if transpose {
                o.assign(&pb.t().dot(&xb));
            } else {
                o.assign(&pb.dot(&xb));
            }
        });
    ensure_finite(&out, "transport")?;
    Ok(out)
}

fn contract_backward(
    p: &Array3<f32>,
    x: &Array3<f32>,
    grad_out: &Array3<f32>,
    transpose: bool,
) -> Result<TransportGradients> {
    let (batch, n, _) = x.dim();
    check_shape("transport plan", p.shape(), &[batch, n, n])?;
    check_shape("transport gradient", grad_out.shape(), x.shape())?;

    let mut grads = TransportGradients {
        plan: Array3::zeros(p.raw_dim()),
        input: Array3::zeros(x.raw_dim()),
    };
    Zip::from(grads.plan.outer_iter_mut())
        .and(grads.input.outer_iter_mut())
        .and(p.outer_iter())
        .and(x.outer_iter())
        .and(grad_out.outer_iter())
        .par_for_each(|mut gp, mut gx, pb, xb, gb| {
            if transpose {
                // out = Pᵗ x
                gx.assign(&pb.dot(&gb));
                gp.assign(&xb.dot(&gb.t()));
            } else {
                // out = P x
                gx.assign(&pb.t().dot(&gb));
                gp.assign(&gb.dot(&xb.t()));
            }
        });
    ensure_finite(&grads.plan, "transport backward")?;
    Ok(grads)
}
