//! Small reference networks.
//!
//! These are stand-ins for the learned canonicalization and task networks:
//! forward-only, randomly initialized, with the symmetry each wrapper relies
//! on built into their structure.

use super::{FrameNetwork, ParticleBatch, PositionPredictor, ScoreNetwork, SetNetwork};
use crate::{CanonError, Result};
use ndarray::{s, Array1, Array2, Array3, Array5, Axis};
use rand::Rng;

fn init_weights<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let bound = 1.0 / (cols as f32).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(-bound..bound))
}

/// Permutation-equivariant scorer in the DeepSets style.
///
/// Each element is summarized by its per-channel mean; the set context is the
/// mean of those summaries. `score_i = w · tanh(W_e m_i + W_c c + b)`.
#[derive(Clone, Debug)]
pub struct DeepSetsScorer {
    element: Array2<f32>,
    context: Array2<f32>,
    bias: Array1<f32>,
    readout: Array1<f32>,
}

impl DeepSetsScorer {
    /// Random scorer for `channels`-channel images
    pub fn new<R: Rng + ?Sized>(channels: usize, hidden: usize, rng: &mut R) -> Result<Self> {
        if channels == 0 || hidden == 0 {
            return Err(CanonError::InvalidConfig(format!(
                "scorer needs positive widths, got channels={channels} hidden={hidden}"
            )));
        }
        Ok(DeepSetsScorer {
            element: init_weights(hidden, channels, rng),
            context: init_weights(hidden, channels, rng),
            bias: Array1::zeros(hidden),
            readout: init_weights(1, hidden, rng).row(0).to_owned(),
        })
    }

    fn channels(&self) -> usize {
        self.element.ncols()
    }
}

impl ScoreNetwork for DeepSetsScorer {
    fn score(&self, x: &Array5<f32>) -> Result<Array2<f32>> {
        let (batch, n, channels) = (x.len_of(Axis(0)), x.len_of(Axis(1)), x.len_of(Axis(2)));
        if channels != self.channels() {
            return Err(CanonError::ShapeMismatch {
                context: "deep sets scorer",
                expected: vec![batch, n, self.channels(), 0, 0],
                got: x.shape().to_vec(),
            });
        }
        let pixels = (x.len_of(Axis(3)) * x.len_of(Axis(4))).max(1) as f32;

        let mut score = Array2::zeros((batch, n));
        for (set, mut row) in x.outer_iter().zip(score.outer_iter_mut()) {
            // [N, C] channel means
            let means = set.sum_axis(Axis(3)).sum_axis(Axis(2)) / pixels;
            let context = means.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(channels));
            let shared = self.context.dot(&context) + &self.bias;

            for (m, s) in means.outer_iter().zip(row.iter_mut()) {
                let hidden = (self.element.dot(&m) + &shared).mapv(f32::tanh);
                *s = self.readout.dot(&hidden);
            }
        }
        Ok(score)
    }
}

/// Task network that returns its input
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentitySetNetwork;

impl SetNetwork for IdentitySetNetwork {
    fn forward(&self, x: &Array5<f32>) -> Result<Array5<f32>> {
        Ok(x.clone())
    }
}

/// Rotation- and translation-equivariant frame network.
///
/// Translation is the particle centroid. Each particle gets invariant
/// features `[charge, |r|², |v|², r·v, 1]` (r relative to the centroid), a
/// hidden layer maps them to weights `a_k, b_k`, and frame vector
/// `k = mean_i(a_ik r_i + b_ik v_i)`.
#[derive(Clone, Debug)]
pub struct EquivariantFrameNet {
    hidden: Array2<f32>,
    readout: Array2<f32>,
}

impl EquivariantFrameNet {
    const FEATURES: usize = 5;

    /// Random network with `hidden` units
    pub fn new<R: Rng + ?Sized>(hidden: usize, rng: &mut R) -> Result<Self> {
        if hidden == 0 {
            return Err(CanonError::InvalidConfig(
                "frame network needs a positive hidden width".to_string(),
            ));
        }
        Ok(EquivariantFrameNet {
            hidden: init_weights(hidden, Self::FEATURES, rng),
            readout: init_weights(6, hidden, rng),
        })
    }
}

impl FrameNetwork for EquivariantFrameNet {
    fn frame_vectors(&self, batch: &ParticleBatch) -> Result<(Array3<f32>, Array2<f32>)> {
        let (b, n) = (batch.batch_size(), batch.particles());
        let mut vectors = Array3::zeros((b, 3, 3));
        let mut translation = Array2::zeros((b, 3));

        for sample in 0..b {
            let loc = batch.loc().index_axis(Axis(0), sample);
            let vel = batch.vel().index_axis(Axis(0), sample);
            let centroid = loc
                .mean_axis(Axis(0))
                .ok_or_else(|| CanonError::InvalidInput("empty particle set".to_string()))?;
            let rel = &loc - &centroid.view().insert_axis(Axis(0));

            let mut v = Array2::<f32>::zeros((3, 3));
            for i in 0..n {
                let (r, u) = (rel.row(i), vel.row(i));
                let features = ndarray::arr1(&[
                    batch.charges()[(sample, i)],
                    r.dot(&r),
                    u.dot(&u),
                    r.dot(&u),
                    1.0,
                ]);
                let weights = self.readout.dot(&self.hidden.dot(&features).mapv(f32::tanh));
                for k in 0..3 {
                    v.row_mut(k).scaled_add(weights[k], &r);
                    v.row_mut(k).scaled_add(weights[k + 3], &u);
                }
            }

            vectors
                .slice_mut(s![sample, .., ..])
                .assign(&(v / n as f32));
            translation.row_mut(sample).assign(&centroid);
        }
        Ok((vectors, translation))
    }
}

/// Predicts `loc + dt · vel`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantVelocity {
    /// Time step
    pub dt: f32,
}

impl PositionPredictor for ConstantVelocity {
    fn predict(&self, batch: &ParticleBatch) -> Result<Array3<f32>> {
        Ok(batch.loc() + &(batch.vel() * self.dt))
    }
}
