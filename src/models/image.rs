//! Image-set canonicalization

use super::{ScoreNetwork, SetNetwork};
use crate::canon::{check_shape, ensure_finite, StraightThrough};
use crate::core::{CanonConfig, SetTransform, TransformPlan, TransformStrategy};
use crate::{CanonError, Result};
use ndarray::{Array2, Array3, Array5, Axis};
use rand::RngCore;
use tracing::debug;

/// Result of one canonicalized pass over an image set
#[derive(Clone, Debug)]
pub struct ImagePass {
    /// Task output in input order
    pub output: StraightThrough<Array5<f32>>,
    /// `[B, N]` scores the order was derived from
    pub score: Array2<f32>,
    /// Plan used for both directions
    pub plan: TransformPlan,
}

/// Wraps a set task network so it runs on canonically ordered sets.
///
/// With a permutation-equivariant scorer the wrapped model is
/// permutation-equivariant whatever the task network does.
#[derive(Clone, Debug)]
pub struct ImageCanonicalizer<C, T> {
    canon_net: C,
    task_net: T,
    strategy: TransformStrategy,
}

impl<C: ScoreNetwork, T: SetNetwork> ImageCanonicalizer<C, T> {
    /// Create a wrapper
    pub fn new(canon_net: C, task_net: T, strategy: TransformStrategy) -> Self {
        ImageCanonicalizer {
            canon_net,
            task_net,
            strategy,
        }
    }

    /// Create a wrapper with the strategy a config selects
    pub fn from_config(canon_net: C, task_net: T, config: &CanonConfig) -> Result<Self> {
        Ok(Self::new(canon_net, task_net, TransformStrategy::from_config(config)?))
    }

    /// Transform strategy
    pub fn strategy(&self) -> &TransformStrategy {
        &self.strategy
    }

    /// Deterministic pass: no Gumbel noise is drawn
    pub fn forward(&self, x: &Array5<f32>) -> Result<ImagePass> {
        self.run(x, None)
    }

    /// Pass with stochastic plans where the strategy allows them
    pub fn forward_with_rng(&self, x: &Array5<f32>, rng: &mut dyn RngCore) -> Result<ImagePass> {
        self.run(x, Some(rng))
    }

    fn run(&self, x: &Array5<f32>, rng: Option<&mut dyn RngCore>) -> Result<ImagePass> {
        let (batch, n) = (x.len_of(Axis(0)), x.len_of(Axis(1)));
        debug!(shape = ?x.shape(), strategy = ?self.strategy.kind(), "image canonicalization");

        let score = self.canon_net.score(x)?;
        check_shape("set score", score.shape(), &[batch, n])?;
        ensure_finite(&score, "canonicalization network")?;

        let plan = self.strategy.plan(&score, rng)?;
        let sorted = self.strategy.forward(&flatten(x)?, &plan)?;
        let canonical = unflatten(sorted.into_primary(), x.shape())?;

        let out = self.task_net.forward(&canonical)?;
        check_shape("task output", &out.shape()[..2], &[batch, n])?;
        let out_shape = out.shape().to_vec();

        let (primary, surrogate) = self.strategy.inverse(&flatten(&out)?, &plan)?.into_parts();
        let output = StraightThrough::new(
            unflatten(primary, &out_shape)?,
            unflatten(surrogate, &out_shape)?,
        );
        ensure_finite(output.primary(), "image canonicalization")?;

        Ok(ImagePass {
            output,
            score,
            plan,
        })
    }
}

/// `[B, N, C, H, W]` to `[B, N, C*H*W]`
fn flatten(x: &Array5<f32>) -> Result<Array3<f32>> {
    let (batch, n) = (x.len_of(Axis(0)), x.len_of(Axis(1)));
    if batch == 0 || n == 0 {
        return Err(CanonError::InvalidInput(format!(
            "empty image set of shape {:?}",
            x.shape()
        )));
    }
    let features = x.len() / (batch * n);
    x.as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, n, features))
        .map_err(|e| CanonError::InvalidInput(e.to_string()))
}

fn unflatten(x: Array3<f32>, shape: &[usize]) -> Result<Array5<f32>> {
    x.into_shape_with_order((shape[0], shape[1], shape[2], shape[3], shape[4]))
        .map_err(|e| CanonError::InvalidInput(e.to_string()))
}
