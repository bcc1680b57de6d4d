//! Canonicalization wrappers and the network capabilities they consume

mod geometric;
mod image;
mod networks;

pub use geometric::{GeometricCanonicalizer, GeometricGradients, GeometricPass, ParticleBatch};
pub use image::{ImageCanonicalizer, ImagePass};
pub use networks::{ConstantVelocity, DeepSetsScorer, EquivariantFrameNet, IdentitySetNetwork};

use crate::Result;
use ndarray::{Array2, Array3, Array5};

/// Scores every element of a `[B, N, C, H, W]` image set, returning `[B, N]`
pub trait ScoreNetwork {
    /// Score each set element
    fn score(&self, x: &Array5<f32>) -> Result<Array2<f32>>;
}

/// Task network over a batched image set. Must keep `B` and `N`.
pub trait SetNetwork {
    /// Run on a `[B, N, C, H, W]` set
    fn forward(&self, x: &Array5<f32>) -> Result<Array5<f32>>;
}

/// Produces three raw `[B, 3, 3]` vectors and a `[B, 3]` origin per sample
pub trait FrameNetwork {
    /// Frame triple and translation for a particle batch
    fn frame_vectors(&self, batch: &ParticleBatch) -> Result<(Array3<f32>, Array2<f32>)>;
}

/// Predicts `[B, n, 3]` positions from a particle batch
pub trait PositionPredictor {
    /// Predicted positions
    fn predict(&self, batch: &ParticleBatch) -> Result<Array3<f32>>;
}

impl<F> ScoreNetwork for F
where
    F: Fn(&Array5<f32>) -> Result<Array2<f32>>,
{
    fn score(&self, x: &Array5<f32>) -> Result<Array2<f32>> {
        self(x)
    }
}

impl<F> SetNetwork for F
where
    F: Fn(&Array5<f32>) -> Result<Array5<f32>>,
{
    fn forward(&self, x: &Array5<f32>) -> Result<Array5<f32>> {
        self(x)
    }
}

impl<F> FrameNetwork for F
where
    F: Fn(&ParticleBatch) -> Result<(Array3<f32>, Array2<f32>)>,
{
    fn frame_vectors(&self, batch: &ParticleBatch) -> Result<(Array3<f32>, Array2<f32>)> {
        self(batch)
    }
}

impl<F> PositionPredictor for F
where
    F: Fn(&ParticleBatch) -> Result<Array3<f32>>,
{
    fn predict(&self, batch: &ParticleBatch) -> Result<Array3<f32>> {
        self(batch)
    }
}
