//! Point-set canonicalization with learned frames

use super::{FrameNetwork, PositionPredictor};
use crate::canon::{check_shape, ensure_finite, Frame, FrameBuilder};
use crate::core::CanonConfig;
use crate::Result;
use ndarray::{Array2, Array3, Axis};
use tracing::debug;

/// Batched particle system: `[B, n, 3]` positions and velocities, `[B, n]` charges
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleBatch {
    loc: Array3<f32>,
    vel: Array3<f32>,
    charges: Array2<f32>,
}

impl ParticleBatch {
    /// Validate shapes and bundle
    pub fn new(loc: Array3<f32>, vel: Array3<f32>, charges: Array2<f32>) -> Result<Self> {
        check_shape("particle positions", loc.shape(), &[0, 0, 3])?;
        check_shape("particle velocities", vel.shape(), loc.shape())?;
        check_shape("particle charges", charges.shape(), &loc.shape()[..2])?;
        Ok(ParticleBatch { loc, vel, charges })
    }

    /// Positions
    pub fn loc(&self) -> &Array3<f32> {
        &self.loc
    }

    /// Velocities
    pub fn vel(&self) -> &Array3<f32> {
        &self.vel
    }

    /// Charges
    pub fn charges(&self) -> &Array2<f32> {
        &self.charges
    }

    /// Number of samples
    pub fn batch_size(&self) -> usize {
        self.loc.len_of(Axis(0))
    }

    /// Particles per sample
    pub fn particles(&self) -> usize {
        self.loc.len_of(Axis(1))
    }

    /// Same system seen from `frame`
    pub fn canonicalize(&self, frame: &Frame) -> Result<Self> {
        Ok(ParticleBatch {
            loc: frame.canonicalize_points(&self.loc)?,
            vel: frame.canonicalize_vectors(&self.vel)?,
            charges: self.charges.clone(),
        })
    }
}

/// Result of one canonicalized pass
#[derive(Clone, Debug)]
pub struct GeometricPass {
    /// Predicted positions in the world frame
    pub prediction: Array3<f32>,
    /// Predicted positions in the learned frame
    pub local: Array3<f32>,
    /// Learned frame
    pub frame: Frame,
    /// Raw `[B, 3, 3]` vectors the frame network returned
    pub vectors: Array3<f32>,
}

/// Gradients of a geometric pass.
///
/// `loc` and `vel` cover the canonicalize/predict/restore path only; the
/// frame network's own dependence on the particles is reached by feeding
/// `vectors` and `translation` through its VJP.
#[derive(Clone, Debug)]
pub struct GeometricGradients {
    /// Gradient w.r.t. the raw frame vectors
    pub vectors: Array3<f32>,
    /// Gradient w.r.t. the frame translation
    pub translation: Array2<f32>,
    /// Gradient w.r.t. the positions
    pub loc: Array3<f32>,
    /// Gradient w.r.t. the velocities
    pub vel: Array3<f32>,
}

/// Wraps a position predictor so it runs in a learned frame.
///
/// With an equivariant frame network the wrapped model is equivariant to
/// rotations and translations, whatever the predictor does.
#[derive(Clone, Debug)]
pub struct GeometricCanonicalizer<F, P> {
    canon_net: F,
    predictor: P,
    builder: FrameBuilder,
}

impl<F: FrameNetwork, P: PositionPredictor> GeometricCanonicalizer<F, P> {
    /// Create a wrapper
    pub fn new(canon_net: F, predictor: P, builder: FrameBuilder) -> Self {
        GeometricCanonicalizer {
            canon_net,
            predictor,
            builder,
        }
    }

    /// Create a wrapper with the frame settings of a config
    pub fn from_config(canon_net: F, predictor: P, config: &CanonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            canon_net,
            predictor,
            FrameBuilder::from_config(&config.frame)?,
        ))
    }

    /// Underlying predictor
    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    /// Learned frame for a batch
    pub fn frame(&self, batch: &ParticleBatch) -> Result<Frame> {
        self.frame_with_vectors(batch).map(|(frame, _)| frame)
    }

    fn frame_with_vectors(&self, batch: &ParticleBatch) -> Result<(Frame, Array3<f32>)> {
        let (vectors, translation) = self.canon_net.frame_vectors(batch)?;
        check_shape("frame network vectors", vectors.shape(), &[batch.batch_size(), 3, 3])?;
        let frame = self.builder.build_frame(&vectors, translation)?;
        Ok((frame, vectors))
    }

    /// Canonicalize, predict, and map the prediction back to the world frame
    pub fn forward(&self, batch: &ParticleBatch) -> Result<GeometricPass> {
        debug!(batch = batch.batch_size(), particles = batch.particles(), "geometric canonicalization");

        let (frame, vectors) = self.frame_with_vectors(batch)?;
        let canonical = batch.canonicalize(&frame)?;
        let local = self.predictor.predict(&canonical)?;
        check_shape("predictor output", local.shape(), batch.loc().shape())?;

        let prediction = frame.restore_points(&local)?;
        ensure_finite(&prediction, "geometric canonicalization")?;
        Ok(GeometricPass {
            prediction,
            local,
            frame,
            vectors,
        })
    }

    /// Backward pass of [`forward`](Self::forward) given the gradient w.r.t.
    /// the world-frame prediction.
    ///
    /// `predictor_vjp` receives the canonicalized batch and the gradient
    /// w.r.t. the local prediction, and returns the gradients w.r.t. the
    /// canonical positions and velocities.
    pub fn backward<V>(
        &self,
        batch: &ParticleBatch,
        pass: &GeometricPass,
        grad_prediction: &Array3<f32>,
        predictor_vjp: V,
    ) -> Result<GeometricGradients>
    where
        V: FnOnce(&ParticleBatch, &Array3<f32>) -> Result<(Array3<f32>, Array3<f32>)>,
    {
        let frame = &pass.frame;
        let restored = frame.restore_points_backward(&pass.local, grad_prediction)?;

        let canonical = batch.canonicalize(frame)?;
        let (grad_loc, grad_vel) = predictor_vjp(&canonical, &restored.points)?;
        check_shape("predictor position gradient", grad_loc.shape(), batch.loc().shape())?;
        check_shape("predictor velocity gradient", grad_vel.shape(), batch.vel().shape())?;

        let loc = frame.canonicalize_points_backward(batch.loc(), &grad_loc)?;
        let vel = frame.canonicalize_vectors_backward(batch.vel(), &grad_vel)?;

        let grad_rotation = restored.rotation + &loc.rotation + &vel.rotation;
        let vectors = self
            .builder
            .orthonormalize_backward(&pass.vectors, &grad_rotation)?;
        Ok(GeometricGradients {
            vectors,
            translation: restored.translation + &loc.translation,
            loc: loc.points,
            vel: vel.points,
        })
    }

    /// Mean distance between the canonicalized prediction and the predictor
    /// applied directly in the world frame
    pub fn canonicalization_gap(&self, batch: &ParticleBatch) -> Result<f32> {
        let direct = self.predictor.predict(batch)?;
        let wrapped = self.forward(batch)?.prediction;
        check_shape("predictor output", direct.shape(), wrapped.shape())?;

        let distances = (&wrapped - &direct)
            .mapv(|d| d * d)
            .sum_axis(Axis(2))
            .mapv(f32::sqrt);
        Ok(distances.mean().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{DegeneracyPolicy, GramSchmidt};
    use crate::models::{ConstantVelocity, EquivariantFrameNet};
    use crate::utils::{random_rotation, random_set, rigid_motion};
    use crate::CanonError;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn particles(rng: &mut ChaCha8Rng) -> ParticleBatch {
        let loc = random_set((3, 5, 3), rng);
        let vel = random_set((3, 5, 3), rng);
        let charges = Array2::from_shape_fn((3, 5), |(_, i)| if i < 2 { 1.0 } else { -1.0 });
        ParticleBatch::new(loc, vel, charges).unwrap()
    }

    fn moved(batch: &ParticleBatch, q: &Array2<f32>, shift: [f32; 3]) -> ParticleBatch {
        ParticleBatch::new(
            rigid_motion(batch.loc(), q, shift),
            rigid_motion(batch.vel(), q, [0.0; 3]),
            batch.charges().clone(),
        )
        .unwrap()
    }

    /// Ignores symmetry: always drifts along the world x axis
    fn drifting(batch: &ParticleBatch) -> Result<Array3<f32>> {
        let mut pred = batch.loc() + &(batch.vel() * 0.1);
        pred.index_axis_mut(Axis(2), 0).mapv_inplace(|x| x + 0.5);
        Ok(pred)
    }

    #[test]
    fn test_particle_batch_shapes() {
        let loc = Array3::<f32>::zeros((2, 4, 3));
        assert!(ParticleBatch::new(loc.clone(), loc.clone(), Array2::zeros((2, 4))).is_ok());
        assert!(matches!(
            ParticleBatch::new(loc.clone(), Array3::zeros((2, 3, 3)), Array2::zeros((2, 4))),
            Err(CanonError::ShapeMismatch { .. })
        ));
        assert!(ParticleBatch::new(loc.clone(), loc, Array2::zeros((2, 5))).is_err());
        assert!(ParticleBatch::new(
            Array3::zeros((2, 4, 2)),
            Array3::zeros((2, 4, 2)),
            Array2::zeros((2, 4))
        )
        .is_err());
    }

    #[test]
    fn test_wrapper_makes_predictor_equivariant() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let net = EquivariantFrameNet::new(16, &mut rng).unwrap();
        let model = GeometricCanonicalizer::from_config(net, drifting, &CanonConfig::for_nbody())
            .unwrap();
        let batch = particles(&mut rng);
        let q = random_rotation(&mut rng);
        let shift = [1.0, -2.0, 0.5];

        let pred = model.forward(&batch).unwrap().prediction;
        let pred_moved = model.forward(&moved(&batch, &q, shift)).unwrap().prediction;
        let expected = rigid_motion(&pred, &q, shift);
        assert!((pred_moved - expected).iter().all(|d| d.abs() < 1e-3));

        // The bare predictor is not equivariant
        let direct_moved = drifting(&moved(&batch, &q, shift)).unwrap();
        let direct_expected = rigid_motion(&drifting(&batch).unwrap(), &q, shift);
        assert!((direct_moved - direct_expected).iter().any(|d| d.abs() > 1e-2));
    }

    #[test]
    fn test_identity_frame_is_transparent() {
        fn world_frame(batch: &ParticleBatch) -> Result<(Array3<f32>, Array2<f32>)> {
            let mut vectors = Array3::zeros((batch.batch_size(), 3, 3));
            for mut v in vectors.outer_iter_mut() {
                v.assign(&Array2::eye(3));
            }
            Ok((vectors, Array2::zeros((batch.batch_size(), 3))))
        }

        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let batch = particles(&mut rng);
        let model = GeometricCanonicalizer::new(world_frame, drifting, FrameBuilder::default());

        let pass = model.forward(&batch).unwrap();
        let direct = drifting(&batch).unwrap();
        assert!((&pass.prediction - &direct).iter().all(|d| d.abs() < 1e-6));
        assert!(model.canonicalization_gap(&batch).unwrap() < 1e-6);
    }

    #[test]
    fn test_equivariant_predictor_has_no_gap() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let net = EquivariantFrameNet::new(8, &mut rng).unwrap();
        let model = GeometricCanonicalizer::from_config(
            net.clone(),
            ConstantVelocity { dt: 0.3 },
            &CanonConfig::for_nbody(),
        )
        .unwrap();
        assert_eq!(model.predictor(), &ConstantVelocity { dt: 0.3 });
        let batch = particles(&mut rng);
        assert!(model.canonicalization_gap(&batch).unwrap() < 1e-4);

        let drifting_model =
            GeometricCanonicalizer::from_config(net, drifting, &CanonConfig::for_nbody()).unwrap();
        assert!(drifting_model.canonicalization_gap(&batch).unwrap() > 1e-2);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(31);
        let batch = particles(&mut rng);
        let weights = random_set((3, 5, 3), &mut rng);
        let vectors = Array3::from_shape_fn((3, 3, 3), |(b, i, j)| {
            if i == j {
                1.0 + 0.2 * b as f32
            } else {
                0.3 * ((b + i + 2 * j) as f32).sin()
            }
        });
        let translation = Array2::from_shape_fn((3, 3), |(b, k)| 0.1 * (b + k) as f32 - 0.2);

        let model_for = |v: &Array3<f32>, t: &Array2<f32>| {
            let (v, t) = (v.clone(), t.clone());
            let net = move |_: &ParticleBatch| -> Result<(Array3<f32>, Array2<f32>)> {
                Ok((v.clone(), t.clone()))
            };
            GeometricCanonicalizer::new(net, drifting, FrameBuilder::default())
        };
        let loss = |v: &Array3<f32>, t: &Array2<f32>, b: &ParticleBatch| {
            (model_for(v, t).forward(b).unwrap().prediction * &weights).sum()
        };

        let model = model_for(&vectors, &translation);
        let pass = model.forward(&batch).unwrap();
        let grads = model
            .backward(&batch, &pass, &weights, |_, g| Ok((g.clone(), g * 0.1)))
            .unwrap();

        let h = 1e-2f32;
        let close = |numeric: f32, analytic: f32| (numeric - analytic).abs() < 3e-2;
        for (idx, &analytic) in grads.vectors.indexed_iter() {
            let (mut plus, mut minus) = (vectors.clone(), vectors.clone());
            plus[idx] += h;
            minus[idx] -= h;
            let numeric =
                (loss(&plus, &translation, &batch) - loss(&minus, &translation, &batch)) / (2.0 * h);
            assert!(close(numeric, analytic), "dV{idx:?}: numeric {numeric}, analytic {analytic}");
        }
        for (idx, &analytic) in grads.translation.indexed_iter() {
            let (mut plus, mut minus) = (translation.clone(), translation.clone());
            plus[idx] += h;
            minus[idx] -= h;
            let numeric =
                (loss(&vectors, &plus, &batch) - loss(&vectors, &minus, &batch)) / (2.0 * h);
            assert!(close(numeric, analytic), "dt{idx:?}: numeric {numeric}, analytic {analytic}");
        }
        for (idx, &analytic) in grads.vel.indexed_iter() {
            let (mut plus, mut minus) = (batch.vel().clone(), batch.vel().clone());
            plus[idx] += h;
            minus[idx] -= h;
            let with_vel = |vel: Array3<f32>| {
                ParticleBatch::new(batch.loc().clone(), vel, batch.charges().clone()).unwrap()
            };
            let numeric = (loss(&vectors, &translation, &with_vel(plus))
                - loss(&vectors, &translation, &with_vel(minus)))
                / (2.0 * h);
            assert!(close(numeric, analytic), "dvel{idx:?}: numeric {numeric}, analytic {analytic}");
        }

        // A rigid frame passes position gradients straight through
        assert!((&grads.loc - &weights).iter().all(|d| d.abs() < 1e-4));
    }

    #[test]
    fn test_frames_are_proper_rotations() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let net = EquivariantFrameNet::new(8, &mut rng).unwrap();
        let builder =
            FrameBuilder::new(GramSchmidt::Classical, DegeneracyPolicy::Fail, 1e-6).unwrap();
        let model = GeometricCanonicalizer::new(net, ConstantVelocity { dt: 0.1 }, builder);

        let frame = model.frame(&particles(&mut rng)).unwrap();
        assert!(frame.orthonormality_error() < 1e-4);
        assert!(frame.determinants().iter().all(|d| (d - 1.0).abs() < 1e-2));
    }
}
