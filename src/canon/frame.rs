//! Orthonormal frames from raw vector triples

use super::numeric::{check_shape, ensure_finite};
use crate::core::FrameConfig;
use crate::{CanonError, Result};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::warn;

type Vec3 = [f32; 3];

fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn axpy(alpha: f32, x: Vec3, y: Vec3) -> Vec3 {
    [y[0] + alpha * x[0], y[1] + alpha * x[1], y[2] + alpha * x[2]]
}

fn scale(alpha: f32, x: Vec3) -> Vec3 {
    [alpha * x[0], alpha * x[1], alpha * x[2]]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Orthogonalization order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GramSchmidt {
    /// Project every raw vector onto the finished axes using its original value
    Classical,
    /// Project sequentially, each step using the partially orthogonalized
    /// vector. Less cancellation error than [`Classical`](Self::Classical).
    Modified,
}

/// What to do when a vector is (nearly) parallel to the axes before it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegeneracyPolicy {
    /// Divide by the minimum norm instead and log a warning. Output stays
    /// finite but that axis is no longer unit length, so the result is not a
    /// rotation and restoring no longer inverts canonicalizing.
    Clamp,
    /// Return [`CanonError::DegenerateFrame`]
    Fail,
}

/// Intermediate values of one orthonormalization, kept for the backward pass
struct Trace {
    v: [Vec3; 3],
    a2: Vec3,
    b3: Vec3,
    a3: Vec3,
    u: [Vec3; 3],
    /// Denominator used for each axis
    norms: [f32; 3],
    clamped: [bool; 3],
    /// -1 when the third axis was flipped to keep det(R) = +1
    sign: f32,
}

/// Builds proper rotations from vector triples with Gram-Schmidt
#[derive(Clone, Debug, PartialEq)]
pub struct FrameBuilder {
    variant: GramSchmidt,
    policy: DegeneracyPolicy,
    min_norm: f32,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        FrameBuilder {
            variant: GramSchmidt::Modified,
            policy: DegeneracyPolicy::Clamp,
            min_norm: 1e-6,
        }
    }
}

impl FrameBuilder {
    /// Create a builder
    pub fn new(variant: GramSchmidt, policy: DegeneracyPolicy, min_norm: f32) -> Result<Self> {
        if !(min_norm > 0.0 && min_norm.is_finite()) {
            return Err(CanonError::InvalidConfig(format!(
                "minimum frame norm must be positive and finite, got {min_norm}"
            )));
        }
        Ok(FrameBuilder {
            variant,
            policy,
            min_norm,
        })
    }

    /// Create a builder from its configuration section
    pub fn from_config(config: &FrameConfig) -> Result<Self> {
        Self::new(config.variant, config.degeneracy, config.min_norm)
    }

    /// Orthogonalization variant
    pub fn variant(&self) -> GramSchmidt {
        self.variant
    }

    /// Orthonormalize `[B, 3, 3]` vector triples (row k is vector k) into
    /// rotations whose rows are the frame axes.
    ///
    /// The third axis is flipped when needed so every unclamped result has
    /// det +1. Under [`DegeneracyPolicy::Clamp`] a degenerate triple yields a
    /// finite matrix that is not orthonormal.
    pub fn orthonormalize(&self, vectors: &Array3<f32>) -> Result<Array3<f32>> {
        check_shape("frame vectors", vectors.shape(), &[0, 3, 3])?;
        ensure_finite(vectors, "frame vectors")?;

        let mut rotation = Array3::zeros(vectors.raw_dim());
        for (sample, (v, mut r)) in vectors
            .outer_iter()
            .zip(rotation.outer_iter_mut())
            .enumerate()
        {
            let trace = self.trace(sample, v)?;
            for (k, axis) in trace.u.iter().enumerate() {
                r.row_mut(k).assign(&ndarray::aview1(axis));
            }
        }

        ensure_finite(&rotation, "gram-schmidt")?;
        Ok(rotation)
    }

    /// Rotation from `vectors` plus the given `[B, 3]` translation
    pub fn build_frame(&self, vectors: &Array3<f32>, translation: Array2<f32>) -> Result<Frame> {
        let rotation = self.orthonormalize(vectors)?;
        Frame::new(rotation, translation)
    }

    /// Vector-Jacobian product of [`orthonormalize`](Self::orthonormalize):
    /// gradient w.r.t. the raw vectors given the gradient w.r.t. the rotation.
    pub fn orthonormalize_backward(
        &self,
        vectors: &Array3<f32>,
        grad_rotation: &Array3<f32>,
    ) -> Result<Array3<f32>> {
        check_shape("frame vectors", vectors.shape(), &[0, 3, 3])?;
        check_shape("frame gradient", grad_rotation.shape(), vectors.shape())?;

        let mut grad = Array3::zeros(vectors.raw_dim());
        for (sample, ((v, g), mut out)) in vectors
            .outer_iter()
            .zip(grad_rotation.outer_iter())
            .zip(grad.outer_iter_mut())
            .enumerate()
        {
            let trace = self.trace(sample, v)?;
            let row = |k: usize| [g[(k, 0)], g[(k, 1)], g[(k, 2)]];
            let gv = self.backward(&trace, [row(0), row(1), row(2)]);
            for (k, gk) in gv.iter().enumerate() {
                out.row_mut(k).assign(&ndarray::aview1(gk));
            }
        }

        ensure_finite(&grad, "gram-schmidt backward")?;
        Ok(grad)
    }

    fn normalize(&self, sample: usize, axis: usize, a: Vec3) -> Result<(Vec3, f32, bool)> {
        let norm = dot(a, a).sqrt();
        if norm >= self.min_norm {
            return Ok((scale(1.0 / norm, a), norm, false));
        }
        match self.policy {
            DegeneracyPolicy::Fail => Err(CanonError::DegenerateFrame { sample, axis, norm }),
            DegeneracyPolicy::Clamp => {
                warn!(sample, axis, norm, "degenerate frame vector, clamping norm");
                Ok((scale(1.0 / self.min_norm, a), self.min_norm, true))
            }
        }
    }

    fn trace(&self, sample: usize, v: ArrayView2<f32>) -> Result<Trace> {
        let row = |k: usize| [v[(k, 0)], v[(k, 1)], v[(k, 2)]];
        let v = [row(0), row(1), row(2)];

        let (u1, n1, c1) = self.normalize(sample, 0, v[0])?;
        let a2 = axpy(-dot(v[1], u1), u1, v[1]);
        let (u2, n2, c2) = self.normalize(sample, 1, a2)?;
        let b3 = axpy(-dot(v[2], u1), u1, v[2]);
        let a3 = match self.variant {
            GramSchmidt::Modified => axpy(-dot(b3, u2), u2, b3),
            GramSchmidt::Classical => axpy(-dot(v[2], u2), u2, b3),
        };
        let (u3, n3, c3) = self.normalize(sample, 2, a3)?;

        let sign = if dot(u3, cross(u1, u2)) < 0.0 { -1.0 } else { 1.0 };
        Ok(Trace {
            v,
            a2,
            b3,
            a3,
            u: [u1, u2, scale(sign, u3)],
            norms: [n1, n2, n3],
            clamped: [c1, c2, c3],
            sign,
        })
    }

    fn backward(&self, t: &Trace, g: [Vec3; 3]) -> [Vec3; 3] {
        // y = a / n: grad_a = (g - y (y . g)) / n, or g / n when n was clamped
        let norm_back = |axis: usize, a: Vec3, g: Vec3| -> Vec3 {
            let n = t.norms[axis];
            if t.clamped[axis] {
                return scale(1.0 / n, g);
            }
            let y = scale(1.0 / n, a);
            scale(1.0 / n, axpy(-dot(y, g), y, g))
        };
        let [u1, u2, _] = t.u;
        let [v1, v2, v3] = t.v;

        let g_a3 = norm_back(2, t.a3, scale(t.sign, g[2]));
        let mut g_u2 = g[1];
        let mut g_u1 = g[0];

        // a3 = b3 - (x . u2) u2 with x = b3 (modified) or v3 (classical)
        let projected = match self.variant {
            GramSchmidt::Modified => t.b3,
            GramSchmidt::Classical => v3,
        };
        let through = axpy(-dot(u2, g_a3), u2, g_a3);
        g_u2 = axpy(-dot(projected, u2), g_a3, g_u2);
        g_u2 = axpy(-dot(u2, g_a3), projected, g_u2);
        let (g_b3, g_v3_direct) = match self.variant {
            GramSchmidt::Modified => (through, [0.0; 3]),
            GramSchmidt::Classical => (g_a3, scale(-dot(u2, g_a3), u2)),
        };

        // b3 = v3 - (v3 . u1) u1
        let mut g_v3 = axpy(-dot(u1, g_b3), u1, g_b3);
        g_v3 = axpy(1.0, g_v3_direct, g_v3);
        g_u1 = axpy(-dot(v3, u1), g_b3, g_u1);
        g_u1 = axpy(-dot(u1, g_b3), v3, g_u1);

        // u2 = a2 / |a2|, a2 = v2 - (v2 . u1) u1
        let g_a2 = norm_back(1, t.a2, g_u2);
        let g_v2 = axpy(-dot(u1, g_a2), u1, g_a2);
        g_u1 = axpy(-dot(v2, u1), g_a2, g_u1);
        g_u1 = axpy(-dot(u1, g_a2), v2, g_u1);

        let g_v1 = norm_back(0, v1, g_u1);
        [g_v1, g_v2, g_v3]
    }
}

/// Learned reference frame: rotation rows are the frame axes in world
/// coordinates, translation is the frame origin.
///
/// Built by [`FrameBuilder`], the rotation is proper unless an axis was
/// clamped; check [`orthonormality_error`](Self::orthonormality_error) when
/// clamping is enabled.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    rotation: Array3<f32>,
    translation: Array2<f32>,
}

impl Frame {
    /// Pair `[B, 3, 3]` rotations with `[B, 3]` translations
    pub fn new(rotation: Array3<f32>, translation: Array2<f32>) -> Result<Self> {
        check_shape("frame rotation", rotation.shape(), &[0, 3, 3])?;
        check_shape(
            "frame translation",
            translation.shape(),
            &[rotation.len_of(Axis(0)), 3],
        )?;
        Ok(Frame {
            rotation,
            translation,
        })
    }

    /// World frame for a batch of `batch` samples
    pub fn identity(batch: usize) -> Self {
        let mut rotation = Array3::zeros((batch, 3, 3));
        for mut r in rotation.outer_iter_mut() {
            r.assign(&Array2::eye(3));
        }
        Frame {
            rotation,
            translation: Array2::zeros((batch, 3)),
        }
    }

    /// `[B, 3, 3]` rotations
    pub fn rotation(&self) -> &Array3<f32> {
        &self.rotation
    }

    /// `[B, 3]` translations
    pub fn translation(&self) -> &Array2<f32> {
        &self.translation
    }

    /// Number of samples
    pub fn batch_size(&self) -> usize {
        self.rotation.len_of(Axis(0))
    }

    /// `(p - t) · Rᵗ` for `[B, n, 3]` points
    pub fn canonicalize_points(&self, points: &Array3<f32>) -> Result<Array3<f32>> {
        self.apply(points, true, true)
    }

    /// `v · Rᵗ` for `[B, n, 3]` direction vectors
    pub fn canonicalize_vectors(&self, vectors: &Array3<f32>) -> Result<Array3<f32>> {
        self.apply(vectors, true, false)
    }

    /// `p · R + t`, inverse of [`canonicalize_points`](Self::canonicalize_points)
    pub fn restore_points(&self, points: &Array3<f32>) -> Result<Array3<f32>> {
        self.apply(points, false, true)
    }

    /// `v · R`, inverse of [`canonicalize_vectors`](Self::canonicalize_vectors)
    pub fn restore_vectors(&self, vectors: &Array3<f32>) -> Result<Array3<f32>> {
        self.apply(vectors, false, false)
    }

    /// Vector-Jacobian product of [`canonicalize_points`](Self::canonicalize_points)
    pub fn canonicalize_points_backward(
        &self,
        points: &Array3<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<FrameGradients> {
        self.apply_backward(points, grad_out, true, true)
    }

    /// Vector-Jacobian product of [`canonicalize_vectors`](Self::canonicalize_vectors).
    /// The translation gradient is zero.
    pub fn canonicalize_vectors_backward(
        &self,
        vectors: &Array3<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<FrameGradients> {
        self.apply_backward(vectors, grad_out, true, false)
    }

    /// Vector-Jacobian product of [`restore_points`](Self::restore_points)
    pub fn restore_points_backward(
        &self,
        points: &Array3<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<FrameGradients> {
        self.apply_backward(points, grad_out, false, true)
    }

    /// Vector-Jacobian product of [`restore_vectors`](Self::restore_vectors).
    /// The translation gradient is zero.
    pub fn restore_vectors_backward(
        &self,
        vectors: &Array3<f32>,
        grad_out: &Array3<f32>,
    ) -> Result<FrameGradients> {
        self.apply_backward(vectors, grad_out, false, false)
    }

    /// Determinant of each rotation
    pub fn determinants(&self) -> Vec<f32> {
        self.rotation
            .outer_iter()
            .map(|r| {
                let row = |k: usize| [r[(k, 0)], r[(k, 1)], r[(k, 2)]];
                dot(row(2), cross(row(0), row(1)))
            })
            .collect()
    }

    /// Largest Frobenius norm of `R·Rᵗ - I` over the batch
    pub fn orthonormality_error(&self) -> f32 {
        let eye = Array2::<f32>::eye(3);
        self.rotation
            .outer_iter()
            .map(|r| (r.dot(&r.t()) - &eye).mapv(|v| v * v).sum().sqrt())
            .fold(0.0, f32::max)
    }

    fn apply(&self, points: &Array3<f32>, canonicalize: bool, translate: bool) -> Result<Array3<f32>> {
        check_shape("frame points", points.shape(), &[self.batch_size(), 0, 3])?;

        let mut out = Array3::zeros(points.raw_dim());
        for (b, mut o) in out.outer_iter_mut().enumerate() {
            let p = points.index_axis(Axis(0), b);
            let r = self.rotation.index_axis(Axis(0), b);
            let t = self.translation.slice(s![b..b + 1, ..]);
            let moved = match (canonicalize, translate) {
                (true, true) => (&p - &t).dot(&r.t()),
                (true, false) => p.dot(&r.t()),
                (false, true) => p.dot(&r) + &t,
                (false, false) => p.dot(&r),
            };
            o.assign(&moved);
        }
        ensure_finite(&out, "frame transform")?;
        Ok(out)
    }

    fn apply_backward(
        &self,
        points: &Array3<f32>,
        grad_out: &Array3<f32>,
        canonicalize: bool,
        translate: bool,
    ) -> Result<FrameGradients> {
        check_shape("frame points", points.shape(), &[self.batch_size(), 0, 3])?;
        check_shape("frame gradient", grad_out.shape(), points.shape())?;

        let mut grads = FrameGradients {
            points: Array3::zeros(points.raw_dim()),
            rotation: Array3::zeros(self.rotation.raw_dim()),
            translation: Array2::zeros(self.translation.raw_dim()),
        };
        for b in 0..self.batch_size() {
            let p = points.index_axis(Axis(0), b);
            let g = grad_out.index_axis(Axis(0), b);
            let r = self.rotation.index_axis(Axis(0), b);

            let (grad_points, grad_rotation) = if canonicalize {
                // out = q Rᵗ with q = p - t
                let q = if translate {
                    &p - &self.translation.slice(s![b..b + 1, ..])
                } else {
                    p.to_owned()
                };
                (g.dot(&r), g.t().dot(&q))
            } else {
                // out = p R + t
                (g.dot(&r.t()), p.t().dot(&g))
            };

            if translate {
                let grad_t = if canonicalize {
                    -grad_points.sum_axis(Axis(0))
                } else {
                    g.sum_axis(Axis(0))
                };
                grads.translation.row_mut(b).assign(&grad_t);
            }
            grads.points.index_axis_mut(Axis(0), b).assign(&grad_points);
            grads.rotation.index_axis_mut(Axis(0), b).assign(&grad_rotation);
        }

        ensure_finite(&grads.rotation, "frame transform backward")?;
        Ok(grads)
    }
}

/// Gradients of a frame transform w.r.t. its inputs
#[derive(Clone, Debug)]
pub struct FrameGradients {
    /// Gradient w.r.t. the `[B, n, 3]` points or vectors
    pub points: Array3<f32>,
    /// Gradient w.r.t. the `[B, 3, 3]` rotation
    pub rotation: Array3<f32>,
    /// Gradient w.r.t. the `[B, 3]` translation
    pub translation: Array2<f32>,
}
