//! Utility functions for Canon-ML

pub mod losses;

use crate::Result;
use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Save object to JSON file
pub fn save_json<T: Serialize>(obj: &T, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(obj)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Load object from JSON file
pub fn load_json<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let obj = serde_json::from_str(&contents)?;
    Ok(obj)
}

/// Uniformly distributed random rotation matrix (Shoemake's unit quaternion method)
pub fn random_rotation<R: Rng + ?Sized>(rng: &mut R) -> Array2<f32> {
    use std::f32::consts::TAU;

    let (u1, u2, u3): (f32, f32, f32) = (rng.gen(), rng.gen(), rng.gen());
    let (a, b) = ((1.0 - u1).sqrt(), u1.sqrt());
    let (w, x, y, z) = (
        a * (TAU * u2).sin(),
        a * (TAU * u2).cos(),
        b * (TAU * u3).sin(),
        b * (TAU * u3).cos(),
    );

    ndarray::array![
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - z * w),
            2.0 * (x * z + y * w),
        ],
        [
            2.0 * (x * y + z * w),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - x * w),
        ],
        [
            2.0 * (x * z - y * w),
            2.0 * (y * z + x * w),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

/// Random `[B, N, D]` set with entries uniform in `[-1, 1)`
pub fn random_set<R: Rng + ?Sized>(shape: (usize, usize, usize), rng: &mut R) -> Array3<f32> {
    Array3::from_shape_simple_fn(shape, || rng.gen_range(-1.0..1.0))
}

/// Apply a world-frame rigid motion `p ↦ Q p + d` to `[B, n, 3]` points
pub fn rigid_motion(points: &Array3<f32>, rotation: &Array2<f32>, shift: [f32; 3]) -> Array3<f32> {
    let shift = ndarray::aview1(&shift).insert_axis(ndarray::Axis(0));
    let mut out = Array3::zeros(points.raw_dim());
    for (mut o, p) in out.outer_iter_mut().zip(points.outer_iter()) {
        o.assign(&(p.dot(&rotation.t()) + &shift));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_random_rotation_is_proper() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            let q = random_rotation(&mut rng);
            let err = (q.dot(&q.t()) - Array2::<f32>::eye(3)).mapv(f32::abs).sum();
            assert!(err < 1e-5);

            let det = q[(0, 0)] * (q[(1, 1)] * q[(2, 2)] - q[(1, 2)] * q[(2, 1)])
                - q[(0, 1)] * (q[(1, 0)] * q[(2, 2)] - q[(1, 2)] * q[(2, 0)])
                + q[(0, 2)] * (q[(1, 0)] * q[(2, 1)] - q[(1, 1)] * q[(2, 0)]);
            assert!((det - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rigid_motion_translation_only() {
        let points = Array3::<f32>::zeros((1, 2, 3));
        let moved = rigid_motion(&points, &Array2::eye(3), [1.0, 2.0, 3.0]);
        assert_eq!(moved[(0, 1, 2)], 3.0);
        assert_eq!(moved[(0, 0, 0)], 1.0);
    }

    #[test]
    fn test_json_serialization() {
        let path = std::env::temp_dir().join("canon_ml_utils_test.json");
        let value = vec![1.5f32, -2.0, 3.25];

        save_json(&value, &path).unwrap();
        let loaded: Vec<f32> = load_json(&path).unwrap();
        assert_eq!(value, loaded);

        std::fs::remove_file(&path).ok();
    }
}
