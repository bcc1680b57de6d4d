//! Reconstruction losses used to score canonicalized models

use crate::{CanonError, Result};
use ndarray::{ArrayBase, Data, Dimension};

fn check_same_shape<S1, S2, D>(
    prediction: &ArrayBase<S1, D>,
    target: &ArrayBase<S2, D>,
) -> Result<()>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    if prediction.shape() != target.shape() {
        return Err(CanonError::ShapeMismatch {
            context: "loss",
            expected: target.shape().to_vec(),
            got: prediction.shape().to_vec(),
        });
    }
    if prediction.is_empty() {
        return Err(CanonError::InvalidInput("loss over an empty tensor".to_string()));
    }
    Ok(())
}

/// Mean absolute error over every element
pub fn mean_absolute_error<S1, S2, D>(
    prediction: &ArrayBase<S1, D>,
    target: &ArrayBase<S2, D>,
) -> Result<f32>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    check_same_shape(prediction, target)?;
    let total: f64 = prediction
        .iter()
        .zip(target.iter())
        .map(|(p, t)| (p - t).abs() as f64)
        .sum();
    Ok((total / prediction.len() as f64) as f32)
}

/// Mean squared error over every element
pub fn mean_squared_error<S1, S2, D>(
    prediction: &ArrayBase<S1, D>,
    target: &ArrayBase<S2, D>,
) -> Result<f32>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    check_same_shape(prediction, target)?;
    let total: f64 = prediction
        .iter()
        .zip(target.iter())
        .map(|(p, t)| ((p - t) as f64).powi(2))
        .sum();
    Ok((total / prediction.len() as f64) as f32)
}

/// Image reconstruction error on the 0-255 pixel scale
pub fn pixel_mae<S1, S2, D>(prediction: &ArrayBase<S1, D>, target: &ArrayBase<S2, D>) -> Result<f32>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    Ok(mean_absolute_error(prediction, target)? * 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_losses() {
        let p = array![[1.0f32, 2.0], [3.0, 4.0]];
        let t = array![[1.0f32, 0.0], [3.0, 5.0]];
        assert!((mean_absolute_error(&p, &t).unwrap() - 0.75).abs() < 1e-6);
        assert!((mean_squared_error(&p, &t).unwrap() - 1.25).abs() < 1e-6);
        assert!((pixel_mae(&p, &t).unwrap() - 191.25).abs() < 1e-3);
    }

    #[test]
    fn test_shape_mismatch() {
        let p = array![1.0f32, 2.0];
        let t = array![1.0f32, 2.0, 3.0];
        assert!(matches!(
            mean_absolute_error(&p, &t),
            Err(CanonError::ShapeMismatch { .. })
        ));
    }
}
