//! Shared numeric helpers: shape checks, finite-value assertions, log-sum-exp

use crate::{CanonError, Result};
use ndarray::{ArrayBase, ArrayView1, Data, Dimension};
use num_traits::Float;

/// Fail with [`CanonError::NonFinite`] if any element is NaN or infinite.
///
/// Every engine calls this on its output before handing it back, so a
/// numerical blow-up is reported where it happens instead of surfacing later
/// as a NaN loss.
pub fn ensure_finite<A, S, D>(array: &ArrayBase<S, D>, stage: &'static str) -> Result<()>
where
    A: Float,
    S: Data<Elem = A>,
    D: Dimension,
{
    if array.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CanonError::NonFinite { stage })
    }
}

/// Check `got` against `expected`, where a 0 in `expected` accepts any size.
pub(crate) fn check_shape(context: &'static str, got: &[usize], expected: &[usize]) -> Result<()> {
    let matches = got.len() == expected.len()
        && got
            .iter()
            .zip(expected)
            .all(|(&g, &e)| e == 0 || g == e);
    if matches {
        Ok(())
    } else {
        Err(CanonError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

/// Numerically stable `ln(sum(exp(values)))`.
pub(crate) fn log_sum_exp(values: ArrayView1<f32>) -> f32 {
    let max = values.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    if !max.is_finite() {
        return max;
    }
    let sum: f32 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_log_sum_exp_matches_naive() {
        let v = array![0.5f32, -1.0, 2.0];
        let naive = v.mapv(f32::exp).sum().ln();
        assert!((log_sum_exp(v.view()) - naive).abs() < 1e-6);
    }

    #[test]
    fn test_log_sum_exp_large_values() {
        let v = array![1000.0f32, 1000.0];
        let lse = log_sum_exp(v.view());
        assert!((lse - (1000.0 + 2f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_ensure_finite() {
        let ok = Array2::<f32>::zeros((2, 2));
        assert!(ensure_finite(&ok, "test").is_ok());

        let mut bad = ok.clone();
        bad[(1, 0)] = f32::NAN;
        assert!(matches!(
            ensure_finite(&bad, "test"),
            Err(CanonError::NonFinite { stage: "test" })
        ));
    }

    #[test]
    fn test_check_shape_wildcards() {
        assert!(check_shape("t", &[4, 3, 3], &[0, 3, 3]).is_ok());
        assert!(check_shape("t", &[4, 3, 2], &[0, 3, 3]).is_err());
        assert!(check_shape("t", &[4, 3], &[0, 3, 3]).is_err());
    }
}
