//! Straight-through dual values

use ndarray::{Array, Dimension, Zip};

/// A forward value paired with the differentiable surrogate that carries its
/// gradient.
///
/// Downstream computation consumes [`primary`](Self::primary); backward passes
/// differentiate through [`surrogate`](Self::surrogate) only. When the two
/// coincide numerically the estimator is exact.
#[derive(Clone, Debug, PartialEq)]
pub struct StraightThrough<T> {
    primary: T,
    surrogate: T,
}

impl<T> StraightThrough<T> {
    /// Pair a forward value with its gradient surrogate
    pub fn new(primary: T, surrogate: T) -> Self {
        StraightThrough { primary, surrogate }
    }

    /// Value used by the forward computation
    pub fn primary(&self) -> &T {
        &self.primary
    }

    /// Value gradients are routed through
    pub fn surrogate(&self) -> &T {
        &self.surrogate
    }

    /// Drop the surrogate and keep the forward value
    pub fn into_primary(self) -> T {
        self.primary
    }

    /// Split into `(primary, surrogate)`
    pub fn into_parts(self) -> (T, T) {
        (self.primary, self.surrogate)
    }

    /// Apply the same map to both values
    pub fn map<U, F>(self, f: F) -> StraightThrough<U>
    where
        F: Fn(T) -> U,
    {
        StraightThrough {
            primary: f(self.primary),
            surrogate: f(self.surrogate),
        }
    }
}

impl<T: Clone> StraightThrough<T> {
    /// A value whose surrogate is itself
    pub fn exact(value: T) -> Self {
        StraightThrough {
            surrogate: value.clone(),
            primary: value,
        }
    }
}

impl<D: Dimension> StraightThrough<Array<f32, D>> {
    /// Largest absolute difference between primary and surrogate
    pub fn surrogate_gap(&self) -> f32 {
        let mut gap = 0.0f32;
        Zip::from(&self.primary)
            .and(&self.surrogate)
            .for_each(|&p, &s| gap = gap.max((p - s).abs()));
        gap
    }
}
