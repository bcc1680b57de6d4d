//! Model configuration for canonicalization tasks

use crate::canon::{DegeneracyPolicy, GramSchmidt, DEFAULT_NOISE_EPS};
use crate::utils::{load_json, save_json};
use crate::{CanonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a set is brought into canonical order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Leave the set in input order
    Identity,
    /// Straight-through soft sorting by score
    SoftSort,
    /// Gumbel-Sinkhorn soft permutation
    OptimalTransport,
}

/// Soft sorting parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SoftSortConfig {
    /// Soft-rank regularization strength; smaller is closer to hard ranks
    pub regularization_strength: f32,
}

impl Default for SoftSortConfig {
    fn default() -> Self {
        SoftSortConfig {
            regularization_strength: 1.0,
        }
    }
}

/// Sinkhorn parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkhornConfig {
    /// Row/column normalization rounds
    pub n_iter: usize,
    /// Divides the log-affinities before normalization
    pub temperature: f32,
    /// Gumbel-Sinkhorn temperature, applied on top of `temperature`
    pub tau: f32,
    /// Perturb affinities with Gumbel noise when a random source is given
    pub noise: bool,
    /// Stabilizer inside the Gumbel double logarithm
    pub noise_eps: f32,
    /// Per-sample marginal error above which a warning is logged
    pub warn_marginal_error: f32,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        SinkhornConfig {
            n_iter: 20,
            temperature: 1.0,
            tau: 1.0,
            noise: false,
            noise_eps: DEFAULT_NOISE_EPS,
            warn_marginal_error: 0.1,
        }
    }
}

impl SinkhornConfig {
    /// Validate parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(CanonError::InvalidConfig(
                "Sinkhorn temperature must be positive".to_string(),
            ));
        }
        if !(self.tau > 0.0 && self.tau.is_finite()) {
            return Err(CanonError::InvalidConfig(
                "Gumbel temperature must be positive".to_string(),
            ));
        }
        if !(self.noise_eps > 0.0 && self.noise_eps < 1.0) {
            return Err(CanonError::InvalidConfig(
                "Gumbel stabilizer must lie in (0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Frame construction parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Gram-Schmidt variant
    pub variant: GramSchmidt,
    /// Handling of near-parallel input vectors
    pub degeneracy: DegeneracyPolicy,
    /// Norms below this count as degenerate
    pub min_norm: f32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            variant: GramSchmidt::Modified,
            degeneracy: DegeneracyPolicy::Clamp,
            min_norm: 1e-6,
        }
    }
}

/// Model configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonConfig {
    /// Set canonicalization strategy
    pub strategy: StrategyKind,
    /// Soft sorting parameters
    pub soft_sort: SoftSortConfig,
    /// Sinkhorn parameters
    pub sinkhorn: SinkhornConfig,
    /// Frame parameters
    pub frame: FrameConfig,
    /// Hidden width of the reference canonicalization networks
    pub canon_hidden_dim: usize,
}

impl CanonConfig {
    /// Create config for sorting image sets with soft ranks
    pub fn for_image_sorting() -> Self {
        CanonConfig {
            strategy: StrategyKind::SoftSort,
            soft_sort: SoftSortConfig::default(),
            sinkhorn: SinkhornConfig::default(),
            frame: FrameConfig::default(),
            canon_hidden_dim: 32,
        }
    }

    /// Create config for sorting image sets with Gumbel-Sinkhorn
    pub fn for_optimal_transport() -> Self {
        CanonConfig {
            strategy: StrategyKind::OptimalTransport,
            sinkhorn: SinkhornConfig {
                n_iter: 20,
                temperature: 0.1,
                tau: 1.0,
                noise: true,
                ..SinkhornConfig::default()
            },
            ..Self::for_image_sorting()
        }
    }

    /// Create config for n-body frame canonicalization. Degenerate frames
    /// are errors here: a clamped axis would break the rotation invariant
    /// the geometric wrapper relies on.
    pub fn for_nbody() -> Self {
        CanonConfig {
            strategy: StrategyKind::Identity,
            frame: FrameConfig {
                degeneracy: DegeneracyPolicy::Fail,
                ..FrameConfig::default()
            },
            canon_hidden_dim: 16,
            ..Self::for_image_sorting()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let strength = self.soft_sort.regularization_strength;
        if !(strength > 0.0 && strength.is_finite()) {
            return Err(CanonError::InvalidConfig(
                "Regularization strength must be positive".to_string(),
            ));
        }

        self.sinkhorn.validate()?;

        if !(self.frame.min_norm > 0.0 && self.frame.min_norm.is_finite()) {
            return Err(CanonError::InvalidConfig(
                "Minimum frame norm must be positive".to_string(),
            ));
        }

        if self.canon_hidden_dim == 0 {
            return Err(CanonError::InvalidConfig(
                "Hidden dimension must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Load and validate a JSON config
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: CanonConfig = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }
}

impl Default for CanonConfig {
    fn default() -> Self {
        Self::for_image_sorting()
    }
}
