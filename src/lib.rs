//! # Canon-ML: learned canonicalization for equivariant models
//!
//! This library implements the differentiable machinery behind
//! canonicalization networks: a small network picks a reference ordering or
//! frame for its input, the input is moved into that frame, a task network
//! runs there, and its output is moved back.
//!
//! ## Features
//!
//! - **Soft sorting**: argsort permutations with a straight-through soft-rank
//!   relaxation, invertible on the hard path
//! - **Sinkhorn**: log-space Sinkhorn normalization with optional Gumbel noise
//! - **Frames**: Gram-Schmidt rotations with a guaranteed positive determinant
//! - **Wrappers**: image-set and point-set canonicalization around any task network

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Canonicalization engines: permutations, soft ranks, Sinkhorn, frames
pub mod canon;

/// Configuration and the set-transform strategies built from it
pub mod core;

/// Canonicalization wrappers and reference networks
pub mod models;

/// Utility functions and helpers
pub mod utils;

// Re-export commonly used types
pub use canon::{
    Frame, FrameBuilder, Permutation, SinkhornEngine, SoftPermutation, StraightThrough,
};
pub use core::{CanonConfig, SetTransform, TransformStrategy};
pub use models::{GeometricCanonicalizer, ImageCanonicalizer};

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    /// Input tensor does not have the expected shape
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Operation that rejected the input
        context: &'static str,
        /// Expected shape (0 marks a free dimension)
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Input is well-shaped but unusable (e.g. a set with fewer than two elements)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration rejected at construction
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Gram-Schmidt hit a near-zero norm under the failing degeneracy policy
    #[error("degenerate frame in sample {sample}: axis {axis} has norm {norm:e}")]
    DegenerateFrame {
        /// Batch row
        sample: usize,
        /// Frame axis being normalized (0, 1 or 2)
        axis: usize,
        /// Norm before normalization
        norm: f32,
    },

    /// An engine produced NaN or infinite values
    #[error("non-finite values produced by {stage}")]
    NonFinite {
        /// Engine stage that produced the values
        stage: &'static str,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, CanonError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        canon::{
            gumbel_sinkhorn, sinkhorn, DegeneracyPolicy, Frame, FrameBuilder, GramSchmidt,
            Permutation, SinkhornEngine, SoftPermutation, StraightThrough,
        },
        core::{CanonConfig, SetTransform, StrategyKind, TransformStrategy},
        models::{
            FrameNetwork, GeometricCanonicalizer, ImageCanonicalizer, PositionPredictor,
            ScoreNetwork, SetNetwork,
        },
        CanonError, Result,
    };
}
