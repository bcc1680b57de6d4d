//! Canonicalization engines.
//!
//! Everything here is a pure function of its inputs and configuration: no
//! engine keeps state between calls.

mod dual;
mod frame;
mod numeric;
mod permutation;
mod sinkhorn;
mod soft_rank;
mod soft_sort;

pub use dual::StraightThrough;
pub use frame::{DegeneracyPolicy, Frame, FrameBuilder, FrameGradients, GramSchmidt};
pub use numeric::ensure_finite;
pub(crate) use numeric::check_shape;
pub use permutation::{argsort_rows, Permutation};
pub use sinkhorn::{
    affinity_from_scores, affinity_from_scores_backward, gumbel_sinkhorn, marginal_error,
    sample_gumbel, sinkhorn, sinkhorn_backward, transport_forward, transport_forward_backward,
    transport_inverse, transport_inverse_backward, SinkhornEngine, TransportGradients,
    TransportPlan, DEFAULT_NOISE_EPS,
};
pub use soft_rank::{soft_rank, soft_rank_rows, SoftRankRow};
pub use soft_sort::{SetGradients, SoftPermutation};
