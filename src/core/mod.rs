//! Configuration and the set-transform strategies built from it

mod model_config;
mod transform;

pub use model_config::{CanonConfig, FrameConfig, SinkhornConfig, SoftSortConfig, StrategyKind};
pub use transform::{SetTransform, TransformPlan, TransformStrategy};
