//! Set-to-set transform strategies

use super::model_config::{CanonConfig, StrategyKind};
use crate::canon::{SetGradients, SinkhornEngine, SoftPermutation, StraightThrough, TransportPlan};
use crate::{CanonError, Result};
use ndarray::{Array2, Array3};
use rand::RngCore;

/// Everything a strategy needs to move a set into canonical order and back.
///
/// Built once per forward pass by [`SetTransform::plan`] and reused for the
/// inverse, so a noisy Sinkhorn plan is undone with the same matrix.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformPlan {
    /// No reordering
    Identity,
    /// Order given by a `[B, N]` score
    Score(Array2<f32>),
    /// `[B, N, N]` soft permutation and the scores it came from
    Transport(TransportPlan),
}

/// Capability shared by every set canonicalization strategy
pub trait SetTransform {
    /// Turn a `[B, N]` score into a plan. `rng` enables stochastic plans
    /// where the strategy supports them.
    fn plan(&self, score: &Array2<f32>, rng: Option<&mut dyn RngCore>) -> Result<TransformPlan>;

    /// Move a `[B, N, D]` set into canonical order
    fn forward(&self, x: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>>;

    /// Move a `[B, N, D]` set from canonical order back to input order
    fn inverse(&self, y: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>>;

    /// Gradients of [`forward`](Self::forward) w.r.t. the set and the score
    fn forward_backward(
        &self,
        x: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients>;

    /// Gradients of [`inverse`](Self::inverse) w.r.t. the set and the score
    fn inverse_backward(
        &self,
        y: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients>;
}

fn wrong_plan(strategy: &str, plan: &TransformPlan) -> CanonError {
    CanonError::InvalidInput(format!("{strategy} strategy cannot apply plan {plan:?}"))
}

impl SetTransform for SoftPermutation {
    fn plan(&self, score: &Array2<f32>, _rng: Option<&mut dyn RngCore>) -> Result<TransformPlan> {
        Ok(TransformPlan::Score(score.clone()))
    }

    fn forward(&self, x: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match plan {
            TransformPlan::Score(score) => self.forward_transform(x, score),
            other => Err(wrong_plan("soft sort", other)),
        }
    }

    fn inverse(&self, y: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match plan {
            TransformPlan::Score(score) => self.inverse_transform(y, score),
            other => Err(wrong_plan("soft sort", other)),
        }
    }

    fn forward_backward(
        &self,
        x: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match plan {
            TransformPlan::Score(score) => SoftPermutation::forward_backward(self, x, score, grad_out),
            other => Err(wrong_plan("soft sort", other)),
        }
    }

    fn inverse_backward(
        &self,
        y: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match plan {
            TransformPlan::Score(score) => SoftPermutation::inverse_backward(self, y, score, grad_out),
            other => Err(wrong_plan("soft sort", other)),
        }
    }
}

impl SetTransform for SinkhornEngine {
    fn plan(&self, score: &Array2<f32>, rng: Option<&mut dyn RngCore>) -> Result<TransformPlan> {
        self.transport_plan(score, rng).map(TransformPlan::Transport)
    }

    fn forward(&self, x: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match plan {
            TransformPlan::Transport(p) => self.forward_transform(x, p.matrix()),
            other => Err(wrong_plan("optimal transport", other)),
        }
    }

    fn inverse(&self, y: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match plan {
            TransformPlan::Transport(p) => self.inverse_transform(y, p.matrix()),
            other => Err(wrong_plan("optimal transport", other)),
        }
    }

    fn forward_backward(
        &self,
        x: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match plan {
            TransformPlan::Transport(p) => SinkhornEngine::forward_backward(self, x, p, grad_out),
            other => Err(wrong_plan("optimal transport", other)),
        }
    }

    fn inverse_backward(
        &self,
        y: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match plan {
            TransformPlan::Transport(p) => SinkhornEngine::inverse_backward(self, y, p, grad_out),
            other => Err(wrong_plan("optimal transport", other)),
        }
    }
}

/// Tagged choice among the available set transforms
#[derive(Clone, Debug, PartialEq)]
pub enum TransformStrategy {
    /// Leave sets untouched
    Identity,
    /// Straight-through soft sorting
    SoftSort(SoftPermutation),
    /// Gumbel-Sinkhorn soft permutation
    OptimalTransport(SinkhornEngine),
}

impl TransformStrategy {
    /// Build the strategy a validated config selects
    pub fn from_config(config: &CanonConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config.strategy {
            StrategyKind::Identity => TransformStrategy::Identity,
            StrategyKind::SoftSort => {
                TransformStrategy::SoftSort(SoftPermutation::from_config(&config.soft_sort)?)
            }
            StrategyKind::OptimalTransport => {
                TransformStrategy::OptimalTransport(SinkhornEngine::new(config.sinkhorn.clone())?)
            }
        })
    }

    /// Which variant this is
    pub fn kind(&self) -> StrategyKind {
        match self {
            TransformStrategy::Identity => StrategyKind::Identity,
            TransformStrategy::SoftSort(_) => StrategyKind::SoftSort,
            TransformStrategy::OptimalTransport(_) => StrategyKind::OptimalTransport,
        }
    }
}

impl SetTransform for TransformStrategy {
    fn plan(&self, score: &Array2<f32>, rng: Option<&mut dyn RngCore>) -> Result<TransformPlan> {
        match self {
            TransformStrategy::Identity => Ok(TransformPlan::Identity),
            TransformStrategy::SoftSort(engine) => engine.plan(score, rng),
            TransformStrategy::OptimalTransport(engine) => engine.plan(score, rng),
        }
    }

    fn forward(&self, x: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match self {
            TransformStrategy::Identity => Ok(StraightThrough::exact(x.clone())),
            TransformStrategy::SoftSort(engine) => engine.forward(x, plan),
            TransformStrategy::OptimalTransport(engine) => engine.forward(x, plan),
        }
    }

    fn inverse(&self, y: &Array3<f32>, plan: &TransformPlan) -> Result<StraightThrough<Array3<f32>>> {
        match self {
            TransformStrategy::Identity => Ok(StraightThrough::exact(y.clone())),
            TransformStrategy::SoftSort(engine) => engine.inverse(y, plan),
            TransformStrategy::OptimalTransport(engine) => engine.inverse(y, plan),
        }
    }

    fn forward_backward(
        &self,
        x: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match self {
            TransformStrategy::Identity => Ok(pass_through(x, grad_out)),
            TransformStrategy::SoftSort(engine) => {
                SetTransform::forward_backward(engine, x, plan, grad_out)
            }
            TransformStrategy::OptimalTransport(engine) => {
                SetTransform::forward_backward(engine, x, plan, grad_out)
            }
        }
    }

    fn inverse_backward(
        &self,
        y: &Array3<f32>,
        plan: &TransformPlan,
        grad_out: &Array3<f32>,
    ) -> Result<SetGradients> {
        match self {
            TransformStrategy::Identity => Ok(pass_through(y, grad_out)),
            TransformStrategy::SoftSort(engine) => {
                SetTransform::inverse_backward(engine, y, plan, grad_out)
            }
            TransformStrategy::OptimalTransport(engine) => {
                SetTransform::inverse_backward(engine, y, plan, grad_out)
            }
        }
    }
}

/// Identity gradients: the set gets `grad_out`, the score nothing
fn pass_through(x: &Array3<f32>, grad_out: &Array3<f32>) -> SetGradients {
    let (batch, n, _) = x.dim();
    SetGradients {
        input: grad_out.clone(),
        score: Array2::zeros((batch, n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn set() -> (Array3<f32>, Array2<f32>) {
        (
            array![[[9.0f32, 0.9], [1.0, 0.1], [5.0, 0.5], [3.0, 0.3]]],
            array![[0.9f32, 0.1, 0.5, 0.3]],
        )
    }

    #[test]
    fn test_strategy_from_config() {
        let soft = TransformStrategy::from_config(&CanonConfig::for_image_sorting()).unwrap();
        assert_eq!(soft.kind(), StrategyKind::SoftSort);

        let ot = TransformStrategy::from_config(&CanonConfig::for_optimal_transport()).unwrap();
        assert_eq!(ot.kind(), StrategyKind::OptimalTransport);

        let mut bad = CanonConfig::for_optimal_transport();
        bad.sinkhorn.temperature = 0.0;
        assert!(TransformStrategy::from_config(&bad).is_err());
    }

    #[test]
    fn test_every_strategy_round_trips() {
        let (x, score) = set();
        let mut config = CanonConfig::for_optimal_transport();
        config.sinkhorn.temperature = 1e-3;
        config.sinkhorn.n_iter = 50;
        config.sinkhorn.noise = false;

        let strategies = [
            TransformStrategy::Identity,
            TransformStrategy::from_config(&CanonConfig::for_image_sorting()).unwrap(),
            TransformStrategy::from_config(&config).unwrap(),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for strategy in &strategies {
            let plan = strategy.plan(&score, Some(&mut rng)).unwrap();
            let sorted = strategy.forward(&x, &plan).unwrap();
            let restored = strategy.inverse(sorted.primary(), &plan).unwrap();
            assert!(
                (restored.primary() - &x).iter().all(|d| d.abs() < 1e-2),
                "{:?} did not round-trip",
                strategy.kind()
            );
        }
    }

    #[test]
    fn test_soft_sort_and_transport_agree_at_low_temperature() {
        let (x, score) = set();
        let mut config = CanonConfig::for_optimal_transport();
        config.sinkhorn.temperature = 1e-3;
        config.sinkhorn.noise = false;
        let ot = TransformStrategy::from_config(&config).unwrap();
        let soft = TransformStrategy::from_config(&CanonConfig::for_image_sorting()).unwrap();

        let ot_sorted = ot.forward(&x, &ot.plan(&score, None).unwrap()).unwrap();
        let soft_sorted = soft.forward(&x, &soft.plan(&score, None).unwrap()).unwrap();
        assert!((ot_sorted.primary() - soft_sorted.primary())
            .iter()
            .all(|d| d.abs() < 1e-3));
    }

    #[test]
    fn test_mismatched_plan_is_rejected() {
        let (x, score) = set();
        let soft = TransformStrategy::from_config(&CanonConfig::for_image_sorting()).unwrap();
        let ot = TransformStrategy::from_config(&CanonConfig::for_optimal_transport()).unwrap();
        let plan = ot.plan(&score, None).unwrap();
        assert!(soft.forward(&x, &plan).is_err());
        assert!(soft.inverse_backward(&x, &plan, &x).is_err());

        assert!(ot.inverse(&x, &TransformPlan::Score(score.clone())).is_err());
        assert!(ot
            .forward_backward(&x, &TransformPlan::Score(score), &x)
            .is_err());
    }

    #[test]
    fn test_strategy_backward_matches_finite_differences() {
        let x = array![[[1.0f32, -2.0], [0.5, 3.0], [-1.5, 0.25]]];
        // Soft ranks stay away from integers under unit regularization
        let score = array![[0.35f32, 0.1, 0.2]];
        let weights = array![[[0.3f32, -0.7], [1.1, 0.2], [-0.4, 0.9]]];
        let mut config = CanonConfig::for_optimal_transport();
        config.sinkhorn.noise = false;
        config.sinkhorn.temperature = 0.5;

        let strategies = [
            TransformStrategy::Identity,
            TransformStrategy::from_config(&CanonConfig::for_image_sorting()).unwrap(),
            TransformStrategy::from_config(&config).unwrap(),
        ];
        let h = 1e-3f32;
        for strategy in &strategies {
            let plan = strategy.plan(&score, None).unwrap();
            let grads = strategy.inverse_backward(&x, &plan, &weights).unwrap();
            let loss = |s: &Array2<f32>, y: &Array3<f32>| {
                let plan = strategy.plan(s, None).unwrap();
                (strategy.inverse(y, &plan).unwrap().surrogate() * &weights).sum()
            };

            for (idx, &analytic) in grads.input.indexed_iter() {
                let (mut plus, mut minus) = (x.clone(), x.clone());
                plus[idx] += h;
                minus[idx] -= h;
                let numeric = (loss(&score, &plus) - loss(&score, &minus)) / (2.0 * h);
                assert!(
                    (numeric - analytic).abs() < 1e-2,
                    "{:?} dy{idx:?}: numeric {numeric}, analytic {analytic}",
                    strategy.kind()
                );
            }
            for (idx, &analytic) in grads.score.indexed_iter() {
                let (mut plus, mut minus) = (score.clone(), score.clone());
                plus[idx] += h;
                minus[idx] -= h;
                let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * h);
                assert!(
                    (numeric - analytic).abs() < 2e-2,
                    "{:?} ds{idx:?}: numeric {numeric}, analytic {analytic}",
                    strategy.kind()
                );
            }
        }
    }
}
