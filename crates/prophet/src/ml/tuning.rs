//! Hyperparameter search for the boosted ensemble.
//!
//! The search strategy sits behind [`TuningStrategy`], so it can be swapped
//! without touching the learner. [`RandomSearch`] samples a bounded
//! parameter space from a seeded generator.

use super::boost::{self, BoostParams};
use super::matrix::Matrix;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// One evaluated parameter set
#[derive(Clone, Debug, PartialEq)]
pub struct Trial {
    pub params: BoostParams,
    /// Held-out log-loss, lower is better
    pub loss: f64,
}

pub trait TuningStrategy {
    /// Suggest the next parameter set to evaluate, given all completed trials
    fn propose(&mut self, trials: &[Trial]) -> BoostParams;

    fn should_stop(&self, trials: &[Trial]) -> bool;
}

pub struct RandomSearch {
    base: BoostParams,
    rounds: usize,
    rng: SmallRng,
}

impl RandomSearch {
    pub fn new(base: BoostParams, rounds: usize, seed: u64) -> Self {
        Self {
            base,
            rounds,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl TuningStrategy for RandomSearch {
    fn propose(&mut self, trials: &[Trial]) -> BoostParams {
        // Always evaluate the configured parameters first
        if trials.is_empty() {
            return self.base.clone();
        }
        let log_lr = self.rng.gen_range(0.01f64.ln()..0.3f64.ln());
        BoostParams {
            max_depth: self.rng.gen_range(2..=6),
            learning_rate: log_lr.exp(),
            min_child_weight: self.rng.gen_range(1.0..10.0),
            lambda: self.rng.gen_range(0.0..5.0),
            subsample: self.rng.gen_range(0.6..=1.0),
            ..self.base.clone()
        }
    }

    fn should_stop(&self, trials: &[Trial]) -> bool {
        trials.len() >= self.rounds.max(1)
    }
}

/// Run `strategy` to completion, returning the best parameters found. Falls
/// back to `fallback` if no trial could be fit.
pub fn tune<S: TuningStrategy>(
    features: &Matrix,
    decoy: &[bool],
    strategy: &mut S,
    fallback: &BoostParams,
    seed: u64,
) -> BoostParams {
    search(strategy, fallback, |params| {
        boost::train(features, decoy, params, seed)
            .map(|(_, loss)| loss)
            .unwrap_or(f64::INFINITY)
    })
}

/// Evaluate proposals of `strategy` with `objective` until it stops. The
/// parameters with the lowest finite loss win, earliest trial on ties.
fn search<S, F>(strategy: &mut S, fallback: &BoostParams, mut objective: F) -> BoostParams
where
    S: TuningStrategy,
    F: FnMut(&BoostParams) -> f64,
{
    let mut trials: Vec<Trial> = Vec::new();
    while !strategy.should_stop(&trials) {
        let params = strategy.propose(&trials);
        let loss = objective(&params);
        log::trace!("- tuning trial {}: loss {:.5} {:?}", trials.len(), loss, params);
        trials.push(Trial { params, loss });
    }

    trials
        .into_iter()
        .filter(|t| t.loss.is_finite())
        .min_by(|a, b| a.loss.total_cmp(&b.loss))
        .map(|t| t.params)
        .unwrap_or_else(|| fallback.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn proposals_stay_in_bounds() {
        let mut search = RandomSearch::new(BoostParams::default(), 50, 11);
        let mut trials = Vec::new();
        assert_eq!(search.propose(&trials), BoostParams::default());
        while !search.should_stop(&trials) {
            let params = search.propose(&trials);
            if !trials.is_empty() {
                assert!((2..=6).contains(&params.max_depth));
                assert!(params.learning_rate >= 0.01 && params.learning_rate <= 0.3);
                assert!(params.subsample >= 0.6 && params.subsample <= 1.0);
            }
            trials.push(Trial { params, loss: 0.0 });
        }
        assert_eq!(trials.len(), 50);
    }

    /// Proposes max_depth 1, 2, 3, ... and stops after `rounds` trials
    struct Ladder {
        rounds: usize,
    }

    impl TuningStrategy for Ladder {
        fn propose(&mut self, trials: &[Trial]) -> BoostParams {
            BoostParams {
                max_depth: trials.len() + 1,
                ..BoostParams::default()
            }
        }

        fn should_stop(&self, trials: &[Trial]) -> bool {
            trials.len() >= self.rounds
        }
    }

    #[test]
    fn picks_lowest_loss() {
        // Loss is minimal at depth 4, and depth 2 cannot be fit
        let objective = |p: &BoostParams| match p.max_depth {
            2 => f64::INFINITY,
            d => (d as f64 - 4.0).powi(2),
        };
        let best = search(&mut Ladder { rounds: 6 }, &BoostParams::default(), objective);
        assert_eq!(best.max_depth, 4);

        let fallback = BoostParams {
            max_depth: 9,
            ..BoostParams::default()
        };
        let best = search(&mut Ladder { rounds: 3 }, &fallback, |_| f64::NAN);
        assert_eq!(best, fallback);
    }

    #[test]
    fn tunes_on_separable_data() {
        let mut data = Vec::new();
        let mut decoy = Vec::new();
        for i in 0..80 {
            let d = i % 2 == 1;
            data.extend([if d { -1.0 } else { 1.0 } + (i % 5) as f64 * 0.1, i as f64]);
            decoy.push(d);
        }
        let features = Matrix::new(data, 80, 2);
        let mut losses = Vec::new();
        let best = search(&mut RandomSearch::new(BoostParams::default(), 4, 2), &BoostParams::default(), |p| {
            let loss = boost::train(&features, &decoy, p, 2).map_or(f64::INFINITY, |(_, loss)| loss);
            losses.push((p.clone(), loss));
            loss
        });
        let argmin = losses
            .iter()
            .filter(|(_, l)| l.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p.clone());
        assert_eq!(Some(best.clone()), argmin);

        let mut again = RandomSearch::new(BoostParams::default(), 4, 2);
        assert_eq!(tune(&features, &decoy, &mut again, &BoostParams::default(), 2), best);
    }
}
