//! End-to-end entry points: learn (or load) a discriminant, score every
//! entity and estimate peak-group level error rates.

use crate::context::{Aggregator, Inference, Partition};
use crate::fdr::{EstimationFallback, NullModel};
use crate::learner::{self, RepeatReport};
use crate::record::{Entity, ScoreTable};
use crate::settings::Settings;
use crate::weights::WeightVector;
use crate::Error;
use serde::{Deserialize, Serialize};

/// Run-level diagnostics, reported alongside the score table
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub seed: u64,
    /// Estimated π0 of every error-model partition, keyed by run
    /// (`None` for pooled partitions)
    pub pi0: Vec<(Option<String>, f64)>,
    /// At least one partition fell back to π0 = 1
    pub pi0_fallback: bool,
    pub fallbacks: Vec<EstimationFallback>,
    /// Learning iterations run (and skipped) summed over all repeats,
    /// zero when weights were applied
    pub iterations_run: usize,
    pub skipped_iterations: usize,
    pub main_scores: Vec<String>,
    pub held_out_passing: Vec<Vec<Option<usize>>>,
}

impl Diagnostics {
    fn new(seed: u64, partitions: &[Partition], repeats: &[RepeatReport]) -> Self {
        let mut fallbacks = Vec::new();
        for partition in partitions {
            for fallback in &partition.statistics.fallbacks {
                if !fallbacks.contains(fallback) {
                    fallbacks.push(*fallback);
                }
            }
        }
        Diagnostics {
            seed,
            pi0: partitions
                .iter()
                .map(|p| (p.run_id.clone(), p.statistics.pi0()))
                .collect(),
            pi0_fallback: fallbacks.contains(&EstimationFallback::Pi0Boundary),
            fallbacks,
            iterations_run: repeats.iter().map(|r| r.iterations_run).sum(),
            skipped_iterations: repeats.iter().map(|r| r.skipped_iterations).sum(),
            main_scores: repeats.iter().map(|r| r.main_score.clone()).collect(),
            held_out_passing: repeats.iter().map(|r| r.held_out_passing.clone()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub table: ScoreTable,
    pub weights: WeightVector,
    pub partitions: Vec<Partition>,
    pub diagnostics: Diagnostics,
}

impl Scored {
    /// Null model of the first (or only) partition
    pub fn null_model(&self) -> Option<&NullModel> {
        self.partitions.first().map(|p| &p.statistics.null_model)
    }
}

fn finish(
    weights: WeightVector,
    repeats: &[RepeatReport],
    entities: &mut [Entity],
    settings: &Settings,
) -> Result<Scored, Error> {
    let d_scores = learner::score_entities(&weights, entities)?;
    entities
        .iter_mut()
        .zip(d_scores)
        .for_each(|(entity, d)| entity.d_score = d);

    let Inference {
        table, partitions, ..
    } = Aggregator::new(&settings.error).peak_groups(settings.context, entities)?;

    let diagnostics = Diagnostics::new(settings.seed, &partitions, repeats);
    log::info!(
        "{} of {} top-ranked targets pass 1% FDR",
        table.passing(0.01),
        table
            .rows()
            .iter()
            .filter(|r| !r.is_decoy && r.rank == 1)
            .count()
    );
    Ok(Scored {
        table,
        weights,
        partitions,
        diagnostics,
    })
}

/// Learn a discriminant from `entities`, then score them. On success, every
/// entity's `d_score` is set.
pub fn score(entities: &mut [Entity], settings: &Settings) -> Result<Scored, Error> {
    settings.validate()?;
    let pool = settings.thread_pool()?;
    pool.install(|| {
        let learned = learner::learn(entities, settings)?;
        finish(learned.weights, &learned.repeats, entities, settings)
    })
}

/// Score `entities` with previously learned weights, skipping learning.
/// Produces the same table as [`score`] would for the same weights.
pub fn apply_weights(
    entities: &mut [Entity],
    weights: WeightVector,
    settings: &Settings,
) -> Result<Scored, Error> {
    settings.validate()?;
    if entities.is_empty() {
        return Err(Error::NoTargets);
    }
    let pool = settings.thread_pool()?;
    pool.install(|| finish(weights, &[], entities, settings))
}
