//! Semi-supervised learning of a discriminant score.
//!
//! There is no ground truth for targets: only decoys are known to be false.
//! Every cross-validation repeat starts from a single feature (the main
//! score), selects targets that pass an FDR threshold under the current
//! discriminant, fits a classifier separating them from all decoys, and
//! re-scores. Models are cross-fit: the scores that select a fold's targets
//! always come from the model fit on the other fold.

use crate::fdr;
use crate::ml::boost::{self, BoostParams};
use crate::ml::linear_discriminant::LinearDiscriminantAnalysis;
use crate::ml::matrix::Matrix;
use crate::ml::tuning::{self, RandomSearch};
use crate::ml::{mean, sample_std};
use crate::record::{rank, Entity};
use crate::settings::{Classifier, ErrorSettings, LearnerSettings, MainScore, Settings};
use crate::weights::{Model, Standardizer, WeightVector};
use crate::xval::{assign_folds, Split};
use crate::Error;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub type Extractor = Box<dyn Fn(&Entity) -> f64 + Send + Sync>;

/// Named feature extractors: the candidate starting discriminants, and the
/// features presented to the classifier
#[derive(Default)]
pub struct FeatureRegistry {
    extractors: Vec<(String, Extractor)>,
}

impl FeatureRegistry {
    pub fn register<S, F>(&mut self, name: S, extractor: F)
    where
        S: Into<String>,
        F: Fn(&Entity) -> f64 + Send + Sync + 'static,
    {
        let name = name.into();
        self.extractors.retain(|(n, _)| *n != name);
        self.extractors.push((name, Box::new(extractor)));
    }

    /// Register every feature present in `entities` (in order of first
    /// appearance) that is used at the configured level and passes the
    /// score filter
    pub fn from_entities(entities: &[Entity], settings: &LearnerSettings) -> Self {
        let mut names: Vec<&str> = Vec::new();
        for entity in entities {
            for name in entity.features.names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let mut registry = FeatureRegistry::default();
        for name in names {
            let filtered = settings
                .score_filter
                .as_ref()
                .map_or(false, |filter| !filter.iter().any(|f| f == name));
            if !settings.level.accepts(name) || filtered {
                continue;
            }
            let key = name.to_string();
            registry.register(name, move |e: &Entity| e.features.get(&key).unwrap_or(f64::NAN));
        }
        registry
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.extractors.iter().map(|(n, _)| n.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Extractor> {
        self.extractors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

/// Outcome of a single cross-validation repeat
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepeatReport {
    pub seed: u64,
    pub main_score: String,
    /// Main score was negated: lower values are more target-like
    pub main_score_negated: bool,
    pub iterations_run: usize,
    pub skipped_iterations: usize,
    /// Held-out top targets passing the iteration threshold, per iteration
    /// (`None` for skipped iterations)
    pub held_out_passing: Vec<Option<usize>>,
}

impl RepeatReport {
    pub fn final_passing(&self) -> usize {
        self.held_out_passing
            .last()
            .copied()
            .flatten()
            .unwrap_or(0)
    }
}

pub struct Learned {
    pub weights: WeightVector,
    pub repeats: Vec<RepeatReport>,
}

/// Top-ranked targets and decoys of a subset of entities
struct Tops {
    targets: Vec<usize>,
    decoys: Vec<usize>,
}

fn tops(entities: &[&Entity], scores: &[f64]) -> Tops {
    let ranks = rank(entities, scores);
    let mut tops = Tops {
        targets: Vec::new(),
        decoys: Vec::new(),
    };
    for (ix, (entity, rank)) in entities.iter().zip(ranks).enumerate() {
        if rank == 1 {
            match entity.is_decoy {
                true => tops.decoys.push(ix),
                false => tops.targets.push(ix),
            }
        }
    }
    tops
}

/// Top-ranked targets passing `threshold`, as indices into `entities`.
/// Returns `None` if provisional q-values cannot be computed.
fn confident_targets(
    entities: &[&Entity],
    scores: &[f64],
    threshold: f64,
    error: &ErrorSettings,
) -> Option<Vec<usize>> {
    let tops = tops(entities, scores);
    let t = tops.targets.iter().map(|&ix| scores[ix]).collect::<Vec<_>>();
    let d = tops.decoys.iter().map(|&ix| scores[ix]).collect::<Vec<_>>();
    let q = fdr::q_values(&t, &d, error).ok()?;
    Some(
        tops.targets
            .into_iter()
            .zip(q)
            .filter(|(_, q)| *q <= threshold)
            .map(|(ix, _)| ix)
            .collect(),
    )
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.total_cmp(b));
    crate::ml::quantile(&sorted, 0.5)
}

/// Orient a feature so that higher is more target-like: returns the
/// (possibly negated) values and whether they were negated
fn orient(values: Vec<f64>, entities: &[&Entity]) -> (Vec<f64>, bool) {
    let (mut d, mut t) = (Vec::new(), Vec::new());
    for (v, e) in values.iter().zip(entities) {
        match e.is_decoy {
            true => d.push(*v),
            false => t.push(*v),
        }
    }
    if median(&d) > median(&t) {
        (values.into_iter().map(|v| -v).collect(), true)
    } else {
        (values, false)
    }
}

/// Choose the starting discriminant on the training fold.
fn select_main_score(
    registry: &FeatureRegistry,
    train: &[&Entity],
    settings: &Settings,
) -> Result<(String, bool), Error> {
    if let MainScore::Named(name) = &settings.learner.main_score {
        return match registry.get(name) {
            Some(_) => Ok((name.clone(), false)),
            None => Err(Error::Configuration(format!(
                "main score `{name}` is not among the features used for learning"
            ))),
        };
    }

    let mut best: Option<(usize, String, bool)> = None;
    for name in registry.names() {
        let Some(extract) = registry.get(name) else {
            continue;
        };
        let values = train.iter().map(|&e| extract(e)).collect::<Vec<_>>();
        let (values, negated) = orient(values, train);
        let count = confident_targets(
            train,
            &values,
            settings.learner.initial_fdr,
            &settings.error,
        )
        .map_or(0, |c| c.len());
        log::trace!("- main score candidate {}: {} targets pass", name, count);
        if best.as_ref().map_or(true, |(c, _, _)| count > *c) {
            best = Some((count, name.to_string(), negated));
        }
    }

    best.map(|(_, name, negated)| (name, negated))
        .ok_or_else(|| Error::Configuration("no features available for learning".into()))
}

fn fit(
    features: &Matrix,
    decoy: &[bool],
    learner: &LearnerSettings,
    params: &BoostParams,
    seed: u64,
) -> Option<Model> {
    match learner.classifier {
        Classifier::Lda => LinearDiscriminantAnalysis::train(features, decoy).map(|lda| Model::Linear {
            coefficients: lda.coefficients().to_vec(),
        }),
        Classifier::Ensemble => boost::train(features, decoy, params, seed)
            .map(|(ensemble, _)| Model::Ensemble { ensemble }),
    }
}

/// One side of a cross-validation split. `scores` always come from a model
/// fit on the other fold (or from the main score, before the first fit).
struct Fold<'a> {
    entities: Vec<&'a Entity>,
    x: Matrix,
    scores: Vec<f64>,
}

impl<'a> Fold<'a> {
    fn new(entities: &'a [Entity], matrix: &Matrix, members: &[usize]) -> Self {
        Fold {
            entities: members.iter().map(|&ix| &entities[ix]).collect(),
            x: matrix.select_rows(members),
            scores: Vec::new(),
        }
    }

    /// Confident targets at `threshold` and every decoy, as row indices and
    /// decoy labels. `None` if either class is missing.
    fn training_set(&self, threshold: f64, error: &ErrorSettings) -> Option<(Vec<usize>, Vec<bool>)> {
        let mut rows = confident_targets(&self.entities, &self.scores, threshold, error)
            .unwrap_or_default();
        rows.extend(
            self.entities
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_decoy)
                .map(|(ix, _)| ix),
        );
        let labels = rows.iter().map(|&ix| self.entities[ix].is_decoy).collect::<Vec<_>>();
        let positives = labels.iter().filter(|d| !**d).count();
        match positives == 0 || positives == labels.len() {
            true => None,
            false => Some((rows, labels)),
        }
    }
}

/// Cross-fit one iteration: fit a model on each fold from the targets its
/// current scores select, then re-score each fold with the model fit on the
/// other one. A fold whose model cannot be fit leaves the other fold's
/// scores unchanged.
///
/// Returns the model fit on the training fold (fold 0).
fn cross_fit<F>(folds: &mut [Fold<'_>; 2], threshold: f64, error: &ErrorSettings, mut fit: F) -> Option<Model>
where
    F: FnMut(usize, &Matrix, &[bool]) -> Option<Model>,
{
    let models = [0, 1].map(|ix| {
        let (rows, labels) = folds[ix].training_set(threshold, error)?;
        fit(ix, &folds[ix].x.select_rows(&rows), &labels)
    });
    if let Some(model) = &models[1] {
        folds[0].scores = model.score(&folds[0].x);
    }
    if let Some(model) = &models[0] {
        folds[1].scores = model.score(&folds[1].x);
    }
    let [train, _] = models;
    train
}

/// A single cross-validation repeat
fn learn_repeat(
    entities: &[Entity],
    matrix: &Matrix,
    registry: &FeatureRegistry,
    settings: &Settings,
    repeat: usize,
) -> Result<(Model, RepeatReport), Error> {
    let learner = &settings.learner;
    let seed = settings.seed.wrapping_add(repeat as u64);
    let assignment = assign_folds(entities, Split::Fraction(learner.xeval_fraction), seed)?;
    let mut folds = [0, 1].map(|fold| Fold::new(entities, matrix, &assignment.members(entities, fold)));

    let (main_score, negated) = select_main_score(registry, &folds[0].entities, settings)?;
    log::debug!(
        "- repeat {}: main score {}{}",
        repeat,
        main_score,
        if negated { " (negated)" } else { "" }
    );
    let extract = registry
        .get(&main_score)
        .ok_or_else(|| Error::Configuration(format!("unknown main score `{main_score}`")))?;
    let sign = if negated { -1.0 } else { 1.0 };
    for fold in folds.iter_mut() {
        fold.scores = fold.entities.iter().map(|&e| sign * extract(e)).collect();
    }

    let mut params = learner.ensemble.params.clone();
    let mut tuned = !(learner.classifier == Classifier::Ensemble && learner.ensemble.autotune);

    let mut model: Option<Model> = None;
    let mut report = RepeatReport {
        seed,
        main_score,
        main_score_negated: negated,
        iterations_run: 0,
        skipped_iterations: 0,
        held_out_passing: Vec::with_capacity(learner.num_iterations),
    };

    for iteration in 0..learner.num_iterations {
        let threshold = learner.fdr_threshold(iteration);
        report.iterations_run += 1;

        let fitted = cross_fit(&mut folds, threshold, &settings.error, |fold, x, labels| {
            if !tuned {
                let mut search = RandomSearch::new(params.clone(), learner.ensemble.tune_rounds, seed);
                params = tuning::tune(x, labels, &mut search, &params, seed);
                log::debug!("- repeat {}: tuned ensemble parameters {:?}", repeat, params);
                tuned = true;
            }
            let fitted = fit(x, labels, learner, &params, seed ^ iteration as u64 ^ ((fold as u64) << 32));
            if fitted.is_none() {
                log::debug!(
                    "- repeat {}, iteration {}: classifier could not be fit on fold {}",
                    repeat,
                    iteration,
                    fold
                );
            }
            fitted
        });

        let Some(fitted) = fitted else {
            log::debug!(
                "- repeat {}, iteration {}: no usable training set at FDR {:.3}, skipping",
                repeat,
                iteration,
                threshold
            );
            report.skipped_iterations += 1;
            report.held_out_passing.push(None);
            continue;
        };

        let [_, held_out] = &folds;
        let passing = confident_targets(&held_out.entities, &held_out.scores, threshold, &settings.error)
            .map_or(0, |c| c.len());
        log::trace!(
            "- repeat {}, iteration {}: {} held-out targets pass at FDR {:.3}",
            repeat,
            iteration,
            passing,
            threshold
        );
        report.held_out_passing.push(Some(passing));
        model = Some(fitted);
    }

    let converged = matches!(report.held_out_passing.last(), Some(Some(_)));
    match model {
        Some(model) if converged => Ok((model, report)),
        _ => Err(Error::DegenerateTrainingSet(format!(
            "final iteration of cross-validation repeat {repeat} had no confident targets or could not be fit"
        ))),
    }
}

/// Learn a discriminant from `entities`.
///
/// Repeats run in parallel on the current rayon pool; each repeat derives
/// its seed from `settings.seed`, so the result does not depend on the
/// number of threads.
pub fn learn(entities: &[Entity], settings: &Settings) -> Result<Learned, Error> {
    let num_decoys = entities.iter().filter(|e| e.is_decoy).count();
    fdr::check_labels(entities.len() - num_decoys, num_decoys)?;

    let registry = FeatureRegistry::from_entities(entities, &settings.learner);
    if registry.is_empty() {
        return Err(Error::Configuration(format!(
            "no features available for learning at level {:?}",
            settings.learner.level
        )));
    }
    let names = registry.names().map(String::from).collect::<Vec<_>>();
    log::info!(
        "learning {:?} discriminant from {} features, {} entities ({} decoys)",
        settings.learner.classifier,
        names.len(),
        entities.len(),
        num_decoys
    );

    let standardizer = Standardizer::fit(names, entities);
    let matrix = standardizer.matrix(entities)?;

    let results = (0..settings.learner.xeval_repeats)
        .into_par_iter()
        .map(|repeat| learn_repeat(entities, &matrix, &registry, settings, repeat))
        .collect::<Result<Vec<_>, Error>>()?;

    let (models, repeats): (Vec<Model>, Vec<RepeatReport>) = results.into_iter().unzip();

    let weights = match settings.learner.classifier {
        Classifier::Lda => {
            let linear = models
                .into_iter()
                .map(|model| WeightVector {
                    standardizer: standardizer.clone(),
                    model,
                })
                .collect::<Vec<_>>();
            WeightVector::average(&linear).ok_or_else(|| {
                Error::DegenerateTrainingSet("no linear models to average".into())
            })?
        }
        Classifier::Ensemble => {
            // Best held-out passing count, ties go to the earliest repeat
            let best = repeats
                .iter()
                .enumerate()
                .max_by(|a, b| {
                    a.1.final_passing()
                        .cmp(&b.1.final_passing())
                        .then(b.0.cmp(&a.0))
                })
                .map_or(0, |(ix, _)| ix);
            let model = models.into_iter().nth(best).ok_or_else(|| {
                Error::DegenerateTrainingSet("no ensemble models to select from".into())
            })?;
            WeightVector {
                standardizer,
                model,
            }
        }
    };

    for r in &repeats {
        log::debug!(
            "- repeat seed {}: {} iterations ({} skipped), {} held-out targets passing",
            r.seed,
            r.iterations_run,
            r.skipped_iterations,
            r.final_passing()
        );
    }

    Ok(Learned { weights, repeats })
}

/// Score entities with learned or loaded weights. Raw classifier output is
/// normalised by the mean and standard deviation of the top-ranked decoys.
///
/// This is the only scoring routine: learning and weight-apply mode produce
/// identical scores for identical entities.
pub fn score_entities(weights: &WeightVector, entities: &[Entity]) -> Result<Vec<f64>, Error> {
    let raw = weights.raw_scores(entities)?;
    let refs = entities.iter().collect::<Vec<_>>();
    let tops = tops(&refs, &raw);
    let decoys = tops.decoys.iter().map(|&ix| raw[ix]).collect::<Vec<_>>();
    if decoys.is_empty() {
        return Err(Error::NoDecoys);
    }

    let mu = mean(&decoys);
    let sigma = match sample_std(&decoys) {
        s if s > 0.0 && s.is_finite() => s,
        s => {
            log::warn!(
                "top decoy scores have no spread (sd = {}): d-scores are only centered",
                s
            );
            1.0
        }
    };
    Ok(raw.into_iter().map(|s| (s - mu) / sigma).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Level;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn normal(rng: &mut SmallRng) -> f64 {
        let u: f64 = rng.gen::<f64>().max(1E-12);
        let v: f64 = rng.gen();
        (-2.0 * u.ln()).sqrt() * (2.0 * std::f64::consts::PI * v).cos()
    }

    /// One run of `n` target and `n` decoy groups with a single candidate
    /// each. Half of the targets are true, shifted by 3 sd in `var_signal`
    /// and by -3 sd in `var_inverted`.
    fn synthetic(n: usize, seed: u64) -> Vec<Entity> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut entities = Vec::with_capacity(2 * n);
        for i in 0..n {
            let shift = if i % 2 == 0 { 3.0 } else { 0.0 };
            let signal = normal(&mut rng) + shift;
            entities.push(
                Entity::new(format!("t{i}"), format!("gt{i}"), false)
                    .with_run("run0")
                    .with_feature("var_noise", normal(&mut rng))
                    .with_feature("var_signal", signal)
                    .with_feature("var_inverted", -(normal(&mut rng) + shift)),
            );
            entities.push(
                Entity::new(format!("d{i}"), format!("gd{i}"), true)
                    .with_run("run0")
                    .with_feature("var_noise", normal(&mut rng))
                    .with_feature("var_signal", normal(&mut rng))
                    .with_feature("var_inverted", -normal(&mut rng)),
            );
        }
        entities
    }

    fn settings() -> Settings {
        Settings {
            learner: LearnerSettings {
                num_iterations: 3,
                xeval_repeats: 2,
                ..Default::default()
            },
            threads: 1,
            seed: 42,
            ..Default::default()
        }
    }

    #[test]
    fn registry_level_and_filter() {
        let entities = vec![Entity::new("a", "g", false)
            .with_feature("var_ms1_shape", 1.0)
            .with_feature("main_var_coelution", 1.0)
            .with_feature("var_library_corr", 1.0)];

        let mut learner = LearnerSettings::default();
        let registry = FeatureRegistry::from_entities(&entities, &learner);
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["main_var_coelution", "var_library_corr"]
        );

        learner.level = Level::Ms1;
        let registry = FeatureRegistry::from_entities(&entities, &learner);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["var_ms1_shape"]);

        learner.level = Level::Ms1Ms2;
        learner.score_filter = Some(vec!["var_library_corr".into()]);
        let registry = FeatureRegistry::from_entities(&entities, &learner);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("var_library_corr").map(|f| f(&entities[0])), Some(1.0));
    }

    #[test]
    fn auto_main_score() {
        let entities = synthetic(300, 7);
        let refs = entities.iter().collect::<Vec<_>>();
        let settings = settings();

        let mut registry = FeatureRegistry::default();
        registry.register("var_noise", |e: &Entity| e.features.get("var_noise").unwrap_or(f64::NAN));
        registry.register("var_inverted", |e: &Entity| {
            e.features.get("var_inverted").unwrap_or(f64::NAN)
        });
        let (name, negated) = select_main_score(&registry, &refs, &settings).unwrap();
        assert_eq!(name, "var_inverted");
        assert!(negated);

        let named = Settings {
            learner: LearnerSettings {
                main_score: MainScore::Named("var_missing".into()),
                ..Default::default()
            },
            ..settings
        };
        assert!(matches!(
            select_main_score(&registry, &refs, &named),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn learn_and_apply_agree() {
        let entities = synthetic(400, 11);
        let settings = settings();
        let learned = learn(&entities, &settings).unwrap();
        assert_eq!(learned.repeats.len(), 2);
        assert!(learned.repeats.iter().all(|r| r.iterations_run == 3));
        assert!(learned.repeats.iter().all(|r| r.final_passing() > 0));

        let scores = score_entities(&learned.weights, &entities).unwrap();
        let reloaded = WeightVector::from_json(&learned.weights.to_json().unwrap()).unwrap();
        let applied = score_entities(&reloaded, &entities).unwrap();
        assert!(scores.iter().zip(&applied).all(|(a, b)| (a - b).abs() < 1E-9));

        // True targets (even indices) score well above the decoys
        let true_targets = (0..400).step_by(2).map(|i| scores[2 * i]).collect::<Vec<_>>();
        let decoys = (0..400).map(|i| scores[2 * i + 1]).collect::<Vec<_>>();
        assert!(mean(&true_targets) > mean(&decoys) + 2.0);
        assert!(mean(&decoys).abs() < 1E-9);
    }

    #[test]
    fn same_seed_same_weights() {
        let entities = synthetic(200, 3);
        let settings = settings();
        let a = learn(&entities, &settings).unwrap();
        let b = learn(&entities, &settings).unwrap();
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.repeats, b.repeats);
    }

    /// Two folds of 30 targets scored well above 30 decoys. Every row of a
    /// fold carries the same single feature value.
    fn two_folds(entities: &[Entity]) -> [Fold<'_>; 2] {
        [(1.0, 0..60), (2.0, 60..120)].map(|(value, range)| Fold {
            entities: entities[range].iter().collect(),
            x: Matrix::new(vec![value; 60], 60, 1),
            scores: (0..60)
                .map(|i| match i % 2 {
                    1 => (i as f64 - 30.0) / 10.0,
                    _ => 10.0 + i as f64 / 10.0,
                })
                .collect(),
        })
    }

    #[test]
    fn cross_fit_scores_come_from_the_other_fold() {
        let entities = (0..120)
            .map(|i| Entity::new(format!("e{i}"), format!("g{i}"), i % 2 == 1))
            .collect::<Vec<_>>();
        let error = ErrorSettings::default();

        // A model fit on rows with feature value v has coefficient v^2
        let mut seen = Vec::new();
        let mut folds = two_folds(&entities);
        let model = cross_fit(&mut folds, 0.1, &error, |fold, x, labels| {
            seen.push((fold, labels.iter().filter(|d| !**d).count()));
            let v = x.row(0)[0];
            Some(Model::Linear {
                coefficients: vec![v * v],
            })
        });
        assert_eq!(seen, vec![(0, 30), (1, 30)]);
        assert_eq!(model, Some(Model::Linear { coefficients: vec![1.0] }));
        // Fold 0 is re-scored by the fold 1 model (4 * 1), fold 1 by the
        // fold 0 model (1 * 2)
        assert!(folds[0].scores.iter().all(|&s| s == 4.0));
        assert!(folds[1].scores.iter().all(|&s| s == 2.0));

        // Without a fold 1 model, fold 0 keeps its previous scores
        let mut folds = two_folds(&entities);
        let before = folds[0].scores.clone();
        let model = cross_fit(&mut folds, 0.1, &error, |fold, _, _| {
            (fold == 0).then(|| Model::Linear {
                coefficients: vec![1.0],
            })
        });
        assert!(model.is_some());
        assert_eq!(folds[0].scores, before);
        assert!(folds[1].scores.iter().all(|&s| s == 2.0));
    }

    #[test]
    fn labels_are_required() {
        let entities = synthetic(50, 5)
            .into_iter()
            .filter(|e| !e.is_decoy)
            .collect::<Vec<_>>();
        assert!(matches!(learn(&entities, &settings()), Err(Error::NoDecoys)));
    }
}
