//! Engine configuration.
//!
//! [`Options`] is the user-facing, partially specified form (every field is
//! optional, as deserialized from a JSON parameter file). [`Options::build`]
//! fills in defaults, validates, and produces the immutable [`Settings`] that
//! is threaded through every call.

use crate::ml::boost::BoostParams;
use crate::Error;
use serde::{Deserialize, Serialize};

/// Seed used when running in reproducibility (test) mode
pub const TEST_SEED: u64 = 0x5EED;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classifier {
    Lda,
    Ensemble,
}

/// Starting discriminant for semi-supervised learning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MainScore {
    /// Select the best separating feature in every cross-validation repeat
    Auto,
    Named(String),
}

impl From<String> for MainScore {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => MainScore::Auto,
            _ => MainScore::Named(value),
        }
    }
}

impl From<MainScore> for String {
    fn from(value: MainScore) -> Self {
        match value {
            MainScore::Auto => "auto".into(),
            MainScore::Named(name) => name,
        }
    }
}

/// Grid of tuning parameters for π0 estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pi0Lambda {
    Fixed(f64),
    /// Half-open range `[start, end)` with `step`
    Range { start: f64, end: f64, step: f64 },
}

impl Pi0Lambda {
    /// Interpret a `(start, end, step)` triple, where `end == step == 0`
    /// denotes a single fixed value
    pub fn from_triple(start: f64, end: f64, step: f64) -> Self {
        if end == 0.0 && step == 0.0 {
            Pi0Lambda::Fixed(start)
        } else {
            Pi0Lambda::Range { start, end, step }
        }
    }

    pub fn grid(&self) -> Vec<f64> {
        match *self {
            Pi0Lambda::Fixed(lambda) => vec![lambda],
            Pi0Lambda::Range { start, end, step } => {
                if !(step > 0.0) {
                    return Vec::new();
                }
                // Guard against accumulated float error at the open end
                let n = ((end - start) / step - 1e-9).ceil().max(0.0) as usize;
                (0..n).map(|i| start + i as f64 * step).collect()
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let grid = self.grid();
        if matches!(self, Pi0Lambda::Range { .. }) && grid.len() < 4 {
            return Err(Error::Configuration(format!(
                "pi0_lambda range must contain at least four values, got {}",
                grid.len()
            )));
        }
        if grid.iter().any(|&l| !(0.0..1.0).contains(&l)) {
            return Err(Error::Configuration(
                "pi0_lambda values must lie in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pi0Method {
    Smoother,
    Bootstrap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LfdrTransform {
    Probit,
    Logit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityEstimator {
    Kde,
    Gmm,
}

/// Data level selected for learning - determines which features are used
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Ms1,
    Ms2,
    Ms1Ms2,
    Transition,
    Alignment,
}

impl Level {
    /// Is a feature with this name used for learning at this level?
    pub fn accepts(&self, feature: &str) -> bool {
        let ms1 = feature.starts_with("var_ms1_") || feature.starts_with("main_var_ms1_");
        match self {
            Level::Ms1 => ms1,
            Level::Ms2 => !ms1,
            Level::Ms1Ms2 | Level::Transition | Level::Alignment => true,
        }
    }
}

/// Aggregation scope at which FDR is estimated
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Context {
    RunSpecific,
    ExperimentWide,
    Global,
}

/// Settings for the null model / error-rate calculator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSettings {
    pub parametric: bool,
    pub pfdr: bool,
    pub pi0_lambda: Pi0Lambda,
    pub pi0_method: Pi0Method,
    pub pi0_smooth_df: usize,
    pub pi0_smooth_log: bool,
    pub lfdr_truncate: bool,
    pub lfdr_monotone: bool,
    pub lfdr_transform: LfdrTransform,
    pub lfdr_adj: f64,
    pub lfdr_eps: f64,
    pub density_estimator: DensityEstimator,
    pub grid_size: usize,
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self {
            parametric: false,
            pfdr: false,
            pi0_lambda: Pi0Lambda::Range {
                start: 0.1,
                end: 0.5,
                step: 0.05,
            },
            pi0_method: Pi0Method::Bootstrap,
            pi0_smooth_df: 3,
            pi0_smooth_log: false,
            lfdr_truncate: true,
            lfdr_monotone: true,
            lfdr_transform: LfdrTransform::Probit,
            lfdr_adj: 1.5,
            lfdr_eps: 1e-8,
            density_estimator: DensityEstimator::Kde,
            grid_size: 256,
        }
    }
}

/// Settings for the gradient-boosted ensemble classifier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSettings {
    pub params: BoostParams,
    pub autotune: bool,
    pub tune_rounds: usize,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            params: BoostParams::default(),
            autotune: false,
            tune_rounds: 20,
        }
    }
}

/// Settings for the semi-supervised learner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnerSettings {
    pub classifier: Classifier,
    pub num_iterations: usize,
    pub xeval_fraction: f64,
    pub xeval_repeats: usize,
    pub initial_fdr: f64,
    pub iteration_fdr: f64,
    pub main_score: MainScore,
    pub level: Level,
    /// Restrict learning to these features, if set
    pub score_filter: Option<Vec<String>>,
    pub ensemble: EnsembleSettings,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            classifier: Classifier::Lda,
            num_iterations: 10,
            xeval_fraction: 0.5,
            xeval_repeats: 10,
            initial_fdr: 0.15,
            iteration_fdr: 0.05,
            main_score: MainScore::Auto,
            level: Level::Ms2,
            score_filter: None,
            ensemble: EnsembleSettings::default(),
        }
    }
}

impl LearnerSettings {
    /// FDR cutoff used to select confident targets at iteration `i`:
    /// linear interpolation from `initial_fdr` (first iteration) to
    /// `iteration_fdr` (last iteration)
    pub fn fdr_threshold(&self, i: usize) -> f64 {
        if self.num_iterations <= 1 {
            return self.iteration_fdr;
        }
        let t = i.min(self.num_iterations - 1) as f64 / (self.num_iterations - 1) as f64;
        self.initial_fdr + (self.iteration_fdr - self.initial_fdr) * t
    }
}

/// Immutable configuration threaded through every engine invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub learner: LearnerSettings,
    pub error: ErrorSettings,
    pub context: Context,
    /// Worker threads; `-1` means all available processing units
    pub threads: i32,
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            learner: LearnerSettings::default(),
            error: ErrorSettings::default(),
            context: Context::ExperimentWide,
            threads: 1,
            seed: rand::random(),
        }
    }
}

impl Settings {
    pub fn num_threads(&self) -> usize {
        match self.threads {
            t if t < 1 => num_cpus::get(),
            t => t as usize,
        }
    }

    /// Build a worker pool owned by a single invocation
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, Error> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads())
            .build()
            .map_err(|e| Error::Configuration(format!("unable to build thread pool: {e}")))
    }
}

/// Ensemble options as deserialized from JSON
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct EnsembleOptions {
    pub n_estimators: Option<usize>,
    pub learning_rate: Option<f64>,
    pub max_depth: Option<usize>,
    pub min_child_weight: Option<f64>,
    pub lambda: Option<f64>,
    pub subsample: Option<f64>,
    pub early_stopping_rounds: Option<usize>,
    pub autotune: Option<bool>,
    pub tune_rounds: Option<usize>,
}

impl From<EnsembleOptions> for EnsembleSettings {
    fn from(value: EnsembleOptions) -> Self {
        let default = EnsembleSettings::default();
        let p = default.params;
        EnsembleSettings {
            params: BoostParams {
                n_estimators: value.n_estimators.unwrap_or(p.n_estimators),
                learning_rate: value.learning_rate.unwrap_or(p.learning_rate),
                max_depth: value.max_depth.unwrap_or(p.max_depth),
                min_child_weight: value.min_child_weight.unwrap_or(p.min_child_weight),
                lambda: value.lambda.unwrap_or(p.lambda),
                subsample: value.subsample.unwrap_or(p.subsample),
                early_stopping_rounds: value
                    .early_stopping_rounds
                    .unwrap_or(p.early_stopping_rounds),
            },
            autotune: value.autotune.unwrap_or(default.autotune),
            tune_rounds: value.tune_rounds.unwrap_or(default.tune_rounds),
        }
    }
}

/// `pi0_lambda` accepts either a single number or a `[start, end, step]` triple
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(untagged)]
pub enum LambdaOption {
    Fixed(f64),
    Triple([f64; 3]),
}

impl From<LambdaOption> for Pi0Lambda {
    fn from(value: LambdaOption) -> Self {
        match value {
            LambdaOption::Fixed(lambda) => Pi0Lambda::Fixed(lambda),
            LambdaOption::Triple([start, end, step]) => Pi0Lambda::from_triple(start, end, step),
        }
    }
}

/// Input parameters deserialized from a JSON file
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct Options {
    pub classifier: Option<Classifier>,
    pub num_iterations: Option<usize>,
    pub xeval_fraction: Option<f64>,
    pub xeval_repeats: Option<usize>,
    pub initial_fdr: Option<f64>,
    pub iteration_fdr: Option<f64>,
    pub main_score: Option<MainScore>,
    pub score_filter: Option<Vec<String>>,
    pub level: Option<Level>,
    pub ensemble: Option<EnsembleOptions>,

    pub parametric: Option<bool>,
    pub pfdr: Option<bool>,
    pub pi0_lambda: Option<LambdaOption>,
    pub pi0_method: Option<Pi0Method>,
    pub pi0_smooth_df: Option<usize>,
    pub pi0_smooth_log: Option<bool>,
    pub lfdr_truncate: Option<bool>,
    pub lfdr_monotone: Option<bool>,
    pub lfdr_transform: Option<LfdrTransform>,
    pub lfdr_adj: Option<f64>,
    pub lfdr_eps: Option<f64>,
    pub density_estimator: Option<DensityEstimator>,
    pub grid_size: Option<usize>,

    pub context: Option<Context>,
    pub threads: Option<i32>,
    pub seed: Option<u64>,
    /// Fix the random seed for reproducible output
    pub test: Option<bool>,
}

fn check_fdr(name: &str, value: f64) -> Result<(), Error> {
    if !(value > 0.0 && value < 1.0) {
        return Err(Error::Configuration(format!(
            "`{name}` must lie in (0, 1), got {value}"
        )));
    }
    Ok(())
}

impl Options {
    pub fn build(self) -> Result<Settings, Error> {
        let learner_default = LearnerSettings::default();
        let error_default = ErrorSettings::default();

        let learner = LearnerSettings {
            classifier: self.classifier.unwrap_or(learner_default.classifier),
            num_iterations: self.num_iterations.unwrap_or(learner_default.num_iterations),
            xeval_fraction: self.xeval_fraction.unwrap_or(learner_default.xeval_fraction),
            xeval_repeats: self.xeval_repeats.unwrap_or(learner_default.xeval_repeats),
            initial_fdr: self.initial_fdr.unwrap_or(learner_default.initial_fdr),
            iteration_fdr: self.iteration_fdr.unwrap_or(learner_default.iteration_fdr),
            main_score: self.main_score.unwrap_or(learner_default.main_score),
            level: self.level.unwrap_or(learner_default.level),
            score_filter: self.score_filter,
            ensemble: self.ensemble.map(Into::into).unwrap_or_default(),
        };

        let error = ErrorSettings {
            parametric: self.parametric.unwrap_or(error_default.parametric),
            pfdr: self.pfdr.unwrap_or(error_default.pfdr),
            pi0_lambda: self
                .pi0_lambda
                .map(Into::into)
                .unwrap_or(error_default.pi0_lambda),
            pi0_method: self.pi0_method.unwrap_or(error_default.pi0_method),
            pi0_smooth_df: self.pi0_smooth_df.unwrap_or(error_default.pi0_smooth_df),
            pi0_smooth_log: self.pi0_smooth_log.unwrap_or(error_default.pi0_smooth_log),
            lfdr_truncate: self.lfdr_truncate.unwrap_or(error_default.lfdr_truncate),
            lfdr_monotone: self.lfdr_monotone.unwrap_or(error_default.lfdr_monotone),
            lfdr_transform: self.lfdr_transform.unwrap_or(error_default.lfdr_transform),
            lfdr_adj: self.lfdr_adj.unwrap_or(error_default.lfdr_adj),
            lfdr_eps: self.lfdr_eps.unwrap_or(error_default.lfdr_eps),
            density_estimator: self
                .density_estimator
                .unwrap_or(error_default.density_estimator),
            grid_size: self.grid_size.unwrap_or(error_default.grid_size),
        };

        let seed = match (self.test.unwrap_or(false), self.seed) {
            (_, Some(seed)) => seed,
            (true, None) => TEST_SEED,
            (false, None) => rand::random(),
        };

        let settings = Settings {
            learner,
            error,
            context: self.context.unwrap_or(Context::ExperimentWide),
            threads: self.threads.unwrap_or(1),
            seed,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        let learner = &self.learner;
        check_fdr("initial_fdr", learner.initial_fdr)?;
        check_fdr("iteration_fdr", learner.iteration_fdr)?;
        if !(learner.xeval_fraction > 0.0 && learner.xeval_fraction < 1.0) {
            return Err(Error::Configuration(format!(
                "`xeval_fraction` must lie in (0, 1), got {}",
                learner.xeval_fraction
            )));
        }
        if learner.num_iterations == 0 || learner.xeval_repeats == 0 {
            return Err(Error::Configuration(
                "`num_iterations` and `xeval_repeats` must be at least 1".into(),
            ));
        }
        if learner.initial_fdr < learner.iteration_fdr {
            log::warn!(
                "`initial_fdr` ({}) is stricter than `iteration_fdr` ({}): the FDR threshold will loosen over iterations",
                learner.initial_fdr,
                learner.iteration_fdr
            );
        }
        if learner.ensemble.params.max_depth == 0 || learner.ensemble.params.n_estimators == 0 {
            return Err(Error::Configuration(
                "ensemble `max_depth` and `n_estimators` must be at least 1".into(),
            ));
        }

        let error = &self.error;
        error.pi0_lambda.validate()?;
        if error.pi0_smooth_df < 1 {
            return Err(Error::Configuration("`pi0_smooth_df` must be at least 1".into()));
        }
        if !(error.lfdr_eps > 0.0 && error.lfdr_eps < 0.5) {
            return Err(Error::Configuration(format!(
                "`lfdr_eps` must lie in (0, 0.5), got {}",
                error.lfdr_eps
            )));
        }
        if !(error.lfdr_adj > 0.0) {
            return Err(Error::Configuration("`lfdr_adj` must be positive".into()));
        }
        if error.grid_size < 2 {
            return Err(Error::Configuration("`grid_size` must be at least 2".into()));
        }
        if error.lfdr_adj > 5.0 {
            log::warn!("`lfdr_adj` is higher than expected: local FDR will be heavily smoothed");
        }
        Ok(())
    }
}
