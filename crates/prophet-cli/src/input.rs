use anyhow::{ensure, Context};
use clap::ArgMatches;
use prophet_core::settings::{Context as Scope, Options, Settings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Debug)]
/// Actual scoring parameters - may include overrides or default values not set by user
pub struct Search {
    pub version: String,
    pub settings: Settings,
    /// Contexts in which peptide, protein and gene level error rates are estimated
    pub inference_contexts: Vec<Scope>,
    pub apply_weights: Option<String>,
    pub input_paths: Vec<String>,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize, Default)]
/// Input parameters deserialized from JSON file
pub struct Input {
    #[serde(flatten)]
    options: Options,
    inference_contexts: Option<Vec<Scope>>,
    apply_weights: Option<String>,
    output_directory: Option<String>,
    input_paths: Option<Vec<String>>,
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be set. For more information try '--help'")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(input_paths) = matches.get_many::<String>("input_paths") {
            log::trace!("overriding `input_paths` parameter.");
            input.input_paths = Some(input_paths.into_iter().map(|p| p.into()).collect());
        }
        if let Some(weights) = matches.get_one::<String>("apply-weights") {
            log::trace!("overriding `apply_weights` parameter.");
            input.apply_weights = Some(weights.into());
        }
        if let Some(threads) = matches.get_one::<i32>("threads").copied() {
            input.options.threads = Some(threads);
        }
        if matches.get_flag("test") {
            input.options.test = Some(true);
        }

        ensure!(
            input.input_paths.as_ref().map_or(false, |p| !p.is_empty()),
            "`input_paths` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        prophet_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Search> {
        let settings = self.options.build()?;
        if settings.threads != 1 {
            log::trace!("using {} worker threads", settings.num_threads());
        }

        let input_paths = self
            .input_paths
            .context("`input_paths` must be provided")?;

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path).with_context(|| {
                    format!("Failed to create output directory `{}`", path.display())
                })?;
                path
            }
            None => std::env::current_dir()?,
        };

        let inference_contexts = self.inference_contexts.unwrap_or_else(|| vec![Scope::Global]);
        ensure!(
            !inference_contexts.is_empty(),
            "`inference_contexts` must name at least one context"
        );

        Ok(Search {
            version: clap::crate_version!().into(),
            settings,
            inference_contexts,
            apply_weights: self.apply_weights,
            input_paths,
            output_paths: Vec::new(),
            output_directory,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prophet_core::settings::Classifier;

    #[test]
    fn flattened_options() {
        let json = r#"{
            "classifier": "ensemble",
            "xeval_repeats": 2,
            "test": true,
            "inference_contexts": ["global", "run-specific"],
            "input_paths": ["a.tsv"]
        }"#;
        let input: Input = serde_json::from_str(json).unwrap();
        let search = input.build().unwrap();
        assert_eq!(search.settings.learner.classifier, Classifier::Ensemble);
        assert_eq!(search.settings.learner.xeval_repeats, 2);
        assert_eq!(search.settings.seed, prophet_core::settings::TEST_SEED);
        assert_eq!(search.inference_contexts, vec![Scope::Global, Scope::RunSpecific]);
        assert_eq!(search.input_paths, vec!["a.tsv".to_string()]);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let json = r#"{ "initial_fdr": 1.5, "input_paths": ["a.tsv"] }"#;
        let input: Input = serde_json::from_str(json).unwrap();
        assert!(input.build().is_err());
    }
}
