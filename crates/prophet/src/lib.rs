pub mod context;
pub mod fdr;
pub mod learner;
pub mod ml;
pub mod record;
pub mod scoring;
pub mod settings;
pub mod weights;
pub mod xval;

use std::path::Path;

/// Which part of the engine produced an [`Error`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Learning,
    FdrEstimation,
    Io,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("degenerate training set: {0}")]
    DegenerateTrainingSet(String),
    #[error("no target entities available for error-rate estimation")]
    NoTargets,
    #[error("no decoy entities available to model the null distribution")]
    NoDecoys,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::Configuration(_) => Stage::Configuration,
            Error::DegenerateTrainingSet(_) => Stage::Learning,
            Error::NoTargets | Error::NoDecoys => Stage::FdrEstimation,
            Error::Json(_) | Error::Io(_) => Stage::Io,
        }
    }
}

pub fn read_json<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
