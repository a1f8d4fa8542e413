//! Learned discriminant models, and the single scoring routine shared by
//! learning and weight-apply mode.

use crate::ml::boost::Ensemble;
use crate::ml::linear_discriminant::LinearDiscriminantAnalysis;
use crate::ml::matrix::Matrix;
use crate::record::Entity;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-feature centering and scaling. Missing or non-finite feature values
/// are imputed with the feature mean, i.e. zero after standardisation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub features: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Standardizer {
    /// Fit on every entity. Features with no spread receive scale 1.
    pub fn fit(features: Vec<String>, entities: &[Entity]) -> Self {
        let mut mean = Vec::with_capacity(features.len());
        let mut scale = Vec::with_capacity(features.len());
        for name in &features {
            let values = entities
                .iter()
                .filter_map(|e| e.features.get(name))
                .filter(|v| v.is_finite())
                .collect::<Vec<_>>();
            let (mu, sd) = match values.len() {
                0 => (0.0, 1.0),
                _ => (crate::ml::mean(&values), crate::ml::std(&values)),
            };
            mean.push(mu);
            scale.push(if sd > 0.0 && sd.is_finite() { sd } else { 1.0 });
        }
        Standardizer {
            features,
            mean,
            scale,
        }
    }

    /// Standardised feature matrix, one row per entity.
    ///
    /// Fails if a feature is absent from every entity: these weights cannot
    /// have been trained on data shaped like `entities`.
    pub fn matrix(&self, entities: &[Entity]) -> Result<Matrix, Error> {
        for name in &self.features {
            if !entities.is_empty() && entities.iter().all(|e| e.features.get(name).is_none()) {
                return Err(Error::Configuration(format!(
                    "feature `{name}` is required by the model, but absent from the input"
                )));
            }
        }

        let cols = self.features.len();
        let mut data = Vec::with_capacity(entities.len() * cols);
        for entity in entities {
            for (ix, name) in self.features.iter().enumerate() {
                let value = match entity.features.get(name) {
                    Some(v) if v.is_finite() => (v - self.mean[ix]) / self.scale[ix],
                    _ => 0.0,
                };
                data.push(value);
            }
        }
        Ok(Matrix::new(data, entities.len(), cols))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum Model {
    /// Coefficients over standardised features
    Linear { coefficients: Vec<f64> },
    Ensemble { ensemble: Ensemble },
}

impl Model {
    pub fn score(&self, features: &Matrix) -> Vec<f64> {
        match self {
            Model::Linear { coefficients } => {
                LinearDiscriminantAnalysis::from_coefficients(coefficients.clone()).score(features)
            }
            Model::Ensemble { ensemble } => ensemble.score(features),
        }
    }
}

/// A trained discriminant: immutable once produced by the learner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub standardizer: Standardizer,
    pub model: Model,
}

impl WeightVector {
    pub fn features(&self) -> &[String] {
        &self.standardizer.features
    }

    /// Raw classifier output for every entity, higher is more target-like
    pub fn raw_scores(&self, entities: &[Entity]) -> Result<Vec<f64>, Error> {
        let matrix = self.standardizer.matrix(entities)?;
        Ok(self.model.score(&matrix))
    }

    /// Coefficient-wise mean of linear models sharing one standardizer.
    /// Returns `None` for an empty slice, or if any model is not linear.
    pub fn average(weights: &[WeightVector]) -> Option<WeightVector> {
        let first = weights.first()?;
        let mut sum = vec![0.0; first.features().len()];
        for w in weights {
            match &w.model {
                Model::Linear { coefficients } if w.standardizer == first.standardizer => {
                    sum.iter_mut()
                        .zip(coefficients)
                        .for_each(|(s, c)| *s += c);
                }
                _ => return None,
            }
        }
        let n = weights.len() as f64;
        Some(WeightVector {
            standardizer: first.standardizer.clone(),
            model: Model::Linear {
                coefficients: sum.into_iter().map(|s| s / n).collect(),
            },
        })
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<WeightVector, Error> {
        let weights: WeightVector = serde_json::from_str(json)?;
        let n = weights.features().len();
        let consistent = weights.standardizer.mean.len() == n
            && weights.standardizer.scale.len() == n
            && match &weights.model {
                Model::Linear { coefficients } => coefficients.len() == n,
                Model::Ensemble { .. } => true,
            };
        if !consistent {
            return Err(Error::Configuration(
                "weights file has inconsistent feature dimensions".into(),
            ));
        }
        Ok(weights)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<WeightVector, Error> {
        let json = std::fs::read_to_string(path)?;
        WeightVector::from_json(&json)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entities() -> Vec<Entity> {
        vec![
            Entity::new("a", "g0", false)
                .with_feature("main_var_x", 1.0)
                .with_feature("var_y", 10.0),
            Entity::new("b", "g1", true)
                .with_feature("main_var_x", 3.0)
                .with_feature("var_y", 10.0),
            Entity::new("c", "g2", false).with_feature("main_var_x", f64::NAN),
        ]
    }

    #[test]
    fn standardize() {
        let entities = entities();
        let s = Standardizer::fit(vec!["main_var_x".into(), "var_y".into()], &entities);
        assert_eq!(s.mean, vec![2.0, 10.0]);
        assert_eq!(s.scale, vec![1.0, 1.0]);

        let m = s.matrix(&entities).unwrap();
        assert_eq!(m.take(), vec![-1.0, 0.0, 1.0, 0.0, 0.0, 0.0]);

        let missing = Standardizer::fit(vec!["var_z".into()], &entities);
        assert!(matches!(missing.matrix(&entities), Err(Error::Configuration(_))));
    }

    #[test]
    fn average_and_json() {
        let entities = entities();
        let standardizer = Standardizer::fit(vec!["main_var_x".into(), "var_y".into()], &entities);
        let a = WeightVector {
            standardizer: standardizer.clone(),
            model: Model::Linear {
                coefficients: vec![1.0, 0.0],
            },
        };
        let b = WeightVector {
            standardizer,
            model: Model::Linear {
                coefficients: vec![3.0, 2.0],
            },
        };
        let avg = WeightVector::average(&[a, b]).unwrap();
        assert_eq!(
            avg.model,
            Model::Linear {
                coefficients: vec![2.0, 1.0]
            }
        );

        let json = avg.to_json().unwrap();
        let back = WeightVector::from_json(&json).unwrap();
        assert_eq!(back.raw_scores(&entities).unwrap(), avg.raw_scores(&entities).unwrap());

        assert!(WeightVector::from_json("{\"standardizer\": {}}").is_err());
    }
}
