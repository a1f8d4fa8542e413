//! Null model and error-rate estimation.
//!
//! Decoy discriminant scores define the null distribution. Target scores are
//! turned into p-values against it, π0 is estimated from those p-values, and
//! then q-values, local FDR and the confusion-matrix style statistics are
//! derived. The resulting [`ErrorTable`] can be queried for arbitrary scores
//! by nearest cutoff, so decoys and lower-ranked candidates receive the
//! error rates of the target closest in score.

use crate::ml::pi0::{self, Pi0Estimate};
use crate::ml::qvalue::{ascending_ranks, empirical_p_values, parametric_p_values, q_values as storey};
use crate::ml::{lfdr, mean, sample_std};
use crate::settings::ErrorSettings;
use crate::Error;
use serde::{Deserialize, Serialize};

/// q-value cutoffs reported in the summary table
pub const SUMMARY_CUTOFFS: [f64; 9] = [0.0, 0.01, 0.02, 0.05, 0.1, 0.2, 0.3, 0.4, 0.5];

/// Recoverable numeric problem that was handled by a documented fallback
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationFallback {
    /// π0 could not be estimated and was set to 1
    Pi0Boundary,
    /// Local FDR density could not be estimated, every lfdr was set to 1
    LfdrDensity,
    /// Decoy scores have no spread; empirical p-values were used instead
    ParametricNull,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalNull {
    pub mean: f64,
    pub std: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NullModel {
    pub pi0: Pi0Estimate,
    /// Normal fit to decoy scores, when parametric p-values were used
    pub parametric: Option<NormalNull>,
    pub num_targets: usize,
    pub num_decoys: usize,
    /// Ascending decoy scores
    #[serde(skip)]
    pub decoys: Vec<f64>,
}

impl NullModel {
    /// p-value of an arbitrary score under this null model
    pub fn p_value(&self, score: f64) -> f64 {
        match self.parametric {
            Some(null) => parametric_p_values(&[score], null.mean, null.std)[0],
            None => {
                let below = self.decoys.partition_point(|&d| d <= score);
                let m0 = self.decoys.len() as f64;
                ((self.decoys.len() - below) as f64 / m0).max(1.0 / m0)
            }
        }
    }
}

/// Error-rate statistics at the score of a single target
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRow {
    pub cutoff: f64,
    pub p_value: f64,
    pub q_value: f64,
    pub s_value: f64,
    pub tp: f64,
    pub fp: f64,
    pub tn: f64,
    #[serde(rename = "fn")]
    pub fn_: f64,
    pub fpr: f64,
    pub fdr: f64,
    pub fnr: f64,
    pub local_fdr: f64,
}

/// Error statistics for every target, sorted by descending cutoff
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorTable {
    rows: Vec<ErrorRow>,
}

impl ErrorTable {
    pub fn rows(&self) -> &[ErrorRow] {
        &self.rows
    }

    /// Row whose cutoff is closest to `score`. On an exact tie between two
    /// cutoffs, the lower (more conservative) one wins. NaN scores map to the
    /// lowest cutoff.
    pub fn lookup(&self, score: f64) -> &ErrorRow {
        let rows = &self.rows;
        if score.is_nan() {
            return &rows[rows.len() - 1];
        }
        // First row with cutoff <= score (rows are descending)
        let ix = rows.partition_point(|row| row.cutoff > score);
        match ix {
            0 => &rows[0],
            ix if ix == rows.len() => &rows[ix - 1],
            ix => {
                let above = &rows[ix - 1];
                let below = &rows[ix];
                if (above.cutoff - score) < (score - below.cutoff) {
                    above
                } else {
                    below
                }
            }
        }
    }

    /// Statistics at fixed q-value cutoffs, taken from the row with the
    /// nearest q-value
    pub fn summary(&self) -> Vec<(f64, ErrorRow)> {
        SUMMARY_CUTOFFS
            .iter()
            .filter_map(|&cutoff| {
                self.rows
                    .iter()
                    .min_by(|a, b| {
                        (a.q_value - cutoff)
                            .abs()
                            .total_cmp(&(b.q_value - cutoff).abs())
                    })
                    .map(|row| (cutoff, *row))
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub null_model: NullModel,
    pub table: ErrorTable,
    pub fallbacks: Vec<EstimationFallback>,
}

/// Both classes must be present before error rates can be estimated
pub fn check_labels(num_targets: usize, num_decoys: usize) -> Result<(), Error> {
    if num_targets == 0 {
        return Err(Error::NoTargets);
    }
    if num_decoys == 0 {
        return Err(Error::NoDecoys);
    }
    Ok(())
}

struct PValues {
    p: Vec<f64>,
    parametric: Option<NormalNull>,
    fallback: bool,
}

fn p_values(targets: &[f64], decoys: &[f64], settings: &ErrorSettings) -> PValues {
    if settings.parametric {
        let null = NormalNull {
            mean: mean(decoys),
            std: sample_std(decoys),
        };
        if null.std > 0.0 && null.std.is_finite() && null.mean.is_finite() {
            return PValues {
                p: parametric_p_values(targets, null.mean, null.std),
                parametric: Some(null),
                fallback: false,
            };
        }
        log::warn!(
            "decoy scores have no spread (n = {}, sd = {}): using empirical p-values",
            decoys.len(),
            null.std
        );
    }
    PValues {
        p: empirical_p_values(targets, decoys),
        parametric: None,
        fallback: settings.parametric,
    }
}

/// Provisional q-values for target scores, in input order. Used to select
/// confident targets during learning: no local FDR is estimated.
pub fn q_values(targets: &[f64], decoys: &[f64], settings: &ErrorSettings) -> Result<Vec<f64>, Error> {
    check_labels(targets.len(), decoys.len())?;
    let p = p_values(targets, decoys, settings).p;
    let pi0 = pi0::estimate(
        &p,
        &settings.pi0_lambda,
        settings.pi0_method,
        settings.pi0_smooth_df,
        settings.pi0_smooth_log,
    );
    Ok(storey(&p, pi0.pi0, settings.pfdr))
}

impl ErrorStatistics {
    /// Fit the null model on `decoys` and compute error statistics for every
    /// score in `targets`.
    pub fn fit(targets: &[f64], decoys: &[f64], settings: &ErrorSettings) -> Result<Self, Error> {
        check_labels(targets.len(), decoys.len())?;
        let mut fallbacks = Vec::new();

        let PValues {
            p,
            parametric,
            fallback,
        } = p_values(targets, decoys, settings);
        if fallback {
            fallbacks.push(EstimationFallback::ParametricNull);
        }

        let pi0 = pi0::estimate(
            &p,
            &settings.pi0_lambda,
            settings.pi0_method,
            settings.pi0_smooth_df,
            settings.pi0_smooth_log,
        );
        if pi0.fallback {
            fallbacks.push(EstimationFallback::Pi0Boundary);
        }

        let q = storey(&p, pi0.pi0, settings.pfdr);
        let (local_fdr, lfdr_fallback) = lfdr::local_fdr(&p, pi0.pi0, settings);
        if lfdr_fallback {
            fallbacks.push(EstimationFallback::LfdrDensity);
        }

        let mut rows = metrics(&p, pi0.pi0, settings.pfdr)
            .into_iter()
            .enumerate()
            .map(|(ix, m)| ErrorRow {
                cutoff: targets[ix],
                p_value: p[ix],
                q_value: q[ix],
                local_fdr: local_fdr[ix],
                ..m
            })
            .collect::<Vec<_>>();

        let key = |s: f64| if s.is_nan() { f64::NEG_INFINITY } else { s };
        rows.sort_by(|a, b| {
            key(b.cutoff)
                .total_cmp(&key(a.cutoff))
                .then(a.p_value.total_cmp(&b.p_value))
        });

        log::debug!(
            "- error model: {} targets, {} decoys, pi0 = {:.4}{}",
            targets.len(),
            decoys.len(),
            pi0.pi0,
            if fallbacks.is_empty() { "" } else { " (with fallbacks)" }
        );

        let mut sorted = decoys.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Ok(ErrorStatistics {
            null_model: NullModel {
                pi0,
                parametric,
                num_targets: targets.len(),
                num_decoys: decoys.len(),
                decoys: sorted,
            },
            table: ErrorTable { rows },
            fallbacks,
        })
    }

    pub fn pi0(&self) -> f64 {
        self.null_model.pi0.pi0
    }

    pub fn lookup(&self, score: f64) -> &ErrorRow {
        self.table.lookup(score)
    }

    pub fn summary(&self) -> Vec<(f64, ErrorRow)> {
        self.table.summary()
    }
}

/// Confusion-matrix style statistics at every p-value, treating all p-values
/// at or below it as discoveries. `cutoff`, `q_value` and `local_fdr` are
/// left for the caller to fill in.
fn metrics(p: &[f64], pi0: f64, pfdr: bool) -> Vec<ErrorRow> {
    let total = p.len() as f64;
    let null = pi0 * total;
    let ranks = ascending_ranks(p);

    let mut rows = p
        .iter()
        .zip(&ranks)
        .map(|(&p, &rank)| {
            let positives = rank as f64;
            let fp = null * p;
            let tp = positives - fp;
            let tn = null * (1.0 - p);
            let fn_ = total - positives - tn;

            let fdr = match pfdr {
                true => fp / (positives * (1.0 - (1.0 - p).powf(total))),
                false => fp / positives,
            };
            let negatives = total - positives;
            let fnr = if negatives > 0.0 { fn_ / negatives } else { 0.0 };
            let sensitivity = match total - null {
                d if d > 0.0 => (tp / d).clamp(0.0, 1.0),
                _ => 0.0,
            };

            ErrorRow {
                cutoff: f64::NAN,
                p_value: p,
                q_value: f64::NAN,
                // sensitivity for now, made monotone below
                s_value: sensitivity,
                tp,
                fp,
                tn,
                fn_,
                fpr: fp / null,
                fdr,
                fnr,
                local_fdr: f64::NAN,
            }
        })
        .collect::<Vec<_>>();

    // s-value: running maximum of sensitivity, from the largest p-value down
    let mut order = (0..p.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
    let mut running = 0.0f64;
    for ix in order {
        running = running.max(rows[ix].s_value);
        rows[ix].s_value = running;
    }
    rows
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn separated() -> (Vec<f64>, Vec<f64>) {
        let decoys = (0..500).map(|i| (i as f64 / 500.0) * 4.0 - 2.0).collect::<Vec<_>>();
        // half of the targets look like decoys, half are shifted well above
        let targets = (0..1000)
            .map(|i| match i % 2 {
                0 => (i as f64 / 1000.0) * 4.0 - 2.0,
                _ => 4.0 + (i as f64 / 1000.0),
            })
            .collect::<Vec<_>>();
        (targets, decoys)
    }

    #[test]
    fn labels_required() {
        let settings = ErrorSettings::default();
        assert!(matches!(
            ErrorStatistics::fit(&[], &[1.0], &settings),
            Err(Error::NoTargets)
        ));
        assert!(matches!(
            ErrorStatistics::fit(&[1.0], &[], &settings),
            Err(Error::NoDecoys)
        ));
        assert!(matches!(q_values(&[1.0], &[], &settings), Err(Error::NoDecoys)));
    }

    #[test]
    fn separated_targets() {
        let (targets, decoys) = separated();
        let stats = ErrorStatistics::fit(&targets, &decoys, &ErrorSettings::default()).unwrap();
        assert!((stats.pi0() - 0.5).abs() < 0.1, "pi0 {}", stats.pi0());

        let best = stats.lookup(5.0);
        assert!(best.q_value < 0.01);
        assert!(best.local_fdr < 0.05);
        let worst = stats.lookup(-2.0);
        assert!(worst.q_value > 0.4);
        assert!(worst.s_value >= best.s_value);

        // Row p-values agree with the null model
        assert!(stats.table.rows().iter().all(|row| row.p_value == stats.null_model.p_value(row.cutoff)));

        let rows = stats.table.rows();
        assert_eq!(rows.len(), targets.len());
        assert!(rows.windows(2).all(|w| w[0].cutoff >= w[1].cutoff));
        assert!(rows.windows(2).all(|w| w[0].q_value <= w[1].q_value));

        let summary = stats.summary();
        assert_eq!(summary.len(), SUMMARY_CUTOFFS.len());
    }

    #[test]
    fn parametric_fallback() {
        let settings = ErrorSettings {
            parametric: true,
            ..Default::default()
        };
        let stats = ErrorStatistics::fit(&[1.0, 2.0, 3.0], &[0.5, 0.5], &settings).unwrap();
        assert!(stats.fallbacks.contains(&EstimationFallback::ParametricNull));
        assert!(stats.null_model.parametric.is_none());

        let (targets, decoys) = separated();
        let stats = ErrorStatistics::fit(&targets, &decoys, &settings).unwrap();
        assert!(stats.null_model.parametric.is_some());
        assert!((stats.null_model.p_value(stats.null_model.parametric.unwrap().mean) - 0.5).abs() < 1E-12);
        assert!(!stats.fallbacks.contains(&EstimationFallback::ParametricNull));
    }

    #[test]
    fn nearest_lookup() {
        let table = ErrorTable {
            rows: [3.0, 2.0, 1.0]
                .iter()
                .map(|&cutoff| ErrorRow {
                    cutoff,
                    p_value: 0.0,
                    q_value: cutoff / 10.0,
                    s_value: 0.0,
                    tp: 0.0,
                    fp: 0.0,
                    tn: 0.0,
                    fn_: 0.0,
                    fpr: 0.0,
                    fdr: 0.0,
                    fnr: 0.0,
                    local_fdr: 0.0,
                })
                .collect(),
        };
        assert_eq!(table.lookup(10.0).cutoff, 3.0);
        assert_eq!(table.lookup(2.6).cutoff, 3.0);
        assert_eq!(table.lookup(2.5).cutoff, 2.0);
        assert_eq!(table.lookup(2.0).cutoff, 2.0);
        assert_eq!(table.lookup(1.2).cutoff, 1.0);
        assert_eq!(table.lookup(-5.0).cutoff, 1.0);
        assert_eq!(table.lookup(f64::NAN).cutoff, 1.0);
    }

    #[quickcheck]
    fn pfdr_is_conservative(raw_targets: Vec<i16>, raw_decoys: Vec<i16>) -> bool {
        if raw_targets.is_empty() || raw_decoys.is_empty() {
            return true;
        }
        let targets = raw_targets.iter().map(|&x| x as f64 / 100.0).collect::<Vec<_>>();
        let decoys = raw_decoys.iter().map(|&x| x as f64 / 100.0 - 50.0).collect::<Vec<_>>();
        let fdr = ErrorStatistics::fit(&targets, &decoys, &ErrorSettings::default()).unwrap();
        let pfdr = ErrorStatistics::fit(
            &targets,
            &decoys,
            &ErrorSettings {
                pfdr: true,
                ..Default::default()
            },
        )
        .unwrap();
        fdr.table
            .rows()
            .iter()
            .zip(pfdr.table.rows())
            .all(|(a, b)| b.q_value >= a.q_value - 1E-12)
            && fdr.pi0() > 0.0
            && fdr.pi0() <= 1.0
    }
}
