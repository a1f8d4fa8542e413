//! Estimation of π0, the proportion of true null hypotheses among target
//! p-values (Storey & Tibshirani, 2003).
//!
//! For every tuning value λ, `π0(λ) = #{p >= λ} / (m · (1 - λ))`. A single
//! estimate is then chosen either by fitting a smoothing spline through
//! `π0(λ)` and taking its value at the largest λ, or by minimizing a
//! bootstrap-style mean squared error.

use super::{quantile, spline};
use crate::settings::{Pi0Lambda, Pi0Method};
use serde::{Deserialize, Serialize};

/// Smoother fits need at least this many valid λ values
const MIN_SMOOTHER_POINTS: usize = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pi0Estimate {
    pub pi0: f64,
    /// λ values with a valid per-λ estimate
    pub lambda: Vec<f64>,
    /// Per-λ estimates, aligned with `lambda`
    pub pi0_lambda: Vec<f64>,
    /// Smoother output aligned with `lambda`, when the smoother was used
    pub smoothed: Option<Vec<f64>>,
    pub method: Pi0Method,
    /// Estimation failed and π0 was set to 1
    pub fallback: bool,
}

impl Pi0Estimate {
    fn fallback(lambda: Vec<f64>, pi0_lambda: Vec<f64>, method: Pi0Method) -> Self {
        Pi0Estimate {
            pi0: 1.0,
            lambda,
            pi0_lambda,
            smoothed: None,
            method,
            fallback: true,
        }
    }
}

/// Estimate π0 from target p-values.
///
/// Never fails: if no valid estimate can be formed (too few λ values for the
/// smoother, an empty or degenerate p-value sample), π0 falls back to 1 and
/// [`Pi0Estimate::fallback`] is set. The result is always within (0, 1].
pub fn estimate(
    p_values: &[f64],
    lambda: &Pi0Lambda,
    method: Pi0Method,
    smooth_df: usize,
    smooth_log: bool,
) -> Pi0Estimate {
    let m = p_values.len() as f64;
    let grid = lambda.grid();

    let mut sorted = p_values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    // W(λ) = #{p >= λ}; λ values with no p-value at or above them carry no
    // information and are dropped
    let mut lambdas = Vec::with_capacity(grid.len());
    let mut counts = Vec::with_capacity(grid.len());
    let mut estimates = Vec::with_capacity(grid.len());
    for &l in &grid {
        let w = sorted.len() - sorted.partition_point(|&p| p < l);
        let pi0 = w as f64 / (m * (1.0 - l));
        if w > 0 && pi0.is_finite() {
            lambdas.push(l);
            counts.push(w as f64);
            estimates.push(pi0);
        }
    }

    if lambdas.is_empty() {
        log::warn!("pi0 estimation failed: no valid lambda values, setting pi0 = 1");
        return Pi0Estimate::fallback(lambdas, estimates, method);
    }

    let (pi0, smoothed) = match lambda {
        Pi0Lambda::Fixed(_) => (estimates[0], None),
        Pi0Lambda::Range { .. } => match method {
            Pi0Method::Smoother => {
                if lambdas.len() < MIN_SMOOTHER_POINTS {
                    log::warn!(
                        "pi0 smoother needs at least {} valid lambda values, found {}: setting pi0 = 1",
                        MIN_SMOOTHER_POINTS,
                        lambdas.len()
                    );
                    return Pi0Estimate::fallback(lambdas, estimates, method);
                }
                let y = match smooth_log {
                    true => estimates.iter().map(|p| p.ln()).collect::<Vec<_>>(),
                    false => estimates.clone(),
                };
                let Some(mut fit) = spline::smooth(&lambdas, &y, smooth_df as f64) else {
                    log::warn!("pi0 smoothing spline could not be fit: setting pi0 = 1");
                    return Pi0Estimate::fallback(lambdas, estimates, method);
                };
                if smooth_log {
                    fit.iter_mut().for_each(|v| *v = v.exp());
                }
                (fit[fit.len() - 1], Some(fit))
            }
            Pi0Method::Bootstrap => {
                let mut ascending = estimates.clone();
                ascending.sort_by(|a, b| a.total_cmp(b));
                let min_pi0 = quantile(&ascending, 0.001);

                let mut best = (f64::INFINITY, estimates[0]);
                for ((&l, &w), &pi0) in lambdas.iter().zip(&counts).zip(&estimates) {
                    let mse = (w / (m.powi(2) * (1.0 - l).powi(2))) * (1.0 - w / m)
                        + (pi0 - min_pi0).powi(2);
                    if mse < best.0 {
                        best = (mse, pi0);
                    }
                }
                (best.1, None)
            }
        },
    };

    if !pi0.is_finite() || pi0 <= 0.0 {
        log::warn!("estimated pi0 ({}) is not in (0, 1]: setting pi0 = 1", pi0);
        return Pi0Estimate {
            smoothed,
            ..Pi0Estimate::fallback(lambdas, estimates, method)
        };
    }

    Pi0Estimate {
        pi0: pi0.min(1.0),
        lambda: lambdas,
        pi0_lambda: estimates,
        smoothed,
        method,
        fallback: false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn range() -> Pi0Lambda {
        Pi0Lambda::from_triple(0.1, 0.5, 0.05)
    }

    /// 60% uniform nulls, 40% p-values concentrated near zero
    fn mixture(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| match i % 5 {
                0 | 1 => (i as f64 / n as f64) * 1E-3,
                _ => ((i * 7919) % n) as f64 / n as f64,
            })
            .collect()
    }

    #[test]
    fn bootstrap_recovers_null_fraction() {
        let p = mixture(5000);
        let est = estimate(&p, &range(), Pi0Method::Bootstrap, 3, false);
        assert!(!est.fallback);
        assert!((est.pi0 - 0.6).abs() < 0.05, "{}", est.pi0);
    }

    #[test]
    fn smoother_recovers_null_fraction() {
        let p = mixture(5000);
        let est = estimate(&p, &range(), Pi0Method::Smoother, 3, false);
        assert!(!est.fallback);
        assert!(est.smoothed.is_some());
        assert!((est.pi0 - 0.6).abs() < 0.05, "{}", est.pi0);

        let log = estimate(&p, &range(), Pi0Method::Smoother, 3, true);
        assert!((log.pi0 - 0.6).abs() < 0.05, "{}", log.pi0);
    }

    #[test]
    fn fixed_lambda() {
        let p = (0..100).map(|i| i as f64 / 100.0).collect::<Vec<_>>();
        let est = estimate(&p, &Pi0Lambda::Fixed(0.5), Pi0Method::Smoother, 3, false);
        assert!((est.pi0 - 1.0).abs() < 1E-12);
        assert!(!est.fallback);
    }

    #[test]
    fn smoother_needs_enough_lambdas() {
        // Only lambda values below 0.2 see any p-values
        let p = vec![0.15; 10];
        let est = estimate(&p, &range(), Pi0Method::Smoother, 3, false);
        assert!(est.fallback);
        assert_eq!(est.pi0, 1.0);

        let est = estimate(&[], &range(), Pi0Method::Bootstrap, 3, false);
        assert!(est.fallback);
        assert_eq!(est.pi0, 1.0);
    }

    #[quickcheck]
    fn pi0_in_unit_interval(raw: Vec<u16>, smoother: bool) -> bool {
        let p = raw.iter().map(|&x| x as f64 / 65535.0).collect::<Vec<_>>();
        let method = match smoother {
            true => Pi0Method::Smoother,
            false => Pi0Method::Bootstrap,
        };
        let est = estimate(&p, &range(), method, 3, false);
        est.pi0 > 0.0 && est.pi0 <= 1.0 && (!est.fallback || est.pi0 == 1.0)
    }
}
