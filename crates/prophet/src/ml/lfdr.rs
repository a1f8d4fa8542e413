//! Local false discovery rate (Efron's two-group model) from p-values.
//!
//! p-values are mapped to the real line (probit or logit). There, the null
//! density of the transformed values is known exactly, and the mixture
//! density is estimated from the data, so that
//! `lfdr(p) = π0 · f0(x) / f(x)`.

use super::gmm::Gmm;
use super::kde::{Grid, Kde};
use super::{dnorm, qnorm};
use crate::settings::{DensityEstimator, ErrorSettings, LfdrTransform};

fn transform(p: f64, how: LfdrTransform, eps: f64) -> f64 {
    match how {
        LfdrTransform::Probit => qnorm(p),
        LfdrTransform::Logit => ((p + eps) / (1.0 - p + eps)).ln(),
    }
}

/// Density of transformed p-values under the null (uniform p)
fn null_density(x: f64, how: LfdrTransform) -> f64 {
    match how {
        LfdrTransform::Probit => dnorm(x),
        LfdrTransform::Logit => {
            let e = x.exp();
            e / (1.0 + e).powi(2)
        }
    }
}

fn mixture_density(x: &[f64], settings: &ErrorSettings) -> Option<Grid> {
    let (min, max) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !(min.is_finite() && max.is_finite()) {
        return None;
    }

    match settings.density_estimator {
        DensityEstimator::Kde => {
            let kde = Kde::new(x, settings.lfdr_adj)?;
            // Extend the grid so that the outermost points are not evaluated
            // at a clamped edge
            let pad = kde.bandwidth;
            Some(Grid::fit(
                |v| kde.pdf(v),
                min - pad,
                max + pad,
                settings.grid_size,
            ))
        }
        DensityEstimator::Gmm => {
            let gmm = Gmm::fit(x)?;
            Some(Grid::fit(|v| gmm.pdf(v), min, max, settings.grid_size))
        }
    }
}

/// Make `lfdr` non-decreasing in p. Tied p-values all take the value at
/// the first of the tied positions.
fn monotone(p: &[f64], lfdr: &mut [f64]) {
    let mut order = (0..p.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| p[a].total_cmp(&p[b]).then(a.cmp(&b)));

    let mut running = f64::NEG_INFINITY;
    let mut prev: Option<(f64, f64)> = None;
    for &ix in &order {
        running = running.max(lfdr[ix]);
        match prev {
            Some((p_prev, value)) if p_prev == p[ix] => lfdr[ix] = value,
            _ => {
                lfdr[ix] = running;
                prev = Some((p[ix], running));
            }
        }
    }
}

/// Estimate local FDR for every p-value, in input order.
///
/// p-values outside `[eps, 1 - eps]` are excluded from the density fit and
/// receive the estimate of the nearest included p-value. If the density
/// cannot be estimated every value is set to 1, and the returned flag is
/// `true`.
pub fn local_fdr(p_values: &[f64], pi0: f64, settings: &ErrorSettings) -> (Vec<f64>, bool) {
    let eps = settings.lfdr_eps;
    let how = settings.lfdr_transform;

    let mut valid = p_values
        .iter()
        .enumerate()
        .filter(|(_, &p)| p >= eps && p <= 1.0 - eps)
        .map(|(ix, _)| ix)
        .collect::<Vec<_>>();
    valid.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]).then(a.cmp(&b)));

    let x = valid
        .iter()
        .map(|&ix| transform(p_values[ix], how, eps))
        .collect::<Vec<_>>();

    let density = match x.len() {
        0 | 1 => None,
        _ => mixture_density(&x, settings),
    };
    let Some(density) = density else {
        log::warn!(
            "local FDR density could not be estimated from {} p-values: setting lfdr = 1",
            x.len()
        );
        return (vec![1.0; p_values.len()], true);
    };

    let fitted = x
        .iter()
        .map(|&x| {
            let lfdr = pi0 * null_density(x, how) / density.interpolate(x);
            if lfdr.is_nan() {
                1.0
            } else {
                lfdr
            }
        })
        .collect::<Vec<_>>();

    let mut lfdr = vec![0.0; p_values.len()];
    for (&ix, &value) in valid.iter().zip(&fitted) {
        lfdr[ix] = value;
    }
    // Boundary p-values borrow the estimate of the nearest fitted p-value
    let (lowest, highest) = (fitted[0], fitted[fitted.len() - 1]);
    for (ix, &p) in p_values.iter().enumerate() {
        if p < eps {
            lfdr[ix] = lowest;
        } else if !(p <= 1.0 - eps) {
            lfdr[ix] = highest;
        }
    }

    if settings.lfdr_truncate {
        lfdr.iter_mut().for_each(|v| *v = v.min(1.0));
    }
    if settings.lfdr_monotone {
        monotone(p_values, &mut lfdr);
    }
    (lfdr, false)
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn p_values() -> Vec<f64> {
        // 70% uniform nulls, 30% signal near zero
        (0..2000)
            .map(|i| match i % 10 {
                0..=2 => 1E-4 * (i as f64 + 1.0) / 2000.0,
                _ => ((i * 7919) % 2000) as f64 / 2000.0 + 1E-4,
            })
            .collect()
    }

    #[test]
    fn signal_has_low_lfdr() {
        let p = p_values();
        for estimator in [DensityEstimator::Kde, DensityEstimator::Gmm] {
            for transform in [LfdrTransform::Probit, LfdrTransform::Logit] {
                let settings = ErrorSettings {
                    density_estimator: estimator,
                    lfdr_transform: transform,
                    ..Default::default()
                };
                let (lfdr, fallback) = local_fdr(&p, 0.7, &settings);
                assert!(!fallback);
                let signal = lfdr[0];
                let null = lfdr[5];
                assert!(signal < 0.2, "{:?} {:?}: {}", estimator, transform, signal);
                assert!(null > signal);
            }
        }
    }

    #[test]
    fn boundary_values_borrow_nearest() {
        let mut p = p_values();
        p.push(0.0);
        p.push(1.0);
        let settings = ErrorSettings {
            lfdr_monotone: false,
            ..Default::default()
        };
        let (lfdr, _) = local_fdr(&p, 0.7, &settings);

        let nearest = |target: f64| {
            (0..p.len() - 2)
                .min_by(|&a, &b| (p[a] - target).abs().total_cmp(&(p[b] - target).abs()))
                .unwrap()
        };
        assert_eq!(lfdr[p.len() - 2], lfdr[nearest(0.0)]);
        assert_eq!(lfdr[p.len() - 1], lfdr[nearest(1.0)]);
    }

    #[test]
    fn degenerate_input_falls_back() {
        let (lfdr, fallback) = local_fdr(&[0.0, 1.0], 0.5, &ErrorSettings::default());
        assert!(fallback);
        assert_eq!(lfdr, vec![1.0, 1.0]);
    }

    #[quickcheck]
    fn monotone_and_truncated(raw: Vec<u16>) -> bool {
        let p = raw.iter().map(|&x| x as f64 / 65535.0).collect::<Vec<_>>();
        let (lfdr, _) = local_fdr(&p, 0.9, &ErrorSettings::default());
        let mut order = (0..p.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));
        lfdr.iter().all(|&v| v <= 1.0 && v >= 0.0)
            && order.windows(2).all(|w| lfdr[w[0]] <= lfdr[w[1]])
    }
}
