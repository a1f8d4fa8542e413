//! One-dimensional Gaussian mixture model fit by expectation-maximization.
//! The number of components (1 to 3) is chosen by BIC.

use super::{dnorm, mean, quantile, std};

const MAX_COMPONENTS: usize = 3;
const MAX_ITER: usize = 200;
const TOLERANCE: f64 = 1E-8;
/// Variance floor, guards against components collapsing onto single points
const MIN_VARIANCE: f64 = 1E-6;

#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub weight: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Gmm {
    pub components: Vec<Component>,
    pub log_likelihood: f64,
}

impl Gmm {
    pub fn pdf(&self, x: f64) -> f64 {
        self.components
            .iter()
            .fold(0.0, |acc, c| acc + c.weight * dnorm((x - c.mean) / c.std) / c.std)
    }

    /// Bayesian information criterion; each component has a weight, mean and
    /// variance, minus one redundant weight
    pub fn bic(&self, n: usize) -> f64 {
        let k = (3 * self.components.len() - 1) as f64;
        k * (n as f64).ln() - 2.0 * self.log_likelihood
    }

    /// Fit a mixture with exactly `k` components. Means are initialized at
    /// evenly spaced quantiles, so the fit is deterministic.
    pub fn fit_k(sample: &[f64], k: usize) -> Option<Gmm> {
        let n = sample.len();
        if n < 2 * k || k == 0 {
            return None;
        }
        let mut sorted = sample.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let spread = std(sample).max(MIN_VARIANCE.sqrt());

        let mut components = (0..k)
            .map(|j| Component {
                weight: 1.0 / k as f64,
                mean: quantile(&sorted, (j as f64 + 0.5) / k as f64),
                std: spread / k as f64,
            })
            .collect::<Vec<_>>();

        let mut resp = vec![0.0; n * k];
        let mut last = f64::NEG_INFINITY;
        let mut log_likelihood = f64::NEG_INFINITY;
        for _ in 0..MAX_ITER {
            // E-step
            log_likelihood = 0.0;
            for (i, &x) in sample.iter().enumerate() {
                let r = &mut resp[i * k..(i + 1) * k];
                let mut total = 0.0;
                for (j, c) in components.iter().enumerate() {
                    r[j] = c.weight * dnorm((x - c.mean) / c.std) / c.std;
                    total += r[j];
                }
                if !(total > 0.0) {
                    // Point far from every component: assign to the nearest
                    let nearest = components
                        .iter()
                        .enumerate()
                        .min_by(|a, b| {
                            (x - a.1.mean).abs().total_cmp(&(x - b.1.mean).abs())
                        })
                        .map(|(j, _)| j)
                        .unwrap_or(0);
                    r.iter_mut().for_each(|v| *v = 0.0);
                    r[nearest] = 1.0;
                    log_likelihood += f64::MIN_POSITIVE.ln();
                    continue;
                }
                r.iter_mut().for_each(|v| *v /= total);
                log_likelihood += total.ln();
            }

            // M-step
            for (j, c) in components.iter_mut().enumerate() {
                let nj = (0..n).map(|i| resp[i * k + j]).sum::<f64>();
                if nj <= f64::EPSILON {
                    return None;
                }
                let mu = (0..n).map(|i| resp[i * k + j] * sample[i]).sum::<f64>() / nj;
                let var = (0..n)
                    .map(|i| resp[i * k + j] * (sample[i] - mu).powi(2))
                    .sum::<f64>()
                    / nj;
                c.weight = nj / n as f64;
                c.mean = mu;
                c.std = var.max(MIN_VARIANCE).sqrt();
            }

            if (log_likelihood - last).abs() < TOLERANCE * log_likelihood.abs().max(1.0) {
                break;
            }
            last = log_likelihood;
        }

        log_likelihood
            .is_finite()
            .then_some(Gmm {
                components,
                log_likelihood,
            })
    }

    /// Fit mixtures with 1 to 3 components, keeping the lowest BIC
    pub fn fit(sample: &[f64]) -> Option<Gmm> {
        if sample.len() < 2 {
            return None;
        }
        let best = (1..=MAX_COMPONENTS)
            .filter_map(|k| Gmm::fit_k(sample, k))
            .min_by(|a, b| a.bic(sample.len()).total_cmp(&b.bic(sample.len())))?;
        log::trace!(
            "- gaussian mixture: {} component(s), mean = {:.3}",
            best.components.len(),
            mean(sample)
        );
        Some(best)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bimodal() -> Vec<f64> {
        (0..400)
            .map(|i| {
                let jitter = ((i * 37) % 100) as f64 / 100.0 - 0.5;
                if i % 2 == 0 {
                    -4.0 + jitter
                } else {
                    4.0 + jitter
                }
            })
            .collect()
    }

    #[test]
    fn selects_two_components() {
        let gmm = Gmm::fit(&bimodal()).unwrap();
        assert!(gmm.components.len() >= 2);
        let total = gmm.components.iter().map(|c| c.weight).sum::<f64>();
        assert!((total - 1.0).abs() < 1E-9);
        // Density is high at the modes and low in between
        assert!(gmm.pdf(4.0) > 10.0 * gmm.pdf(0.0));
    }

    #[test]
    fn too_small() {
        assert!(Gmm::fit(&[1.0]).is_none());
        assert!(Gmm::fit_k(&[1.0, 2.0, 3.0], 2).is_none());
    }
}
