//! Gaussian kernel density estimation.
//!
//! The density is evaluated exactly on an evenly spaced grid and linearly
//! interpolated in between, which keeps evaluation cheap for large samples.

use super::{quantile, sample_std};
use rayon::prelude::*;

/// Silverman's rule-of-thumb bandwidth (R's `bw.nrd0`):
/// `0.9 · min(sd, IQR / 1.34) · n^(-1/5)`, with fallbacks for samples with
/// no spread.
pub fn bw_nrd0(sample: &[f64]) -> f64 {
    if sample.len() < 2 {
        return 1.0;
    }
    let mut sorted = sample.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let hi = sample_std(sample);
    let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
    let mut lo = hi.min(iqr / 1.34);
    if !(lo > 0.0) {
        lo = if hi > 0.0 {
            hi
        } else if sorted[0] != 0.0 {
            sorted[0].abs()
        } else {
            1.0
        };
    }
    0.9 * lo * (sample.len() as f64).powf(-0.2)
}

pub struct Kde<'a> {
    sample: &'a [f64],
    pub bandwidth: f64,
    constant: f64,
}

impl<'a> Kde<'a> {
    /// Bandwidth is `adjust · bw_nrd0(sample)`. Returns `None` for an empty
    /// sample or a non-positive bandwidth.
    pub fn new(sample: &'a [f64], adjust: f64) -> Option<Self> {
        if sample.is_empty() {
            return None;
        }
        let bandwidth = adjust * bw_nrd0(sample);
        if !(bandwidth > 0.0) || !bandwidth.is_finite() {
            return None;
        }
        let constant = (2.0 * std::f64::consts::PI).sqrt() * bandwidth * sample.len() as f64;
        Some(Self {
            sample,
            bandwidth,
            constant,
        })
    }

    fn kernel(&self, x: f64) -> f64 {
        (-0.5 * x.powi(2)).exp()
    }

    pub fn pdf(&self, x: f64) -> f64 {
        let h = self.bandwidth;
        let sum = self
            .sample
            .iter()
            .fold(0.0, |acc, xi| acc + self.kernel((x - xi) / h));
        sum / self.constant
    }
}

/// Density values on an evenly spaced grid spanning `[min, max]`
pub struct Grid {
    bins: Vec<f64>,
    min: f64,
    step: f64,
}

impl Grid {
    /// Evaluate `density` on `size` evenly spaced points, in parallel. Every
    /// point is computed independently, so the result does not depend on the
    /// thread count.
    pub fn fit<F>(density: F, min: f64, max: f64, size: usize) -> Grid
    where
        F: Fn(f64) -> f64 + Sync,
    {
        let size = size.max(2);
        let step = (max - min) / (size - 1) as f64;
        let bins = (0..size)
            .into_par_iter()
            .map(|bin| density(bin as f64 * step + min))
            .collect::<Vec<_>>();
        Grid { bins, min, step }
    }

    /// Linearly interpolated density at `x`, clamped to the grid ends
    pub fn interpolate(&self, x: f64) -> f64 {
        if !(self.step > 0.0) {
            return self.bins[0];
        }
        let last = self.bins.len() - 1;
        let pos = ((x - self.min) / self.step).clamp(0.0, last as f64);
        let bin_lo = (pos.floor() as usize).min(last);
        let bin_hi = (bin_lo + 1).min(last);

        // Linear interpolation between lower and upper bin
        let lower = self.bins[bin_lo];
        let upper = self.bins[bin_hi];
        lower + (upper - lower) * (pos - bin_lo as f64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::dnorm;

    #[test]
    fn bandwidth() {
        // R: bw.nrd0(c(1, 2, 3, 4, 5)) == 0.9 * min(1.5811, 2/1.34) * 5^-0.2
        let bw = bw_nrd0(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let expected = 0.9 * (2.0f64 / 1.34) * 5f64.powf(-0.2);
        assert!((bw - expected).abs() < 1E-12);

        assert!(bw_nrd0(&[3.0, 3.0, 3.0]) > 0.0);
        assert!(bw_nrd0(&[0.0, 0.0]) > 0.0);
    }

    #[test]
    fn density_integrates() {
        let sample = (0..200).map(|i| (i as f64 - 100.0) / 40.0).collect::<Vec<_>>();
        let kde = Kde::new(&sample, 1.0).unwrap();
        let step = 0.01;
        let total = (-1000..1000)
            .map(|i| kde.pdf(i as f64 * step) * step)
            .sum::<f64>();
        assert!((total - 1.0).abs() < 1E-3, "{}", total);
    }

    #[test]
    fn grid_interpolation() {
        let grid = Grid::fit(dnorm, -4.0, 4.0, 801);
        for x in [-3.3, -1.005, 0.0, 0.42, 2.5] {
            assert!((grid.interpolate(x) - dnorm(x)).abs() < 1E-4);
        }
        // Clamped outside of the grid
        assert!((grid.interpolate(-10.0) - dnorm(-4.0)).abs() < 1E-12);
        assert!((grid.interpolate(10.0) - dnorm(4.0)).abs() < 1E-12);
    }
}
