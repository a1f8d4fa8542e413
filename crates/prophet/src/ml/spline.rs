//! Cubic smoothing spline with the amount of smoothing set by equivalent
//! degrees of freedom (the trace of the smoother matrix).
//!
//! Follows the Reinsch formulation: for sorted, distinct knots `x` the fitted
//! values are `S(λ)·y` with `S(λ) = (I + λ·Q·R⁻¹·Qᵀ)⁻¹`, where `Q` holds second
//! divided differences and `R` is the tridiagonal Gram matrix of the
//! natural cubic spline basis. `λ` is found by bisection on `log λ` so that
//! `tr S(λ)` matches the requested degrees of freedom.

use super::gauss::Gauss;
use super::matrix::Matrix;

/// Penalty matrix `K = Q·R⁻¹·Qᵀ`
fn penalty(x: &[f64]) -> Option<Matrix> {
    let n = x.len();
    let h = x.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
    if h.iter().any(|&h| !(h > 0.0)) {
        return None;
    }

    let mut q = Matrix::zeros(n, n - 2);
    let mut r = Matrix::zeros(n - 2, n - 2);
    for j in 0..n - 2 {
        q[(j, j)] = 1.0 / h[j];
        q[(j + 1, j)] = -1.0 / h[j] - 1.0 / h[j + 1];
        q[(j + 2, j)] = 1.0 / h[j + 1];

        r[(j, j)] = (h[j] + h[j + 1]) / 3.0;
        if j + 1 < n - 2 {
            r[(j, j + 1)] = h[j + 1] / 6.0;
            r[(j + 1, j)] = h[j + 1] / 6.0;
        }
    }

    let r_inv_qt = Gauss::solve(r, q.transpose())?;
    Some(q.dot(&r_inv_qt))
}

fn smoother(k: &Matrix, lambda: f64) -> Option<Matrix> {
    let mut a = k.clone();
    a.scale(lambda);
    a.add_diagonal(1.0);
    Gauss::invert(a)
}

/// Ordinary least squares line through `(x, y)`, evaluated at `x`
fn linear_fit(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxy = x.iter().zip(y).fold(0.0, |acc, (a, b)| acc + (a - mx) * (b - my));
    let sxx = x.iter().fold(0.0, |acc, a| acc + (a - mx).powi(2));
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    x.iter().map(|a| my + slope * (a - mx)).collect()
}

/// Fit a smoothing spline to `(x, y)` with `df` equivalent degrees of
/// freedom, returning fitted values at `x`.
///
/// `x` must be strictly increasing. `df >= n` interpolates, `df <= 2`
/// reduces to a least squares line. Returns `None` for fewer than three
/// points or a degenerate system.
pub fn smooth(x: &[f64], y: &[f64], df: f64) -> Option<Vec<f64>> {
    assert_eq!(x.len(), y.len());
    let n = x.len();
    if n < 3 {
        return None;
    }
    if df >= n as f64 {
        return Some(y.to_vec());
    }
    if df <= 2.0 {
        return Some(linear_fit(x, y));
    }

    let k = penalty(x)?;
    // Scale λ to the penalty so that the search bracket is data independent
    let scale = (k.trace() / n as f64).max(f64::MIN_POSITIVE);

    let (mut lo, mut hi) = (-20.0f64, 20.0f64);
    let mut s = None;
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        // Numerically singular systems only occur for very large λ
        let Some(candidate) = smoother(&k, mid.exp() / scale) else {
            hi = mid;
            continue;
        };
        // tr S decreases monotonically in λ
        if candidate.trace() > df {
            lo = mid;
        } else {
            hi = mid;
        }
        s = Some(candidate);
        if hi - lo < 1E-8 {
            break;
        }
    }

    let fitted = s?.dotv(y);
    fitted.iter().all(|v| v.is_finite()).then_some(fitted)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ml::all_close;

    #[test]
    fn linear_data_is_preserved() {
        let x = [0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45];
        let y = x.iter().map(|x| 2.0 * x + 1.0).collect::<Vec<_>>();
        let fit = smooth(&x, &y, 3.0).unwrap();
        assert!(all_close(&fit, &y, 1E-8), "{:?}", fit);
    }

    #[test]
    fn degrees_of_freedom() {
        let x = (0..10).map(|i| i as f64).collect::<Vec<_>>();
        let y = x.iter().map(|x| (x * 0.7).sin()).collect::<Vec<_>>();
        assert_eq!(smooth(&x, &y, 10.0).unwrap(), y);

        // Fewer degrees of freedom: smoother fit, larger residuals
        let rss = |df: f64| {
            smooth(&x, &y, df)
                .unwrap()
                .iter()
                .zip(&y)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
        };
        assert!(rss(3.0) > rss(6.0));
        assert!(rss(2.0) >= rss(3.0) - 1E-9);
    }

    #[test]
    fn too_few_points() {
        assert!(smooth(&[0.0, 1.0], &[1.0, 2.0], 1.5).is_none());
        assert!(smooth(&[0.0, 0.0, 1.0], &[1.0, 2.0, 3.0], 2.5).is_none());
    }
}
