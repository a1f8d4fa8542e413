//! p-values and q-values for target scores, given a sample of decoy scores
//! that models the null distribution.

use super::pnorm_upper;

/// NaN scores, of either sign, rank below every finite score
fn nan_lowest(s: f64) -> f64 {
    if s.is_nan() {
        f64::NEG_INFINITY
    } else {
        s
    }
}

/// Empirical p-values: the fraction of decoy scores strictly greater than
/// each target score, floored at `1 / m0`.
///
/// Returned in the order of `targets`.
pub fn empirical_p_values(targets: &[f64], decoys: &[f64]) -> Vec<f64> {
    let mut null = decoys.iter().copied().map(nan_lowest).collect::<Vec<_>>();
    null.sort_by(|a, b| a.total_cmp(b));
    let m0 = null.len() as f64;
    targets
        .iter()
        .map(|&s| {
            // Number of decoys <= s
            let s = nan_lowest(s);
            let below = null.partition_point(|&d| d <= s);
            ((null.len() - below) as f64 / m0).max(1.0 / m0)
        })
        .collect()
}

/// Parametric p-values under a normal null with the given mean and standard
/// deviation: `1 - Φ((s - μ0) / σ0)`
pub fn parametric_p_values(targets: &[f64], mean: f64, std: f64) -> Vec<f64> {
    targets
        .iter()
        .map(|&s| pnorm_upper((s - mean) / std))
        .collect()
}

/// 1-based ascending rank of every p-value: the number of p-values at or
/// below it, so ties share the largest rank
pub fn ascending_ranks(p_values: &[f64]) -> Vec<usize> {
    let m = p_values.len();
    let mut order = (0..m).collect::<Vec<_>>();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
    let mut ranks = vec![0usize; m];
    let mut i = 0;
    while i < m {
        let mut j = i;
        while j + 1 < m && p_values[order[j + 1]] == p_values[order[i]] {
            j += 1;
        }
        for &ix in &order[i..=j] {
            ranks[ix] = j + 1;
        }
        i = j + 1;
    }
    ranks
}

/// Storey q-values: `q(i) = π0 · min(1, cummin(p·m / rank))` taken over
/// p-values in descending order. With `pfdr`, the denominator is additionally
/// multiplied by `1 - (1 - p)^m`, the probability of at least one rejection.
///
/// Returned in the order of `p_values`.
pub fn q_values(p_values: &[f64], pi0: f64, pfdr: bool) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    let mut order = (0..m).collect::<Vec<_>>();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
    let ranks = ascending_ranks(p_values);

    let mf = m as f64;
    let mut q = vec![0.0; m];
    let mut running = f64::INFINITY;
    for &ix in order.iter().rev() {
        let p = p_values[ix];
        let mut denom = ranks[ix] as f64;
        if pfdr {
            denom *= 1.0 - (1.0 - p).powf(mf);
        }
        let raw = if denom > 0.0 { p * mf / denom } else { 1.0 };
        running = running.min(raw);
        q[ix] = pi0 * running.min(1.0);
    }
    q
}
