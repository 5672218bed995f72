/// Smallest sample size for which a percentile is defined.
const MIN_SAMPLES: usize = 2;

/// Linear-interpolated percentile over an ascending sample.
///
/// Returns NaN when `p` is outside `[0, 100]` or when fewer than two samples
/// are given. The caller is responsible for sorting; the slice is never
/// modified.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if !(0.0..=100.0).contains(&p) {
        return f64::NAN;
    }

    let n = sorted.len();
    if n < MIN_SAMPLES {
        return f64::NAN;
    }

    // 1-based rank, then split into whole and fractional parts.
    let rank = (p / 100.0) * (n - 1) as f64 + 1.0;
    let whole = rank.floor();
    let frac = rank - whole;
    let i = whole as usize - 1;

    // p == 100 lands exactly on the last sample.
    if i + 1 >= n {
        return sorted[n - 1];
    }

    sorted[i] + frac * (sorted[i + 1] - sorted[i])
}
