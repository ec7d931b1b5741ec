//! Numerically stable primitives for log-domain message passing.

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Below this the Stirling series is not used directly.
const STIRLING_MIN: f64 = 10.0;

/// `1/12, −1/360, 1/1260, −1/1680`
const STIRLING_COEFFS: [f64; 4] = [1.0 / 12.0, -1.0 / 360.0, 1.0 / 1260.0, -1.0 / 1680.0];

/// Stable log(sum(exp(values))).
///
/// Returns NEG_INFINITY for empty input or all -inf inputs.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for v in values {
        sum += (*v - max).exp();
    }
    max + sum.ln()
}

/// Shift `values` in place so that they form a log-distribution.
///
/// Returns the subtracted normalizer. When every entry is -inf the slice is
/// left untouched and -inf is returned; callers decide whether that is an
/// error.
pub fn log_normalize(values: &mut [f64]) -> f64 {
    let norm = log_sum_exp(values);
    if norm.is_finite() {
        for v in values.iter_mut() {
            *v -= norm;
        }
    }
    norm
}

/// Normalized probabilities from unnormalized log weights.
///
/// Computed as `exp(v - logsumexp(v))`, so no raw probabilities are summed.
pub fn softmax(values: &[f64]) -> Vec<f64> {
    let norm = log_sum_exp(values);
    if !norm.is_finite() {
        return vec![f64::NAN; values.len()];
    }
    values.iter().map(|v| (v - norm).exp()).collect()
}

/// Index of the largest entry, lowest index on ties. `None` for empty input.
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// `ln Γ(z)` for `z > 0`; NaN elsewhere.
///
/// Shifts `z` up to at least [`STIRLING_MIN`] with the recurrence
/// `Γ(z + 1) = z Γ(z)` and evaluates the Stirling series there.
pub fn log_gamma(z: f64) -> f64 {
    if z.is_nan() || z <= 0.0 {
        return f64::NAN;
    }
    if z == f64::INFINITY {
        return f64::INFINITY;
    }
    let mut x = z;
    let mut shift = 0.0;
    while x < STIRLING_MIN {
        shift += x.ln();
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let series = inv
        * (STIRLING_COEFFS[0]
            + inv2 * (STIRLING_COEFFS[1] + inv2 * (STIRLING_COEFFS[2] + inv2 * STIRLING_COEFFS[3])));
    (x - 0.5) * x.ln() - x + LN_SQRT_2PI + series - shift
}

/// log(y!) for a non-negative count stored as a float.
pub fn log_factorial(y: f64) -> f64 {
    if y <= 1.0 {
        return 0.0;
    }
    log_gamma(y + 1.0)
}
