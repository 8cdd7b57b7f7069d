//! Age decay and recency boost for CIAR scoring
//!
//! Significance fades with age and recovers with use:
//!
//! ```text
//! age_decay(t)     = e^(-λt)                       t in days, λ = ln 2 / half-life
//! recency_boost(n) = min(1 + α·n, max_boost)       n = access count
//! ```
//!
//! Both factors are pure functions so the scorer, the benches and the
//! property tests can share them.

use std::f64::consts::LN_2;

/// Decay rate for a given half-life in days
///
/// Returns 0.0 for a non-positive half-life (no decay).
#[inline]
pub fn lambda_for_half_life(half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 || !half_life_days.is_finite() {
        return 0.0;
    }
    LN_2 / half_life_days
}

/// Exponential age decay factor in (0, 1]
///
/// Ages at or below zero (clock skew, future timestamps) do not decay.
#[inline]
pub fn age_decay(age_days: f64, lambda: f64) -> f32 {
    if age_days <= 0.0 || lambda <= 0.0 {
        return 1.0;
    }
    ((-lambda * age_days).exp() as f32).clamp(0.0, 1.0)
}

/// Age in fractional days between two instants
#[inline]
pub fn age_in_days(
    observed_at: chrono::DateTime<chrono::Utc>,
    now: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (now - observed_at).num_milliseconds() as f64 / 86_400_000.0
}

/// Recency boost multiplier, monotonically non-decreasing in `access_count`
#[inline]
pub fn recency_boost(access_count: u32, alpha: f32, max_boost: f32) -> f32 {
    let boost = 1.0 + alpha.max(0.0) * access_count as f32;
    boost.min(max_boost.max(1.0))
}

/// Retention table for the config log
pub fn retention_curve_debug(half_life_days: f64) -> String {
    let lambda = lambda_for_half_life(half_life_days);
    let days = [0.5, 1.0, 3.0, 7.0, 14.0, 30.0, 90.0];

    let mut output = format!("Age decay (half-life {half_life_days}d):\n");
    for d in days {
        output.push_str(&format!(
            "  Day {:>5.1}: {:>6.2}%\n",
            d,
            age_decay(d, lambda) * 100.0
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_decay_at_zero() {
        let lambda = lambda_for_half_life(30.0);
        assert_eq!(age_decay(0.0, lambda), 1.0);
        assert_eq!(age_decay(-2.0, lambda), 1.0);
    }

    #[test]
    fn test_half_life() {
        let lambda = lambda_for_half_life(30.0);
        assert!((age_decay(30.0, lambda) - 0.5).abs() < 1e-4);
        assert!((age_decay(60.0, lambda) - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_decay_is_monotonic() {
        let lambda = lambda_for_half_life(7.0);
        let mut previous = 1.0;
        for day in 1..120 {
            let factor = age_decay(day as f64, lambda);
            assert!(factor <= previous);
            previous = factor;
        }
    }

    #[test]
    fn test_recency_boost_capped() {
        assert_eq!(recency_boost(0, 0.1, 2.0), 1.0);
        assert!((recency_boost(5, 0.1, 2.0) - 1.5).abs() < 1e-6);
        assert_eq!(recency_boost(50, 0.1, 2.0), 2.0);
    }

    #[test]
    fn test_recency_boost_never_decreases() {
        let mut previous = 0.0;
        for n in 0..100 {
            let boost = recency_boost(n, 0.07, 1.8);
            assert!(boost >= previous);
            previous = boost;
        }
    }
}
