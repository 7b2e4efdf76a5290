//! Descriptive statistics over grade samples.
//!
//! Quartiles are positional (`sorted[n / 4]`, `sorted[3n / 4]`), not
//! interpolated; dashboards built on the previous implementation rely on
//! these exact values.

use crate::models::DescriptiveStats;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median of an already sorted slice.
fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

pub fn median(values: &[f64]) -> f64 {
    median_sorted(&sorted(values))
}

/// Sample standard deviation, 0 for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}

/// Fraction of `values` matching `predicate`; 0 for an empty slice.
pub fn ratio(values: &[f64], predicate: impl Fn(f64) -> bool) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|v| predicate(**v)).count() as f64 / values.len() as f64
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Full summary of a sample, rounded to two decimals. Empty input gives an
/// all-zero summary.
pub fn describe(values: &[f64]) -> DescriptiveStats {
    if values.is_empty() {
        return DescriptiveStats::default();
    }
    let sorted = sorted(values);
    let n = sorted.len();
    DescriptiveStats {
        count: n,
        mean: round2(mean(&sorted)),
        median: round2(median_sorted(&sorted)),
        std_dev: round2(std_dev(&sorted)),
        q1: round2(sorted[n / 4]),
        q3: round2(sorted[3 * n / 4]),
        min: round2(sorted[0]),
        max: round2(sorted[n - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_is_all_zero() {
        assert_eq!(describe(&[]), DescriptiveStats::default());
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(ratio(&[], |_| true), 0.0);
    }

    #[test]
    fn single_value_has_no_spread() {
        let stats = describe(&[12.0]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.q1, 12.0);
        assert_eq!(stats.q3, 12.0);
    }

    #[test]
    fn quartiles_are_positional() {
        // n = 6: q1 = sorted[1], q3 = sorted[4]
        let stats = describe(&[15.0, 2.0, 9.0, 4.0, 11.0, 7.0]);
        assert_eq!(stats.q1, 4.0);
        assert_eq!(stats.q3, 11.0);
        assert_eq!(stats.median, 8.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 15.0);
    }

    #[test]
    fn sample_standard_deviation() {
        // mean 5, squared deviations sum 32, n - 1 = 7
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&values) - (32.0_f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn order_does_not_matter() {
        let a = describe(&[6.0, 11.0, 15.0, 8.5, 13.25]);
        let b = describe(&[13.25, 15.0, 6.0, 11.0, 8.5]);
        assert_eq!(a, b);
    }
}
