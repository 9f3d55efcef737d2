//! Descriptive statistics shared by the analyzers.

/// Arithmetic mean; 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// True when every value equals the first up to float rounding.
///
/// Means of values like 0.1 are not exact, so a constant series can leave a
/// residue around 1e-17 in its squared deviations.
fn is_constant(values: &[f64]) -> bool {
    match values.first() {
        Some(&first) => {
            let tolerance = 1e-12 * first.abs().max(1.0);
            values.iter().all(|x| (x - first).abs() <= tolerance)
        }
        None => true,
    }
}

/// Population standard deviation; 0.0 for fewer than two values or a
/// constant series.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 || is_constant(values) {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Bounded consistency score `1 / (1 + std_dev)`, exactly 1.0 at zero spread.
pub fn consistency_score(std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return 1.0;
    }
    1.0 / (1.0 + std_dev)
}

/// Pearson correlation coefficient.
///
/// Returns 0.0 for mismatched lengths, fewer than two points, or when either
/// series has zero variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 || is_constant(xs) || is_constant(ys) {
        return 0.0;
    }
    let mean_x = mean(xs);
    let mean_y = mean(ys);

    let mut numerator = 0.0;
    let mut sum_sq_x = 0.0;
    let mut sum_sq_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        numerator += dx * dy;
        sum_sq_x += dx * dx;
        sum_sq_y += dy * dy;
    }

    let denominator = (sum_sq_x * sum_sq_y).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    (numerator / denominator).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_dev() {
        assert_eq!(std_dev(&[1.0, 1.0, 1.0]), 0.0);
        assert_eq!(std_dev(&[1.0]), 0.0);
        assert_eq!(std_dev(&[]), 0.0);

        let spread = std_dev(&[0.5, 1.0, 1.5]);
        assert!(spread > 0.0 && spread < 1.0);
    }

    #[test]
    fn test_consistency_score_bounds() {
        assert_eq!(consistency_score(0.0), 1.0);

        let mut previous = 1.0;
        for step in 1..50 {
            let score = consistency_score(step as f64 * 0.1);
            assert!(score > 0.0 && score < previous);
            previous = score;
        }
        assert!(consistency_score(2.0) < 0.5);
    }

    #[test]
    fn test_repeat_scores_consistency() {
        let scores = [1.0, 1.0, 0.8];
        assert!((mean(&scores) - 0.9333).abs() < 1e-3);
        let spread = std_dev(&scores);
        assert!((spread - 0.0943).abs() < 1e-3);
        assert!((consistency_score(spread) - 0.9138).abs() < 1e-3);
    }

    #[test]
    fn test_pearson_strong_positive() {
        let a = [0.9, 0.5, 0.2];
        let b = [0.8, 0.6, 0.1];
        let r = pearson(&a, &b);
        assert!(r > 0.95 && r <= 1.0, "r = {}", r);
    }

    #[test]
    fn test_pearson_symmetric_and_bounded() {
        let series = [
            vec![0.1, 0.4, 0.35, 0.8],
            vec![0.9, 0.2, 0.5, 0.3],
            vec![1.0, 1.0, 0.0, 0.5],
        ];
        for a in &series {
            for b in &series {
                let ab = pearson(a, b);
                assert_eq!(ab, pearson(b, a));
                assert!((-1.0..=1.0).contains(&ab));
            }
        }
        assert_eq!(pearson(&[1.0, 2.0], &[2.0, 1.0]), -1.0);
    }

    #[test]
    fn test_pearson_zero_variance() {
        assert_eq!(pearson(&[0.5, 0.5, 0.5], &[0.1, 0.7, 0.9]), 0.0);
        assert_eq!(pearson(&[0.1], &[0.2]), 0.0);
        assert_eq!(pearson(&[0.1, 0.2], &[0.2]), 0.0);
    }

    #[test]
    fn test_constant_inexact_series() {
        assert_eq!(std_dev(&[0.1, 0.1, 0.1]), 0.0);
        assert_eq!(std_dev(&[0.7; 5]), 0.0);

        assert_eq!(pearson(&[0.1, 0.1, 0.1], &[0.1, 0.1, 0.1]), 0.0);
        assert_eq!(pearson(&[0.7, 0.7, 0.7], &[0.2, 0.2, 0.2]), 0.0);
        assert_eq!(pearson(&[0.05, 0.05, 0.05], &[0.3, 0.6, 0.9]), 0.0);

        for i in 1..100 {
            let a = vec![i as f64 / 100.0; 3];
            for j in 1..100 {
                let b = vec![j as f64 / 100.0; 3];
                assert_eq!(pearson(&a, &b), 0.0, "a = {}, b = {}", a[0], b[0]);
            }
            assert_eq!(std_dev(&a), 0.0);
        }
    }
}
