// Pipeline de traitement numérique appliqué à chaque série de tag.
// Ordre fixe : suppression des valeurs aberrantes, rééchantillonnage, lissage, réduction.
// Toutes les fonctions sont pures et ne touchent à aucun état partagé.
use crate::error::{AppError, AppResult};
use crate::models::{
    DataPoint, ProcessingConfig, OUTLIER_METHOD_3SIGMA, RESAMPLE_METHOD_MEAN,
    SMOOTHING_METHOD_MOVING_AVG,
};
use std::collections::BTreeMap;

/// Point cap applied to every series after the configurable stages.
pub const DEFAULT_MAX_POINTS: usize = 5000;

const SIGMA_FACTOR: f64 = 3.0;

// Borne le nombre de passes de la suppression itérative des valeurs aberrantes.
const MAX_CLIP_ROUNDS: usize = 64;

/// Rejects unknown methods and degenerate parameters of enabled stages.
pub fn validate_config(config: &ProcessingConfig) -> AppResult<()> {
    let outlier = &config.outlier_removal;
    if outlier.enabled && outlier.method != OUTLIER_METHOD_3SIGMA {
        return Err(AppError::Config(format!(
            "unsupported outlier removal method '{}', expected '{}'",
            outlier.method, OUTLIER_METHOD_3SIGMA
        )));
    }

    let resample = &config.resample;
    if resample.enabled {
        if resample.method != RESAMPLE_METHOD_MEAN {
            return Err(AppError::Config(format!(
                "unsupported resample method '{}', expected '{}'",
                resample.method, RESAMPLE_METHOD_MEAN
            )));
        }
        if resample.interval_seconds == 0 {
            return Err(AppError::Config(
                "resample interval must be at least 1 second".to_string(),
            ));
        }
    }

    let smoothing = &config.smoothing;
    if smoothing.enabled {
        if smoothing.method != SMOOTHING_METHOD_MOVING_AVG {
            return Err(AppError::Config(format!(
                "unsupported smoothing method '{}', expected '{}'",
                smoothing.method, SMOOTHING_METHOD_MOVING_AVG
            )));
        }
        if smoothing.window == 0 {
            return Err(AppError::Config(
                "smoothing window must be at least 1".to_string(),
            ));
        }
    }

    Ok(())
}

/// Runs every enabled stage in order, then caps the series at `max_points`.
///
/// `origin_ms` anchors the resample buckets, normally the query's start time.
pub fn process_series(
    points: Vec<DataPoint>,
    config: &ProcessingConfig,
    origin_ms: i64,
    max_points: usize,
) -> Vec<DataPoint> {
    let mut points = points;

    if config.outlier_removal.enabled {
        points = remove_outliers(&points);
    }
    if config.resample.enabled {
        let interval_ms = i64::from(config.resample.interval_seconds) * 1000;
        points = resample_mean(&points, interval_ms, origin_ms);
    }
    if config.smoothing.enabled {
        points = moving_average(&points, config.smoothing.window);
    }

    downsample(&points, max_points)
}

/// Mean and population standard deviation, two-pass.
pub fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// 3-sigma outlier removal.
///
/// Each point is compared against the mean and standard deviation of the *other* points,
/// so a single spike cannot widen its own acceptance band. Passes repeat until nothing is
/// dropped. Series with fewer than 3 points or zero spread pass through untouched.
pub fn remove_outliers(points: &[DataPoint]) -> Vec<DataPoint> {
    let mut current = points.to_vec();

    for _ in 0..MAX_CLIP_ROUNDS {
        let kept = clip_once(&current);
        if kept.len() == current.len() {
            break;
        }
        current = kept;
    }

    current
}

fn clip_once(points: &[DataPoint]) -> Vec<DataPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let (mean, std_dev) = mean_and_std_dev(&values);
    if std_dev == 0.0 || !std_dev.is_finite() {
        return points.to_vec();
    }

    let n = values.len() as f64;
    let m2: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();

    points
        .iter()
        .filter(|p| {
            // Moyenne et variance de la série privée du point courant.
            let delta = p.value - mean;
            let loo_mean = mean - delta / (n - 1.0);
            let loo_m2 = (m2 - delta * delta * n / (n - 1.0)).max(0.0);
            let loo_std = (loo_m2 / (n - 1.0)).sqrt();
            (p.value - loo_mean).abs() <= SIGMA_FACTOR * loo_std
        })
        .copied()
        .collect()
}

/// Buckets points into `interval_ms` windows aligned on `origin_ms` and emits one point
/// per non-empty bucket, stamped at the bucket start with the mean of its values.
pub fn resample_mean(points: &[DataPoint], interval_ms: i64, origin_ms: i64) -> Vec<DataPoint> {
    if interval_ms <= 0 || points.is_empty() {
        return points.to_vec();
    }

    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for point in points {
        let bucket = (point.timestamp_ms - origin_ms).div_euclid(interval_ms);
        let slot = buckets.entry(bucket).or_insert((0.0, 0));
        slot.0 += point.value;
        slot.1 += 1;
    }

    buckets
        .into_iter()
        .map(|(bucket, (sum, count))| {
            DataPoint::new(origin_ms + bucket * interval_ms, sum / count as f64)
        })
        .collect()
}

/// Centered moving average over `window` points, shrinking at the series edges.
/// A window below 2 leaves the series unchanged.
pub fn moving_average(points: &[DataPoint], window: usize) -> Vec<DataPoint> {
    if window < 2 || points.len() < 2 {
        return points.to_vec();
    }

    let half = window / 2;
    let len = points.len();

    // Sommes préfixées : chaque moyenne se calcule en O(1).
    let mut prefix = Vec::with_capacity(len + 1);
    prefix.push(0.0);
    for point in points {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + point.value);
    }

    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(len - 1);
            let mean = (prefix[hi + 1] - prefix[lo]) / (hi - lo + 1) as f64;
            DataPoint::new(point.timestamp_ms, mean)
        })
        .collect()
}

/// Uniform-stride reduction to at most `max_points` points.
///
/// Keeps every `N`th point with `N = ceil(len / max_points)`. When the last point falls
/// between strides it replaces the final kept point, so both ends of the series survive
/// without exceeding the cap.
pub fn downsample(points: &[DataPoint], max_points: usize) -> Vec<DataPoint> {
    if max_points < 2 || points.len() <= max_points {
        return points.to_vec();
    }

    let stride = points.len().div_ceil(max_points);
    let mut sampled: Vec<DataPoint> = points.iter().step_by(stride).copied().collect();

    let last_index = points.len() - 1;
    if last_index % stride != 0 {
        if let Some(tail) = sampled.last_mut() {
            *tail = points[last_index];
        }
    }

    sampled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingConfig;

    const EPS: f64 = 1e-9;

    fn series(values: &[f64]) -> Vec<DataPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| DataPoint::new(i as i64 * 1000, *v))
            .collect()
    }

    fn values(points: &[DataPoint]) -> Vec<f64> {
        points.iter().map(|p| p.value).collect()
    }

    #[test]
    fn test_outlier_spike_is_dropped() {
        let input = series(&[1.0, 1.0, 1.0, 1.0, 100.0]);
        let output = remove_outliers(&input);
        assert_eq!(values(&output), vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(output, input[..4].to_vec());
    }

    #[test]
    fn test_outlier_passthrough_on_degenerate_series() {
        let flat = series(&[5.0, 5.0, 5.0, 5.0]);
        assert_eq!(remove_outliers(&flat), flat);

        let single = series(&[42.0]);
        assert_eq!(remove_outliers(&single), single);

        let pair = series(&[1.0, 1000.0]);
        assert_eq!(remove_outliers(&pair), pair);

        assert!(remove_outliers(&[]).is_empty());
    }

    #[test]
    fn test_outlier_keeps_regular_noise() {
        let input = series(&[10.0, 11.0, 9.0, 10.5, 9.5, 10.2, 9.8]);
        assert_eq!(remove_outliers(&input), input);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let (mean, std_dev) = mean_and_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((mean - 5.0).abs() < EPS);
        assert!((std_dev - 2.0).abs() < EPS);
        assert_eq!(mean_and_std_dev(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_resample_two_minute_buckets() {
        // 120 points espacés d'une seconde, valeur = index.
        let input: Vec<DataPoint> = (0..120)
            .map(|i| DataPoint::new(i * 1000, i as f64))
            .collect();

        let output = resample_mean(&input, 60_000, 0);
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].timestamp_ms, 0);
        assert_eq!(output[1].timestamp_ms, 60_000);
        assert!((output[0].value - 29.5).abs() < EPS);
        assert!((output[1].value - 89.5).abs() < EPS);
    }

    #[test]
    fn test_resample_skips_empty_buckets_and_aligns_on_origin() {
        let origin = 1_000_000;
        let input = vec![
            DataPoint::new(origin + 5_000, 1.0),
            DataPoint::new(origin + 7_000, 3.0),
            DataPoint::new(origin + 185_000, 10.0),
        ];

        let output = resample_mean(&input, 60_000, origin);
        assert_eq!(
            output,
            vec![
                DataPoint::new(origin, 2.0),
                DataPoint::new(origin + 180_000, 10.0),
            ]
        );
    }

    #[test]
    fn test_moving_average_window_three() {
        let output = moving_average(&series(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        let expected = [1.5, 2.0, 3.0, 4.0, 4.5];
        for (got, want) in values(&output).iter().zip(expected) {
            assert!((got - want).abs() < EPS, "got {}, want {}", got, want);
        }
        assert_eq!(output[0].timestamp_ms, 0);
        assert_eq!(output[4].timestamp_ms, 4000);
    }

    #[test]
    fn test_moving_average_small_window_is_identity() {
        let input = series(&[3.0, 1.0, 4.0]);
        assert_eq!(moving_average(&input, 1), input);
        assert_eq!(moving_average(&input, 0), input);
    }

    #[test]
    fn test_downsample_respects_cap_and_endpoints() {
        let input: Vec<DataPoint> = (0..10_000)
            .map(|i| DataPoint::new(i, i as f64))
            .collect();

        let output = downsample(&input, DEFAULT_MAX_POINTS);
        assert!(output.len() <= DEFAULT_MAX_POINTS);
        assert_eq!(output.first(), input.first());
        assert_eq!(output.last(), input.last());
        assert!(output.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }

    #[test]
    fn test_downsample_uneven_stride() {
        let input: Vec<DataPoint> = (0..12_345)
            .map(|i| DataPoint::new(i, (i as f64).sin()))
            .collect();

        let output = downsample(&input, DEFAULT_MAX_POINTS);
        assert!(output.len() <= DEFAULT_MAX_POINTS);
        assert_eq!(output.first(), input.first());
        assert_eq!(output.last(), input.last());
    }

    #[test]
    fn test_downsample_short_series_untouched() {
        let input = series(&[1.0, 2.0, 3.0]);
        assert_eq!(downsample(&input, DEFAULT_MAX_POINTS), input);
    }

    #[test]
    fn test_pipeline_disabled_is_identity() {
        let input = series(&[1.0, 1.0, 1.0, 1.0, 100.0]);
        let output = process_series(input.clone(), &ProcessingConfig::default(), 0, DEFAULT_MAX_POINTS);
        assert_eq!(output, input);
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let config = ProcessingConfig::new()
            .with_outlier_removal()
            .with_resample(60);

        // Une journée à la seconde, sinusoïde avec quelques pics.
        let input: Vec<DataPoint> = (0..86_400)
            .map(|i| {
                let spike = if i % 10_007 == 0 { 500.0 } else { 0.0 };
                DataPoint::new(i * 1000, (i as f64 / 600.0).sin() + spike)
            })
            .collect();

        let once = process_series(input, &config, 0, DEFAULT_MAX_POINTS);
        let twice = process_series(once.clone(), &config, 0, DEFAULT_MAX_POINTS);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1440);
    }

    #[test]
    fn test_pipeline_order_outliers_before_resample() {
        let config = ProcessingConfig::new()
            .with_outlier_removal()
            .with_resample(10);
        let input = series(&[1.0, 1.0, 1.0, 1.0, 100.0]);

        let output = process_series(input, &config, 0, DEFAULT_MAX_POINTS);
        assert_eq!(output, vec![DataPoint::new(0, 1.0)]);
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&ProcessingConfig::default()).is_ok());
        assert!(validate_config(&ProcessingConfig::new().with_smoothing(5)).is_ok());

        let zero_interval = ProcessingConfig::new().with_resample(0);
        assert!(matches!(validate_config(&zero_interval), Err(AppError::Config(_))));

        let mut bad_method = ProcessingConfig::new().with_outlier_removal();
        bad_method.outlier_removal.method = "iqr".to_string();
        assert!(matches!(validate_config(&bad_method), Err(AppError::Config(_))));

        // Une étape désactivée n'est pas validée.
        let mut disabled = ProcessingConfig::new();
        disabled.smoothing.method = "gaussian".to_string();
        assert!(validate_config(&disabled).is_ok());
    }
}
