//! Anomaly detector
//!
//! Compares a recent window of metric samples against a baseline window per
//! flag and emits anomaly records when thresholds are crossed. The thresholds
//! below are the detection contract, not tunable defaults.

use sqlx::SqlitePool;

use crate::models::{
    Anomaly, AnomalyType, FeatureFlag, ImpactMetrics, NewAnomaly, Severity,
};

/// How many of the newest samples are fetched per scan
pub const WINDOW_FETCH_LIMIT: i64 = 50;

/// Newest samples forming the recent window; the rest of the fetch is baseline
pub const RECENT_WINDOW: usize = 5;

/// Recent mean error rate must exceed this multiple of baseline
pub const ERROR_RATE_RATIO_THRESHOLD: f64 = 1.5;

/// Absolute floor suppressing noise at near-zero baselines
pub const ERROR_RATE_FLOOR: f64 = 1.0;

/// Error-rate ratio at or above this is critical
pub const ERROR_RATE_CRITICAL_RATIO: f64 = 2.0;

/// Recent mean p50 latency must exceed this multiple of baseline
pub const LATENCY_RATIO_THRESHOLD: f64 = 2.0;

/// Latency ratio at or above this is critical
pub const LATENCY_CRITICAL_RATIO: f64 = 3.0;

/// One threshold crossing, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalySignal {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub message: String,
}

/// Evaluate the window-comparison rules over samples ordered newest-first.
///
/// Fewer than `RECENT_WINDOW` samples, or an empty baseline, is insufficient
/// data: a no-op, not an error. Both rules are independent and may fire from
/// one scan. Repeated scans of an unchanged window re-emit the same signals.
pub fn evaluate(samples: &[ImpactMetrics]) -> Vec<AnomalySignal> {
    if samples.len() < RECENT_WINDOW {
        return Vec::new();
    }
    let (recent, baseline) = samples.split_at(RECENT_WINDOW);
    if baseline.is_empty() {
        return Vec::new();
    }

    let recent_error = mean(recent.iter().map(|m| m.error_rate));
    let baseline_error = mean(baseline.iter().map(|m| m.error_rate));
    let recent_p50 = mean(recent.iter().map(|m| m.latency_p50));
    let baseline_p50 = mean(baseline.iter().map(|m| m.latency_p50));

    let mut signals = Vec::new();

    if recent_error > ERROR_RATE_RATIO_THRESHOLD * baseline_error
        && recent_error > ERROR_RATE_FLOOR
    {
        let ratio = ratio_of(recent_error, baseline_error);
        let severity = if ratio >= ERROR_RATE_CRITICAL_RATIO {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let message = if ratio.is_finite() {
            format!(
                "Error rate increased {:.1}% over baseline ({:.2}% vs {:.2}%)",
                (ratio - 1.0) * 100.0,
                recent_error,
                baseline_error
            )
        } else {
            format!("Error rate rose to {:.2}% from a zero baseline", recent_error)
        };
        signals.push(AnomalySignal {
            anomaly_type: AnomalyType::ErrorSpike,
            severity,
            message,
        });
    }

    if recent_p50 > LATENCY_RATIO_THRESHOLD * baseline_p50 {
        let ratio = ratio_of(recent_p50, baseline_p50);
        let severity = if ratio >= LATENCY_CRITICAL_RATIO {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let message = if ratio.is_finite() {
            format!(
                "p50 latency increased {:.1}% over baseline ({:.0}ms vs {:.0}ms)",
                (ratio - 1.0) * 100.0,
                recent_p50,
                baseline_p50
            )
        } else {
            format!("p50 latency rose to {:.0}ms from a zero baseline", recent_p50)
        };
        signals.push(AnomalySignal {
            anomaly_type: AnomalyType::LatencySpike,
            severity,
            message,
        });
    }

    signals
}

/// Scan the stored metrics for one flag, persisting any threshold crossings.
///
/// Each emitted anomaly carries the single most-recent sample as evidence.
pub async fn detect(pool: &SqlitePool, flag: &FeatureFlag) -> Result<Vec<Anomaly>, sqlx::Error> {
    let samples = ImpactMetrics::recent_for_flag(pool, flag.id, WINDOW_FETCH_LIMIT).await?;
    let signals = evaluate(&samples);

    let mut anomalies = Vec::with_capacity(signals.len());
    for signal in signals {
        tracing::warn!(
            flag = %flag.name,
            anomaly_type = ?signal.anomaly_type,
            severity = ?signal.severity,
            "Anomaly detected: {}",
            signal.message
        );
        let anomaly = Anomaly::insert(
            pool,
            NewAnomaly {
                flag_id: flag.id,
                flag_name: flag.name.clone(),
                anomaly_type: signal.anomaly_type,
                severity: signal.severity,
                metrics: samples[0].clone(),
                message: signal.message,
            },
        )
        .await?;
        anomalies.push(anomaly);
    }

    Ok(anomalies)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn ratio_of(recent: f64, baseline: f64) -> f64 {
    if baseline > 0.0 {
        recent / baseline
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample(error_rate: f64, latency_p50: f64) -> ImpactMetrics {
        ImpactMetrics {
            id: 0,
            flag_id: Uuid::nil(),
            recorded_at: Utc::now(),
            error_rate,
            latency_p50,
            latency_p99: latency_p50 * 2.0,
            request_count: 1000,
            conversion_rate: 3.0,
            satisfaction_score: 4.0,
        }
    }

    /// Newest-first window: `recent` values first, then `baseline` values
    fn window(recent: &[(f64, f64)], baseline: &[(f64, f64)]) -> Vec<ImpactMetrics> {
        recent
            .iter()
            .chain(baseline.iter())
            .map(|&(e, l)| sample(e, l))
            .collect()
    }

    #[test]
    fn fewer_than_five_samples_is_a_noop() {
        let samples: Vec<_> = (0..4).map(|_| sample(50.0, 500.0)).collect();
        assert!(evaluate(&samples).is_empty());
    }

    #[test]
    fn exactly_five_samples_has_no_baseline() {
        let samples: Vec<_> = (0..5).map(|_| sample(50.0, 500.0)).collect();
        assert!(evaluate(&samples).is_empty());
    }

    #[test]
    fn error_ratio_at_two_is_critical() {
        let samples = window(&[(2.0, 50.0); 5], &[(1.0, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::ErrorSpike);
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn error_ratio_just_under_two_is_warning() {
        let samples = window(&[(1.99, 50.0); 5], &[(1.0, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::ErrorSpike);
        assert_eq!(signals[0].severity, Severity::Warning);
    }

    #[test]
    fn error_rate_under_absolute_floor_is_suppressed() {
        // Ratio 5.0 but recent mean 0.5 stays under the >1 floor
        let samples = window(&[(0.5, 50.0); 5], &[(0.1, 50.0); 5]);
        assert!(evaluate(&samples).is_empty());
    }

    #[test]
    fn latency_ratio_below_threshold_is_silent() {
        let samples = window(&[(0.5, 95.0); 5], &[(0.5, 50.0); 5]);
        assert!(evaluate(&samples).is_empty());
    }

    #[test]
    fn latency_ratio_above_three_is_critical() {
        let samples = window(&[(0.5, 160.0); 5], &[(0.5, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::LatencySpike);
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn latency_ratio_between_two_and_three_is_warning() {
        let samples = window(&[(0.5, 125.0); 5], &[(0.5, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Warning);
    }

    #[test]
    fn both_rules_fire_independently() {
        let samples = window(&[(3.0, 200.0); 5], &[(1.0, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].anomaly_type, AnomalyType::ErrorSpike);
        assert_eq!(signals[1].anomaly_type, AnomalyType::LatencySpike);
    }

    #[test]
    fn six_samples_with_single_baseline_point() {
        // Insertion order [1,1,1,1,1,5]: recent mean 1.8, baseline mean 1.0,
        // ratio 1.8 over the 1.5 threshold and the >1 floor, under 2.0
        let samples = window(
            &[(5.0, 50.0), (1.0, 50.0), (1.0, 50.0), (1.0, 50.0), (1.0, 50.0)],
            &[(1.0, 50.0)],
        );
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::ErrorSpike);
        assert_eq!(signals[0].severity, Severity::Warning);
    }

    #[test]
    fn zero_baseline_error_rate_is_critical() {
        let samples = window(&[(2.0, 50.0); 5], &[(0.0, 50.0); 5]);
        let signals = evaluate(&samples);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Critical);
        assert!(signals[0].message.contains("zero baseline"));
    }

    #[test]
    fn stable_window_is_silent() {
        let samples = window(&[(1.2, 52.0); 5], &[(1.1, 50.0); 20]);
        assert!(evaluate(&samples).is_empty());
    }
}
