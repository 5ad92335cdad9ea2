//! Glucose trend classification
//!
//! Classifies the rate of change over the most recent readings into seven
//! ordered bands and scans the window for noteworthy patterns. A window
//! with fewer than two readings yields a neutral low-confidence result,
//! not an error, so downstream stages stay well-defined.

use statrs::statistics::Statistics;
use tracing::debug;

use crate::config::{MonitorConfig, ThresholdConfig, TrendConfig};
use crate::models::{
    AnalysisWindow, Pattern, PatternKind, Reading, Severity, TrendDirection, TrendResult,
};

/// Trend analysis engine
pub struct TrendAnalyzer {
    trend: TrendConfig,
    thresholds: ThresholdConfig,
}

impl TrendAnalyzer {
    pub fn new(config: &MonitorConfig) -> Self {
        TrendAnalyzer {
            trend: config.trend.clone(),
            thresholds: config.thresholds.clone(),
        }
    }

    /// Classify the current trend from the analysis window
    pub fn analyze(&self, window: &AnalysisWindow) -> TrendResult {
        if window.len() < 2 {
            return TrendResult::insufficient_data(window.len());
        }

        let recent = window.recent(self.trend.calculation_points.max(2));
        let (rate, residual_std) = match Self::regression_rate(recent) {
            Some(fit) => fit,
            // Degenerate time axis: report no movement rather than failing
            None => (0.0, 0.0),
        };

        let direction = self.classify(rate);

        // Stability is judged on the whole window, independent of the
        // instantaneous rate: a noisy pair of readings can show a steep
        // two-point slope while the window as a whole barely moves.
        let values = window.values();
        let variance = values.iter().population_variance();
        let stable = variance < self.trend.stable_variance_threshold;

        let confidence = self.confidence(residual_std, window.len());

        debug!(
            rate = rate,
            direction = %direction,
            stable = stable,
            variance = variance,
            confidence = confidence,
            "trend analyzed"
        );

        TrendResult {
            direction,
            rate_per_minute: rate,
            stable,
            confidence,
            sample_count: recent.len(),
        }
    }

    /// Map a rate in mg/dL/min onto the seven direction bands
    ///
    /// A rate exactly at a band boundary classifies into the less extreme
    /// band, so a reading hovering on a threshold does not flap between
    /// categories.
    pub fn classify(&self, rate: f64) -> TrendDirection {
        if rate > self.trend.very_fast_up_threshold {
            TrendDirection::VeryFastUp
        } else if rate > self.trend.fast_up_threshold {
            TrendDirection::FastUp
        } else if rate > self.trend.up_threshold {
            TrendDirection::Up
        } else if rate < -self.trend.very_fast_down_threshold {
            TrendDirection::VeryFastDown
        } else if rate < -self.trend.fast_down_threshold {
            TrendDirection::FastDown
        } else if rate < -self.trend.down_threshold {
            TrendDirection::Down
        } else {
            TrendDirection::Stable
        }
    }

    /// Scan the window for rapid steps, threshold approaches and steady
    /// stretches
    pub fn detect_patterns(&self, window: &AnalysisWindow) -> Vec<Pattern> {
        let values = window.values();
        let mut patterns = Vec::new();

        for pair in values.windows(2) {
            let change = pair[1] - pair[0];
            if change >= self.trend.rapid_step_threshold {
                let severity = if change >= self.trend.rapid_step_threshold * 1.5 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                patterns.push(Pattern {
                    kind: PatternKind::RapidRise,
                    severity,
                    description: format!("Rapid rise of {:.1} mg/dL between readings", change),
                });
            } else if change <= -self.trend.rapid_step_threshold {
                let severity = if change <= -self.trend.rapid_step_threshold * 1.5 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                patterns.push(Pattern {
                    kind: PatternKind::RapidFall,
                    severity,
                    description: format!(
                        "Rapid fall of {:.1} mg/dL between readings",
                        change.abs()
                    ),
                });
            }
        }

        if let Some(latest) = window.latest() {
            let value = f64::from(latest.value);
            let t = &self.thresholds;
            if value <= t.critical_low {
                patterns.push(Pattern {
                    kind: PatternKind::CriticalLow,
                    severity: Severity::Critical,
                    description: format!(
                        "Critical low glucose: {:.0} mg/dL (threshold {:.0})",
                        value, t.critical_low
                    ),
                });
            } else if value <= t.low_glucose * 1.2 && value > t.low_glucose {
                patterns.push(Pattern {
                    kind: PatternKind::ApproachingLow,
                    severity: Severity::Medium,
                    description: format!(
                        "Approaching low threshold ({:.0} mg/dL)",
                        t.low_glucose
                    ),
                });
            } else if value >= t.critical_high {
                patterns.push(Pattern {
                    kind: PatternKind::CriticalHigh,
                    severity: Severity::Critical,
                    description: format!(
                        "Critical high glucose: {:.0} mg/dL (threshold {:.0})",
                        value, t.critical_high
                    ),
                });
            } else if value >= t.high_glucose * 0.9 && value < t.high_glucose {
                patterns.push(Pattern {
                    kind: PatternKind::ApproachingHigh,
                    severity: Severity::Medium,
                    description: format!(
                        "Approaching high threshold ({:.0} mg/dL)",
                        t.high_glucose
                    ),
                });
            }
        }

        if values.len() >= 4 {
            let tail = &values[values.len() - 4..];
            let variance = tail.iter().population_variance();
            if variance < self.trend.stable_variance_threshold {
                let avg = tail.iter().mean();
                patterns.push(Pattern {
                    kind: PatternKind::SteadyRange,
                    severity: Severity::Low,
                    description: format!("Steady glucose around {:.0} mg/dL", avg),
                });
            }
        }

        patterns
    }

    /// Least-squares slope over minutes, with the residual standard error
    ///
    /// Returns None when the time axis is degenerate (all readings share a
    /// timestamp).
    fn regression_rate(readings: &[Reading]) -> Option<(f64, f64)> {
        if readings.len() < 2 {
            return None;
        }
        let t0 = readings[0].timestamp;
        let points: Vec<(f64, f64)> = readings
            .iter()
            .map(|r| {
                (
                    (r.timestamp - t0).num_seconds() as f64 / 60.0,
                    f64::from(r.value),
                )
            })
            .collect();

        let n = points.len() as f64;
        let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_v = points.iter().map(|p| p.1).sum::<f64>() / n;

        let var_t: f64 = points.iter().map(|p| (p.0 - mean_t).powi(2)).sum();
        if var_t < 1e-9 {
            return None;
        }

        let covar: f64 = points
            .iter()
            .map(|p| (p.0 - mean_t) * (p.1 - mean_v))
            .sum();
        let slope = covar / var_t;
        let intercept = mean_v - slope * mean_t;

        let residual_std = if points.len() > 2 {
            let ss_res: f64 = points
                .iter()
                .map(|p| (p.1 - (intercept + slope * p.0)).powi(2))
                .sum();
            (ss_res / (n - 2.0)).sqrt()
        } else {
            0.0
        };

        Some((slope, residual_std))
    }

    fn confidence(&self, residual_std: f64, window_len: usize) -> f64 {
        let residual_penalty = (residual_std / 10.0).min(1.0);
        let sparsity = (window_len as f64 / 5.0).min(1.0);
        ((1.0 - residual_penalty) * sparsity).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute as i64)
    }

    fn window_of(values: &[u16]) -> AnalysisWindow {
        let mut window = AnalysisWindow::new(15);
        for (i, value) in values.iter().enumerate() {
            window
                .push(Reading::new(*value, ts(i as u32 * 5), None).unwrap())
                .unwrap();
        }
        window
    }

    fn analyzer() -> TrendAnalyzer {
        TrendAnalyzer::new(&MonitorConfig::default())
    }

    #[test]
    fn test_insufficient_data_is_neutral() {
        let analyzer = analyzer();
        let result = analyzer.analyze(&window_of(&[120]));
        assert_eq!(result.direction, TrendDirection::Stable);
        assert_eq!(result.rate_per_minute, 0.0);
        assert_eq!(result.confidence, 0.0);
        assert!(result.stable);
    }

    #[test]
    fn test_classification_bands() {
        let analyzer = analyzer();
        assert_eq!(analyzer.classify(5.0), TrendDirection::VeryFastUp);
        assert_eq!(analyzer.classify(3.0), TrendDirection::FastUp);
        assert_eq!(analyzer.classify(1.0), TrendDirection::Up);
        assert_eq!(analyzer.classify(0.0), TrendDirection::Stable);
        assert_eq!(analyzer.classify(-1.0), TrendDirection::Down);
        assert_eq!(analyzer.classify(-3.0), TrendDirection::FastDown);
        assert_eq!(analyzer.classify(-5.0), TrendDirection::VeryFastDown);
    }

    #[test]
    fn test_boundary_rates_take_less_extreme_band() {
        let analyzer = analyzer();
        // Exactly at a threshold classifies down into the calmer band
        assert_eq!(analyzer.classify(0.5), TrendDirection::Stable);
        assert_eq!(analyzer.classify(2.0), TrendDirection::Up);
        assert_eq!(analyzer.classify(4.0), TrendDirection::FastUp);
        assert_eq!(analyzer.classify(-0.5), TrendDirection::Stable);
        assert_eq!(analyzer.classify(-2.0), TrendDirection::Down);
        assert_eq!(analyzer.classify(-4.0), TrendDirection::FastDown);
    }

    #[test]
    fn test_classification_is_monotone() {
        let analyzer = analyzer();
        let rates: Vec<f64> = (-100..=100).map(|i| i as f64 / 10.0).collect();
        for pair in rates.windows(2) {
            assert!(
                analyzer.classify(pair[0]) <= analyzer.classify(pair[1]),
                "classification not monotone between {} and {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_rising_window_classifies_up() {
        let analyzer = analyzer();
        let result = analyzer.analyze(&window_of(&[100, 110, 120, 130]));
        // 10 mg/dL per 5 minutes = 2.0/min, exactly at the fast threshold
        assert_eq!(result.direction, TrendDirection::Up);
        assert!((result.rate_per_minute - 2.0).abs() < 1e-9);
        assert!(!result.stable);
    }

    #[test]
    fn test_noisy_pair_is_stable_by_variance() {
        let analyzer = analyzer();
        // Two-point rate is 0.8 mg/dL/min, which would read as a real
        // move, but the window variance is tiny
        let result = analyzer.analyze(&window_of(&[118, 122]));
        assert!(result.stable);
        assert!(result.rate_per_minute.abs() > 0.5);
    }

    #[test]
    fn test_falling_window() {
        let analyzer = analyzer();
        let result = analyzer.analyze(&window_of(&[200, 180, 160, 140]));
        assert_eq!(result.direction, TrendDirection::FastDown);
        assert!(result.rate_per_minute < -2.0);
    }

    #[test]
    fn test_confidence_drops_with_sparse_window() {
        let analyzer = analyzer();
        let sparse = analyzer.analyze(&window_of(&[100, 105]));
        let full = analyzer.analyze(&window_of(&[100, 105, 110, 115, 120, 125]));
        assert!(sparse.confidence < full.confidence);
    }

    #[test]
    fn test_confidence_drops_with_noise() {
        let analyzer = analyzer();
        let clean = analyzer.analyze(&window_of(&[100, 110, 120, 130, 140]));
        let noisy = analyzer.analyze(&window_of(&[100, 135, 95, 150, 105]));
        assert!(noisy.confidence < clean.confidence);
    }

    #[test]
    fn test_rapid_fall_pattern() {
        let analyzer = analyzer();
        let patterns = analyzer.detect_patterns(&window_of(&[120, 110, 100, 90]));
        assert!(patterns
            .iter()
            .any(|p| p.kind == PatternKind::RapidFall && p.severity == Severity::High));
    }

    #[test]
    fn test_critical_low_pattern() {
        let analyzer = analyzer();
        let patterns = analyzer.detect_patterns(&window_of(&[70, 62, 54]));
        assert!(patterns.iter().any(|p| p.kind == PatternKind::CriticalLow
            && p.severity == Severity::Critical));
    }

    #[test]
    fn test_approaching_high_pattern() {
        let analyzer = analyzer();
        let patterns = analyzer.detect_patterns(&window_of(&[168, 170, 172]));
        assert!(patterns
            .iter()
            .any(|p| p.kind == PatternKind::ApproachingHigh));
    }

    #[test]
    fn test_steady_range_pattern() {
        let analyzer = analyzer();
        let patterns = analyzer.detect_patterns(&window_of(&[121, 119, 120, 122]));
        assert!(patterns.iter().any(|p| p.kind == PatternKind::SteadyRange));
    }
}
