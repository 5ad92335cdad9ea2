//! Short-horizon glucose prediction
//!
//! Runs an ensemble of forecasting methods over the analysis window,
//! adjusts each candidate by the projected insulin/carb impact, and picks
//! the method with the best recent back-testing record. The back-test log
//! lives inside the predictor: every cycle records what each method
//! forecast, and a later reading landing near a forecast's target time
//! resolves it into an error sample. No external storage is involved.
//!
//! A degenerate fit never fails a cycle: the method drops out of the
//! ensemble for that cycle and linear extrapolation remains as the floor.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::config::{MonitorConfig, PredictionConfig, ThresholdConfig};
use crate::models::{
    ActivityState, AnalysisWindow, Confidence, GlucoseBoundary, Prediction, PredictionMethod,
    Reading, ThresholdEta, TrendResult, GLUCOSE_CEILING, GLUCOSE_FLOOR,
};

/// A forecast waiting for the reading that will score it
#[derive(Debug, Clone)]
struct PendingForecast {
    method: PredictionMethod,
    target_time: DateTime<Utc>,
    predicted: f64,
}

/// Ensemble prediction engine
pub struct Predictor {
    prediction: PredictionConfig,
    thresholds: ThresholdConfig,
    poll_interval_minutes: u32,
    pending: Vec<PendingForecast>,
    recent_errors: BTreeMap<PredictionMethod, VecDeque<f64>>,
}

impl Predictor {
    pub fn new(config: &MonitorConfig) -> Self {
        Predictor {
            prediction: config.prediction.clone(),
            thresholds: config.thresholds.clone(),
            poll_interval_minutes: config.window.poll_interval_minutes,
            pending: Vec::new(),
            recent_errors: BTreeMap::new(),
        }
    }

    /// Produce one prediction for the configured horizon
    pub fn predict(
        &mut self,
        window: &AnalysisWindow,
        trend: &TrendResult,
        activity: &ActivityState,
    ) -> Prediction {
        let horizon = self.prediction.horizon_minutes;

        let latest = match window.latest() {
            Some(reading) => reading.clone(),
            None => {
                return Prediction {
                    horizon_minutes: horizon,
                    predicted_value: self.thresholds.target_glucose,
                    confidence: Confidence::Low,
                    method: PredictionMethod::Linear,
                    risk_factors: vec!["insufficient data for prediction".to_string()],
                    threshold_etas: Vec::new(),
                };
            }
        };

        self.resolve_backtests(&latest);

        let current = f64::from(latest.value);
        let scale = (f64::from(horizon)
            / f64::from(self.prediction.activity_reference_minutes))
        .min(1.0);
        let adjustment = activity.projected_glucose_delta_mg_dl * scale;

        // Linear extrapolation is always computable and serves as the
        // conservative floor when other fits degenerate
        let mut candidates: Vec<(PredictionMethod, f64)> = Vec::new();
        let linear = current + trend.rate_per_minute * f64::from(horizon);
        candidates.push((PredictionMethod::Linear, clamp_glucose(linear + adjustment)));

        if let Some(value) = Self::polynomial_forecast(window, horizon) {
            candidates.push((
                PredictionMethod::Polynomial,
                clamp_glucose(value + adjustment),
            ));
        }
        if let Some(value) = self.smoothing_forecast(window, horizon) {
            candidates.push((
                PredictionMethod::ExponentialSmoothing,
                clamp_glucose(value + adjustment),
            ));
        }

        let target_time = latest.timestamp + Duration::minutes(i64::from(horizon));
        for (method, predicted) in &candidates {
            self.pending.push(PendingForecast {
                method: *method,
                target_time,
                predicted: *predicted,
            });
        }

        let (method, predicted_value) = candidates
            .iter()
            .min_by(|a, b| {
                let ea = self.method_error(a.0).unwrap_or(f64::INFINITY);
                let eb = self.method_error(b.0).unwrap_or(f64::INFINITY);
                ea.partial_cmp(&eb)
                    .unwrap_or(Ordering::Equal)
                    .then(method_rank(a.0).cmp(&method_rank(b.0)))
            })
            .copied()
            // Unreachable: the linear candidate is always present
            .unwrap_or((PredictionMethod::Linear, clamp_glucose(linear + adjustment)));

        let backtest_error = self.method_error(method);
        let confidence = self.grade_confidence(window.len(), trend, backtest_error);
        let risk_factors =
            self.assess_risks(current, predicted_value, window.len(), trend, activity, confidence);
        let threshold_etas = self.threshold_etas(current, trend.rate_per_minute);

        debug!(
            method = %method,
            predicted = predicted_value,
            confidence = %confidence,
            backtest_error = backtest_error,
            "prediction produced"
        );

        Prediction {
            horizon_minutes: horizon,
            predicted_value,
            confidence,
            method,
            risk_factors,
            threshold_etas,
        }
    }

    /// Resolved back-test samples currently held for a method
    pub fn backtest_sample_count(&self, method: PredictionMethod) -> usize {
        self.recent_errors.get(&method).map_or(0, |e| e.len())
    }

    /// Score pending forecasts whose target time this reading has reached
    fn resolve_backtests(&mut self, reading: &Reading) {
        let now = reading.timestamp;
        let actual = f64::from(reading.value);
        let tolerance =
            Duration::seconds((self.prediction.backtest_tolerance_minutes * 60.0) as i64);
        let window = self.prediction.backtest_window;

        let pending = std::mem::take(&mut self.pending);
        for forecast in pending {
            let offset = now - forecast.target_time;
            if offset.abs() <= tolerance {
                let errors = self.recent_errors.entry(forecast.method).or_default();
                errors.push_back((forecast.predicted - actual).abs());
                while errors.len() > window {
                    errors.pop_front();
                }
            } else if offset > tolerance {
                // Target time passed without a matching reading; discard
            } else {
                self.pending.push(forecast);
            }
        }
    }

    /// Mean absolute error over the retained back-test samples
    fn method_error(&self, method: PredictionMethod) -> Option<f64> {
        let errors = self.recent_errors.get(&method)?;
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }

    /// Quadratic fit over the window, evaluated at now + horizon
    ///
    /// Solves the 3x3 normal equations directly; a near-singular system
    /// (too few distinct time points) returns None and the ensemble moves
    /// on without it.
    fn polynomial_forecast(window: &AnalysisWindow, horizon_minutes: u32) -> Option<f64> {
        if window.len() < 4 {
            return None;
        }
        let reference = window.latest()?.timestamp;
        let points: Vec<(f64, f64)> = window
            .readings()
            .iter()
            .map(|r| {
                (
                    (r.timestamp - reference).num_seconds() as f64 / 60.0,
                    f64::from(r.value),
                )
            })
            .collect();

        let n = points.len() as f64;
        let s1: f64 = points.iter().map(|p| p.0).sum();
        let s2: f64 = points.iter().map(|p| p.0.powi(2)).sum();
        let s3: f64 = points.iter().map(|p| p.0.powi(3)).sum();
        let s4: f64 = points.iter().map(|p| p.0.powi(4)).sum();
        let t0: f64 = points.iter().map(|p| p.1).sum();
        let t1: f64 = points.iter().map(|p| p.0 * p.1).sum();
        let t2: f64 = points.iter().map(|p| p.0.powi(2) * p.1).sum();

        // Cramer's rule on [n s1 s2; s1 s2 s3; s2 s3 s4] [a b c]^T = [t0 t1 t2]^T
        let det = n * (s2 * s4 - s3 * s3) - s1 * (s1 * s4 - s3 * s2)
            + s2 * (s1 * s3 - s2 * s2);
        if det.abs() < 1e-6 {
            return None;
        }
        let det_a = t0 * (s2 * s4 - s3 * s3) - s1 * (t1 * s4 - s3 * t2)
            + s2 * (t1 * s3 - s2 * t2);
        let det_b = n * (t1 * s4 - t2 * s3) - t0 * (s1 * s4 - s3 * s2)
            + s2 * (s1 * t2 - t1 * s2);
        let det_c = n * (s2 * t2 - s3 * t1) - s1 * (s1 * t2 - t1 * s2)
            + t0 * (s1 * s3 - s2 * s2);

        let a = det_a / det;
        let b = det_b / det;
        let c = det_c / det;

        let t = f64::from(horizon_minutes);
        let value = a + b * t + c * t * t;
        if value.is_finite() {
            Some(value)
        } else {
            None
        }
    }

    /// Exponential smoothing with a trend component per polling step
    fn smoothing_forecast(&self, window: &AnalysisWindow, horizon_minutes: u32) -> Option<f64> {
        let values = window.values();
        if values.len() < 2 {
            return None;
        }
        let alpha = self.prediction.smoothing_alpha;
        let mut previous = values[0];
        let mut current = values[0];
        for value in &values[1..] {
            previous = current;
            current = alpha * value + (1.0 - alpha) * current;
        }
        let trend_per_step = current - previous;
        let steps = f64::from(horizon_minutes) / f64::from(self.poll_interval_minutes.max(1));
        Some(current + trend_per_step * steps)
    }

    fn grade_confidence(
        &self,
        window_len: usize,
        trend: &TrendResult,
        backtest_error: Option<f64>,
    ) -> Confidence {
        let large_error = backtest_error.map_or(false, |e| e > 20.0);
        if window_len < 3 || trend.confidence < 0.3 || large_error {
            return Confidence::Low;
        }
        let small_error = backtest_error.map_or(true, |e| e < 10.0);
        if window_len >= 5 && trend.confidence >= 0.6 && small_error {
            return Confidence::High;
        }
        Confidence::Medium
    }

    fn assess_risks(
        &self,
        current: f64,
        predicted: f64,
        window_len: usize,
        trend: &TrendResult,
        activity: &ActivityState,
        confidence: Confidence,
    ) -> Vec<String> {
        let mut risks = Vec::new();
        let t = &self.thresholds;

        if predicted <= t.critical_low + 15.0 {
            risks.push("approaching critical low threshold".to_string());
        } else if predicted >= t.critical_high - 20.0 {
            risks.push("approaching critical high threshold".to_string());
        }
        if trend.direction.is_rapid() && window_len < 5 {
            risks.push("rapid trend with thin data".to_string());
        }
        if activity.iob >= self.prediction.iob_uncertainty_threshold {
            risks.push("high IOB uncertainty".to_string());
        }
        if (predicted - current).abs() > 50.0 {
            risks.push("large predicted change".to_string());
        }
        if confidence == Confidence::Low {
            risks.push("low prediction confidence".to_string());
        }

        risks
    }

    /// Minutes until each boundary at the current linear rate, within a
    /// two-hour lookahead
    fn threshold_etas(&self, current: f64, rate: f64) -> Vec<ThresholdEta> {
        let mut etas = Vec::new();
        let t = &self.thresholds;

        if rate <= -0.1 {
            for (boundary, threshold) in [
                (GlucoseBoundary::Low, t.low_glucose),
                (GlucoseBoundary::CriticalLow, t.critical_low),
            ] {
                if current > threshold {
                    let minutes = (current - threshold) / rate.abs();
                    if minutes <= 120.0 {
                        etas.push(ThresholdEta { boundary, minutes });
                    }
                }
            }
        } else if rate >= 0.1 {
            for (boundary, threshold) in [
                (GlucoseBoundary::High, t.high_glucose),
                (GlucoseBoundary::CriticalHigh, t.critical_high),
            ] {
                if current < threshold {
                    let minutes = (threshold - current) / rate;
                    if minutes <= 120.0 {
                        etas.push(ThresholdEta { boundary, minutes });
                    }
                }
            }
        }

        etas
    }
}

fn method_rank(method: PredictionMethod) -> u8 {
    match method {
        PredictionMethod::Linear => 0,
        PredictionMethod::Polynomial => 1,
        PredictionMethod::ExponentialSmoothing => 2,
    }
}

fn clamp_glucose(value: f64) -> f64 {
    value.clamp(f64::from(GLUCOSE_FLOOR), f64::from(GLUCOSE_CEILING))
}
