//! Treatment recommendation engine
//!
//! A fixed, ordered set of rules is evaluated every cycle against the
//! current reading, trend, prediction and activity state. Each rule
//! independently yields zero or one recommendation; results are sorted by
//! priority and urgency. Adding a rule means appending to the list in
//! [`RecommendationEngine::new`]; existing rules are never touched.
//!
//! A contraindication veto is not an error: it is the deliberate absence
//! of a recommendation, logged at debug level. An empty list for a cycle
//! means "no action needed".

use chrono::{DateTime, Duration, Timelike, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::config::{MonitorConfig, RecommendationConfig, ThresholdConfig};
use crate::models::{
    ActivityState, AnalysisWindow, Pattern, Prediction, Reading, Recommendation,
    RecommendationKind, TrendDirection, TrendResult, Urgency,
};

/// Everything a rule may consult for one cycle
pub struct RuleContext<'a> {
    pub reading: &'a Reading,
    pub window: &'a AnalysisWindow,
    pub trend: &'a TrendResult,
    pub patterns: &'a [Pattern],
    pub prediction: &'a Prediction,
    pub activity: &'a ActivityState,
    pub now: DateTime<Utc>,
}

/// Contract shared by every recommendation generator
pub trait RecommendationRule {
    fn name(&self) -> &'static str;

    /// Yield at most one recommendation for this cycle
    fn evaluate(&self, ctx: &RuleContext) -> Option<Recommendation>;
}

/// Carbohydrate suggestions for low or falling glucose
struct CarbRule {
    enabled: bool,
    thresholds: ThresholdConfig,
    carb_effectiveness: f64,
    min_grams: f64,
    max_grams: f64,
}

impl RecommendationRule for CarbRule {
    fn name(&self) -> &'static str {
        "carbohydrate"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<Recommendation> {
        if !self.enabled {
            return None;
        }
        let value = f64::from(ctx.reading.value);
        let predicted = ctx.prediction.predicted_value;
        let direction = ctx.trend.direction;
        let t = &self.thresholds;

        let falling_fast = matches!(
            direction,
            TrendDirection::FastDown | TrendDirection::VeryFastDown
        );

        let urgency = if value <= t.critical_low {
            Urgency::Critical
        } else if value <= t.low_glucose {
            Urgency::High
        } else if value <= t.low_glucose * 1.2 && falling_fast {
            if predicted <= t.low_glucose {
                Urgency::High
            } else {
                Urgency::Medium
            }
        } else if predicted <= t.low_glucose {
            Urgency::Medium
        } else {
            return None;
        };

        // Already recovering strongly; more carbs would overshoot. Never
        // vetoed at critical lows.
        if value > t.critical_low
            && matches!(direction, TrendDirection::FastUp | TrendDirection::VeryFastUp)
        {
            debug!(value, %direction, "carb suggestion vetoed: already rising fast");
            return None;
        }

        let deficit = (t.low_glucose - value).max(0.0);
        let grams = (deficit / self.carb_effectiveness * 15.0)
            .max(self.min_grams)
            .min(self.max_grams)
            .round();

        let mut message = match urgency {
            Urgency::Critical => format!("URGENT: take {:.0} g fast-acting carbs now!", grams),
            Urgency::High => format!("Low glucose: take {:.0} g carbs.", grams),
            _ => format!("Consider {:.0} g carbs.", grams),
        };
        message.push_str(&format!(" Current: {:.0} mg/dL", value));
        if falling_fast {
            message.push_str(" (falling rapidly)");
        } else if direction == TrendDirection::Down {
            message.push_str(" (falling)");
        }

        let mut safety_notes = vec![
            "Re-check glucose in 15 minutes".to_string(),
            "Prefer fast-acting carbohydrates".to_string(),
        ];
        if urgency == Urgency::Critical {
            safety_notes.insert(0, "Critical low glucose alert".to_string());
            safety_notes.push("Call emergency services if symptoms are severe".to_string());
        }

        Some(Recommendation {
            kind: RecommendationKind::Carb,
            priority: 1,
            urgency,
            message,
            suggested_amount: Decimal::from_f64(grams),
            safety_notes,
        })
    }
}

/// Correction insulin suggestions for sustained highs
///
/// Hard contraindication: never fires while the trend is falling, no
/// matter how high the reading is.
struct InsulinRule {
    enabled: bool,
    thresholds: ThresholdConfig,
    insulin_effectiveness: f64,
    unit_ratio: f64,
    iob_high_threshold: f64,
    min_units: f64,
    max_units: f64,
}

impl InsulinRule {
    /// Elevated and holding: at least four readings averaging above the
    /// high threshold, spread no wider than 40 mg/dL, and not already on
    /// the way down.
    fn sustained_elevated(&self, window: &AnalysisWindow) -> bool {
        let recent = window.recent(4);
        if recent.len() < 4 {
            return false;
        }
        let values: Vec<f64> = recent.iter().map(|r| f64::from(r.value)).collect();
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        if avg < self.thresholds.high_glucose {
            return false;
        }
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        if max - min > 40.0 {
            return false;
        }
        // Newest more than 10 mg/dL below the oldest counts as falling
        values[values.len() - 1] >= values[0] - 10.0
    }
}

impl RecommendationRule for InsulinRule {
    fn name(&self) -> &'static str {
        "insulin"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<Recommendation> {
        if !self.enabled {
            return None;
        }
        let direction = ctx.trend.direction;
        if direction.is_down() {
            debug!(%direction, "insulin contraindicated while glucose is falling");
            return None;
        }

        let value = f64::from(ctx.reading.value);
        let t = &self.thresholds;
        if value < t.high_glucose {
            return None;
        }
        if ctx.activity.iob >= self.iob_high_threshold {
            debug!(
                iob = ctx.activity.iob,
                "insulin suggestion vetoed: IOB already high"
            );
            return None;
        }
        if !self.sustained_elevated(ctx.window) {
            return None;
        }

        let excess = value - t.target_glucose;
        // Reduce (never increase) the correction by what active insulin
        // is already expected to do
        let iob_reduction = ctx.activity.iob * self.insulin_effectiveness;
        let adjusted_excess = excess - iob_reduction;
        if adjusted_excess <= 0.0 {
            debug!(iob = ctx.activity.iob, "active insulin already covers the correction");
            return None;
        }

        let units = (adjusted_excess / self.insulin_effectiveness * self.unit_ratio)
            .clamp(self.min_units, self.max_units);
        let units = (units * 100.0).round() / 100.0;

        let urgency = if value >= t.critical_high {
            Urgency::High
        } else {
            Urgency::Medium
        };

        let mut message = format!(
            "Consider {:.2} units of insulin. Current glucose: {:.0} mg/dL",
            units, value
        );
        message.push_str(if direction.is_up() { " (rising)" } else { " (stable)" });
        if ctx.activity.iob > 0.1 {
            message.push_str(&format!(", IOB: {:.1} u", ctx.activity.iob));
        }

        Some(Recommendation {
            kind: RecommendationKind::Insulin,
            priority: 2,
            urgency,
            message,
            suggested_amount: Decimal::from_f64(units),
            safety_notes: vec![
                "This is not professional advice; use your own judgment".to_string(),
                "Monitor glucose closely after insulin administration".to_string(),
                "Account for any insulin not yet logged here".to_string(),
            ],
        })
    }
}

/// Prompt to confirm insulin-on-board when it matters most
///
/// Fires only to improve prediction accuracy; never suggests a dose.
struct IobStatusRule {
    thresholds: ThresholdConfig,
    fast_up_threshold: f64,
    override_duration_minutes: u32,
}

impl RecommendationRule for IobStatusRule {
    fn name(&self) -> &'static str {
        "iob-status"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<Recommendation> {
        let value = f64::from(ctx.reading.value);
        let predicted = ctx.prediction.predicted_value;
        let direction = ctx.trend.direction;
        let activity = ctx.activity;
        let t = &self.thresholds;

        let approaching_low =
            value <= t.low_glucose * 1.2 || predicted <= t.low_glucose;
        let rising_fast = matches!(
            direction,
            TrendDirection::FastUp | TrendDirection::VeryFastUp
        ) || ctx.trend.rate_per_minute > self.fast_up_threshold;

        if !approaching_low && !rising_fast {
            return None;
        }

        let mut reasons: Vec<String> = Vec::new();
        let mut urgency = Urgency::Low;

        let no_iob_data = activity.iob < 0.05 && !activity.override_active;
        if no_iob_data {
            if approaching_low {
                urgency = Urgency::High;
                reasons.push("approaching low glucose without confirmed IOB".to_string());
            } else {
                urgency = Urgency::Medium;
                reasons.push(
                    "glucose rising fast; confirm whether insulin was taken".to_string(),
                );
            }
        } else {
            let stale_override = activity.override_active
                && activity
                    .override_age_minutes
                    .map_or(false, |age| age > f64::from(self.override_duration_minutes) / 2.0);

            if approaching_low && activity.iob > 0.3 {
                urgency = Urgency::High;
                reasons.push(format!(
                    "approaching low with {:.1} u on board; verify IOB for safe predictions",
                    activity.iob
                ));
            } else if rising_fast && activity.iob < 0.2 {
                urgency = Urgency::Medium;
                reasons.push(
                    "glucose rising fast with little IOB on record; confirm no recent dose"
                        .to_string(),
                );
            } else if activity.iob >= 0.6 {
                urgency = Urgency::Medium;
                reasons.push(format!(
                    "high IOB ({:.1} u) strongly affecting predictions",
                    activity.iob
                ));
                if activity.iob > 1.0 && !direction.is_down() {
                    urgency = Urgency::High;
                    reasons.push("IOB high but glucose not falling as expected".to_string());
                }
            } else if stale_override {
                reasons.push("IOB override may be out of date".to_string());
            }
        }

        if reasons.is_empty() {
            return None;
        }

        let mut message = format!("Check current IOB: {}.", reasons.join("; "));
        if activity.iob > 0.0 {
            message.push_str(&format!(" Recorded IOB: {:.1} u.", activity.iob));
        }

        Some(Recommendation {
            kind: RecommendationKind::IobStatus,
            priority: 4,
            urgency,
            message,
            suggested_amount: None,
            safety_notes: vec![
                "Accurate IOB improves prediction accuracy".to_string(),
                "Read active insulin from the pump display".to_string(),
                "Update with an IOB override once confirmed".to_string(),
            ],
        })
    }
}

/// Shorter re-check intervals when the picture is unstable or borderline
struct MonitoringRule {
    thresholds: ThresholdConfig,
}

impl RecommendationRule for MonitoringRule {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<Recommendation> {
        let value = f64::from(ctx.reading.value);
        let t = &self.thresholds;
        let mut reasons: Vec<&str> = Vec::new();
        let mut interval: u32 = 60;

        if ctx.trend.direction.is_rapid() {
            reasons.push("rapid glucose changes");
            interval = interval.min(15);
        }
        if value >= t.low_glucose * 0.9 && value <= t.low_glucose * 1.1 {
            reasons.push("near the low threshold");
            interval = interval.min(30);
        }
        if value >= t.high_glucose * 0.9 && value <= t.high_glucose * 1.1 {
            reasons.push("near the high threshold");
            interval = interval.min(30);
        }
        if ctx.prediction.confidence == crate::models::Confidence::Low && ctx.window.len() >= 3
        {
            reasons.push("prediction confidence is low");
            interval = interval.min(45);
        }
        let hour = ctx.now.hour();
        if (hour >= 22 || hour <= 6) && !(100.0..=200.0).contains(&value) {
            reasons.push("overnight out-of-range reading");
            interval = interval.min(30);
        }

        if reasons.is_empty() {
            return None;
        }

        let urgency = if interval <= 15 {
            Urgency::Medium
        } else {
            Urgency::Low
        };

        Some(Recommendation {
            kind: RecommendationKind::Monitoring,
            priority: 5,
            urgency,
            message: format!(
                "Re-check glucose in about {} minutes: {}.",
                interval,
                reasons.join(", ")
            ),
            suggested_amount: None,
            safety_notes: Vec::new(),
        })
    }
}

/// Evaluates the fixed rule list and orders, deduplicates and throttles
/// the results
pub struct RecommendationEngine {
    rules: Vec<Box<dyn RecommendationRule>>,
    cooldown: Duration,
    recent: HashMap<RecommendationKind, (DateTime<Utc>, u64)>,
}

impl RecommendationEngine {
    pub fn new(config: &MonitorConfig) -> Self {
        let r: &RecommendationConfig = &config.recommendation;
        let thresholds = config.thresholds.clone();

        let rules: Vec<Box<dyn RecommendationRule>> = vec![
            Box::new(CarbRule {
                enabled: r.enable_carb_recommendations,
                thresholds: thresholds.clone(),
                carb_effectiveness: config.activity.carb_effectiveness,
                min_grams: r.min_carb_grams,
                max_grams: r.max_carb_suggestion_grams,
            }),
            Box::new(InsulinRule {
                enabled: r.enable_insulin_recommendations,
                thresholds: thresholds.clone(),
                insulin_effectiveness: config.activity.insulin_effectiveness,
                unit_ratio: r.insulin_unit_ratio,
                iob_high_threshold: r.iob_high_threshold,
                min_units: r.min_insulin_units,
                max_units: r.max_insulin_suggestion_units,
            }),
            Box::new(IobStatusRule {
                thresholds: thresholds.clone(),
                fast_up_threshold: config.trend.fast_up_threshold,
                override_duration_minutes: config.activity.override_duration_minutes(),
            }),
            Box::new(MonitoringRule { thresholds }),
        ];

        RecommendationEngine {
            rules,
            cooldown: Duration::minutes(r.cooldown_minutes),
            recent: HashMap::new(),
        }
    }

    /// Run every rule and return the cycle's ordered recommendation list
    ///
    /// An empty list is a valid "no action" outcome, not an error.
    pub fn evaluate(&mut self, ctx: &RuleContext) -> Vec<Recommendation> {
        let mut results = Vec::new();
        for rule in &self.rules {
            match rule.evaluate(ctx) {
                Some(rec) => results.push(rec),
                None => debug!(rule = rule.name(), "no recommendation"),
            }
        }

        results.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.urgency.cmp(&a.urgency))
        });

        let mut emitted = Vec::new();
        for rec in results {
            let fingerprint = Self::fingerprint(&rec);
            if let Some((at, last_fingerprint)) = self.recent.get(&rec.kind) {
                if *last_fingerprint == fingerprint && ctx.now - *at < self.cooldown {
                    debug!(kind = %rec.kind, "equivalent recommendation suppressed by cooldown");
                    continue;
                }
            }
            self.recent.insert(rec.kind, (ctx.now, fingerprint));
            emitted.push(rec);
        }

        emitted
    }

    /// Equivalence fingerprint: kind, urgency and the (rounded) amount.
    /// A changed amount or urgency defeats the cooldown.
    fn fingerprint(rec: &Recommendation) -> u64 {
        let mut hasher = DefaultHasher::new();
        rec.kind.hash(&mut hasher);
        rec.urgency.hash(&mut hasher);
        if let Some(amount) = rec.suggested_amount {
            amount.round_dp(1).to_string().hash(&mut hasher);
        }
        hasher.finish()
    }
}
