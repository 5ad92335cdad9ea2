use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ValidationError};

/// Lower bound of the accepted glucose band in mg/dL
pub const GLUCOSE_FLOOR: u16 = 40;

/// Upper bound of the accepted glucose band in mg/dL
pub const GLUCOSE_CEILING: u16 = 400;

/// A single validated glucose measurement
///
/// Immutable once created; values outside the 40-400 mg/dL band are
/// rejected at construction and never enter the analysis window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Glucose concentration in mg/dL
    pub value: u16,

    /// Measurement timestamp
    pub timestamp: DateTime<Utc>,

    /// Raw trend hint from the sensor, if the device supplies one
    pub trend_hint: Option<String>,
}

impl Reading {
    /// Create a validated reading
    pub fn new(
        value: u16,
        timestamp: DateTime<Utc>,
        trend_hint: Option<String>,
    ) -> Result<Self> {
        if !(GLUCOSE_FLOOR..=GLUCOSE_CEILING).contains(&value) {
            return Err(ValidationError::ReadingOutOfRange {
                value,
                min: GLUCOSE_FLOOR,
                max: GLUCOSE_CEILING,
            }
            .into());
        }
        Ok(Reading {
            value,
            timestamp,
            trend_hint,
        })
    }
}

/// Sliding window over the most recent readings, oldest first
///
/// Append-only: pushing past capacity drops the oldest entry. Timestamps
/// must be strictly increasing; a stale or duplicate timestamp is a
/// validation rejection, not a silent overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisWindow {
    capacity: usize,
    readings: Vec<Reading>,
}

impl AnalysisWindow {
    pub fn new(capacity: usize) -> Self {
        AnalysisWindow {
            capacity: capacity.max(1),
            readings: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Append a reading, dropping the oldest once the window is full
    pub fn push(&mut self, reading: Reading) -> Result<()> {
        if let Some(last) = self.readings.last() {
            if reading.timestamp <= last.timestamp {
                return Err(ValidationError::NonMonotonicTimestamp {
                    last: last.timestamp,
                    new: reading.timestamp,
                }
                .into());
            }
        }
        self.readings.push(reading);
        if self.readings.len() > self.capacity {
            self.readings.remove(0);
        }
        Ok(())
    }

    /// Most recent reading
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.last()
    }

    /// Readings oldest to newest
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// The `count` most recent readings, oldest first
    pub fn recent(&self, count: usize) -> &[Reading] {
        let start = self.readings.len().saturating_sub(count);
        &self.readings[start..]
    }

    /// Glucose values oldest to newest, as floats for analysis
    pub fn values(&self) -> Vec<f64> {
        self.readings.iter().map(|r| f64::from(r.value)).collect()
    }

    /// Minutes between the oldest and newest reading
    pub fn minutes_spanned(&self) -> f64 {
        match (self.readings.first(), self.readings.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_seconds() as f64 / 60.0
            }
            _ => 0.0,
        }
    }
}

/// Rate-of-change classification, ordered from steepest fall to steepest rise
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TrendDirection {
    VeryFastDown,
    FastDown,
    Down,
    Stable,
    Up,
    FastUp,
    VeryFastUp,
}

impl TrendDirection {
    /// Any falling band
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            TrendDirection::Down | TrendDirection::FastDown | TrendDirection::VeryFastDown
        )
    }

    /// Any rising band
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            TrendDirection::Up | TrendDirection::FastUp | TrendDirection::VeryFastUp
        )
    }

    /// Fast or very fast in either direction
    pub fn is_rapid(&self) -> bool {
        matches!(
            self,
            TrendDirection::FastDown
                | TrendDirection::VeryFastDown
                | TrendDirection::FastUp
                | TrendDirection::VeryFastUp
        )
    }

    /// Arrow glyph for terminal display
    pub fn arrow(&self) -> &'static str {
        match self {
            TrendDirection::VeryFastDown => "↓↓",
            TrendDirection::FastDown => "↓",
            TrendDirection::Down => "↘",
            TrendDirection::Stable => "→",
            TrendDirection::Up => "↗",
            TrendDirection::FastUp => "↑",
            TrendDirection::VeryFastUp => "↑↑",
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrendDirection::VeryFastDown => "very fast down",
            TrendDirection::FastDown => "fast down",
            TrendDirection::Down => "down",
            TrendDirection::Stable => "stable",
            TrendDirection::Up => "up",
            TrendDirection::FastUp => "fast up",
            TrendDirection::VeryFastUp => "very fast up",
        };
        write!(f, "{}", name)
    }
}

/// Trend classification for one analysis cycle; derived, never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    /// Classified rate-of-change band
    pub direction: TrendDirection,

    /// Regression slope in mg/dL per minute
    pub rate_per_minute: f64,

    /// Whole-window variance below the stability threshold
    pub stable: bool,

    /// 0.0 (no signal) to 1.0; decreases with residual error and sparsity
    pub confidence: f64,

    /// Number of readings the rate was computed from
    pub sample_count: usize,
}

impl TrendResult {
    /// Result used when the window holds fewer than two readings
    pub fn insufficient_data(sample_count: usize) -> Self {
        TrendResult {
            direction: TrendDirection::Stable,
            rate_per_minute: 0.0,
            stable: true,
            confidence: 0.0,
            sample_count,
        }
    }
}

/// Severity grade for detected window patterns
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Pattern categories scanned for across the analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    RapidRise,
    RapidFall,
    ApproachingLow,
    CriticalLow,
    ApproachingHigh,
    CriticalHigh,
    SteadyRange,
}

/// A pattern observed in the recent readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    pub severity: Severity,
    pub description: String,
}

/// Insulin preparations by duration of action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsulinKind {
    Rapid,
    Long,
    Intermediate,
}

/// Carbohydrate classes by absorption speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CarbKind {
    Fast,
    Slow,
    Mixed,
}

/// What an activity log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An insulin dose in units
    Insulin { kind: InsulinKind },
    /// Carbohydrate intake in grams
    Carbs { kind: CarbKind },
    /// User-declared insulin-on-board, superseding the computed value
    IobOverride,
}

/// Where an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySource {
    /// Typed directly by the user
    Manual,
    /// Arrived over the command channel
    Command,
    /// Reported by a connected device
    Sensor,
}

/// One record in the append-only activity log
///
/// Entries are never mutated. An override is superseded by a later
/// override, not edited or deleted; the full log remains as an audit
/// trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,

    /// When the dose/intake/declaration happened
    pub timestamp: DateTime<Utc>,

    /// Units of insulin or grams of carbohydrate, exactly as entered
    pub amount: Decimal,

    pub payload: EntryPayload,

    /// Duration of action in minutes, resolved from the kind at creation
    pub duration_minutes: u32,

    pub source: EntrySource,

    pub note: Option<String>,
}

impl ActivityEntry {
    /// Minutes elapsed since this entry at `now`; negative if future-dated
    pub fn minutes_elapsed(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_seconds() as f64 / 60.0
    }

    /// True once the full duration of action has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.minutes_elapsed(now) >= f64::from(self.duration_minutes)
    }

    pub fn is_override(&self) -> bool {
        matches!(self.payload, EntryPayload::IobOverride)
    }

    pub fn is_insulin(&self) -> bool {
        matches!(self.payload, EntryPayload::Insulin { .. })
    }

    pub fn is_carbs(&self) -> bool {
        matches!(self.payload, EntryPayload::Carbs { .. })
    }
}

/// Per-entry remaining activity, for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveComponent {
    pub entry_id: Uuid,
    pub logged_at: DateTime<Utc>,
    pub original_amount: Decimal,
    /// Units or grams still active
    pub remaining: f64,
    pub minutes_ago: f64,
}

/// Present-moment activity estimate, recomputed from the log every cycle
///
/// Never stored as ground truth: always a function of the entry log and
/// the current time. Both totals are non-negative and return to zero as
/// entries age past their duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityState {
    /// Insulin on board, units
    pub iob: f64,

    /// Carbs on board, grams
    pub cob: f64,

    /// Net expected glucose impact if all remaining activity lands, mg/dL
    pub projected_glucose_delta_mg_dl: f64,

    /// True when a non-expired override is the authoritative IOB source
    pub override_active: bool,

    /// Age of the active override in minutes, if one is active
    pub override_age_minutes: Option<f64>,

    pub insulin_breakdown: Vec<ActiveComponent>,
    pub carb_breakdown: Vec<ActiveComponent>,
}

impl Default for ActivityState {
    fn default() -> Self {
        ActivityState {
            iob: 0.0,
            cob: 0.0,
            projected_glucose_delta_mg_dl: 0.0,
            override_active: false,
            override_age_minutes: None,
            insulin_breakdown: Vec::new(),
            carb_breakdown: Vec::new(),
        }
    }
}

/// Prediction confidence grade
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// Forecasting methods in the ensemble
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PredictionMethod {
    Linear,
    Polynomial,
    ExponentialSmoothing,
}

impl fmt::Display for PredictionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionMethod::Linear => write!(f, "linear extrapolation"),
            PredictionMethod::Polynomial => write!(f, "polynomial fit"),
            PredictionMethod::ExponentialSmoothing => write!(f, "exponential smoothing"),
        }
    }
}

/// Glucose boundaries a trajectory can be heading toward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlucoseBoundary {
    CriticalLow,
    Low,
    High,
    CriticalHigh,
}

/// Estimated minutes until a boundary is crossed at the current rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEta {
    pub boundary: GlucoseBoundary,
    pub minutes: f64,
}

/// Short-horizon forecast for one analysis cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub horizon_minutes: u32,

    /// Forecast value, clamped into the 40-400 mg/dL band
    pub predicted_value: f64,

    pub confidence: Confidence,

    /// The ensemble method the value came from
    pub method: PredictionMethod,

    /// Ordered, deduplicated risk annotations
    pub risk_factors: Vec<String>,

    /// Minutes-to-boundary estimates within a two-hour lookahead
    pub threshold_etas: Vec<ThresholdEta>,
}

/// Recommendation categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecommendationKind {
    Carb,
    Insulin,
    IobStatus,
    Monitoring,
}

impl fmt::Display for RecommendationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationKind::Carb => write!(f, "carbohydrate"),
            RecommendationKind::Insulin => write!(f, "insulin"),
            RecommendationKind::IobStatus => write!(f, "IOB status"),
            RecommendationKind::Monitoring => write!(f, "monitoring"),
        }
    }
}

/// How urgently a recommendation should be surfaced
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// A single decision-support suggestion
///
/// These are suggestions for a human to act on; the monitor never
/// actuates anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,

    /// Lower number = more urgent category
    pub priority: u8,

    pub urgency: Urgency,

    pub message: String,

    /// Units of insulin or grams of carbs, when the suggestion has a dose
    pub suggested_amount: Option<Decimal>,

    pub safety_notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_reading_validation_bounds() {
        assert!(Reading::new(40, ts(0), None).is_ok());
        assert!(Reading::new(400, ts(0), None).is_ok());
        assert!(Reading::new(39, ts(0), None).is_err());
        assert!(Reading::new(401, ts(0), None).is_err());
    }

    #[test]
    fn test_window_slides_and_stays_ordered() {
        let mut window = AnalysisWindow::new(3);
        for (i, value) in [100u16, 105, 110, 115].iter().enumerate() {
            window
                .push(Reading::new(*value, ts(i as u32 * 5), None).unwrap())
                .unwrap();
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.readings()[0].value, 105);
        assert_eq!(window.latest().unwrap().value, 115);
        assert_eq!(window.minutes_spanned(), 10.0);
    }

    #[test]
    fn test_window_rejects_stale_timestamp() {
        let mut window = AnalysisWindow::new(5);
        window.push(Reading::new(100, ts(5), None).unwrap()).unwrap();
        let stale = Reading::new(110, ts(5), None).unwrap();
        assert!(window.push(stale).is_err());
        let older = Reading::new(110, ts(0), None).unwrap();
        assert!(window.push(older).is_err());
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_recent_slice() {
        let mut window = AnalysisWindow::new(10);
        for i in 0..5u32 {
            window
                .push(Reading::new(100 + i as u16, ts(i * 5), None).unwrap())
                .unwrap();
        }
        assert_eq!(window.recent(3).len(), 3);
        assert_eq!(window.recent(3)[0].value, 102);
        assert_eq!(window.recent(99).len(), 5);
    }

    #[test]
    fn test_direction_ordering_matches_bands() {
        assert!(TrendDirection::VeryFastDown < TrendDirection::Down);
        assert!(TrendDirection::Down < TrendDirection::Stable);
        assert!(TrendDirection::Stable < TrendDirection::FastUp);
        assert!(TrendDirection::Down.is_down());
        assert!(!TrendDirection::Stable.is_down());
        assert!(TrendDirection::VeryFastUp.is_rapid());
    }

    #[test]
    fn test_entry_expiry() {
        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: ts(0),
            amount: dec!(2.0),
            payload: EntryPayload::Insulin {
                kind: InsulinKind::Rapid,
            },
            duration_minutes: 180,
            source: EntrySource::Manual,
            note: None,
        };
        assert!(!entry.is_expired(ts(30)));
        assert!(entry.is_expired(Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()));
        assert!(entry.is_insulin());
        assert!(!entry.is_override());
    }

    #[test]
    fn test_snapshot_serialization() {
        let trend = TrendResult {
            direction: TrendDirection::FastUp,
            rate_per_minute: 2.4,
            stable: false,
            confidence: 0.8,
            sample_count: 3,
        };
        let json = serde_json::to_string(&trend).unwrap();
        assert!(json.contains("\"FastUp\""));
        let back: TrendResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trend);

        let rec = Recommendation {
            kind: RecommendationKind::Carb,
            priority: 1,
            urgency: Urgency::Critical,
            message: "take carbs".to_string(),
            suggested_amount: Some(dec!(20)),
            safety_notes: vec!["re-check in 15 minutes".to_string()],
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: Recommendation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_urgency_ordering() {
        assert!(Urgency::Critical > Urgency::High);
        assert!(Urgency::High > Urgency::Medium);
        assert!(Urgency::Medium > Urgency::Low);
    }
}
