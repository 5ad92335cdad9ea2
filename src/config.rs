use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::logging::LogConfig;
use crate::models::{CarbKind, InsulinKind};

/// Complete monitor configuration
///
/// One immutable structure passed into each component at construction.
/// No component reads ambient configuration (environment, globals)
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Analysis window and polling cadence
    pub window: WindowConfig,

    /// Glucose boundaries shared by trend, prediction and recommendations
    pub thresholds: ThresholdConfig,

    /// Trend classification settings
    pub trend: TrendConfig,

    /// Insulin/carb activity model settings
    pub activity: ActivityConfig,

    /// Prediction ensemble settings
    pub prediction: PredictionConfig,

    /// Recommendation rule settings
    pub recommendation: RecommendationConfig,

    /// Logging settings
    pub logging: LogConfig,
}

/// Window sizing and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Readings retained for analysis
    pub size: usize,

    /// Nominal minutes between sensor readings
    pub poll_interval_minutes: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            size: 15,
            poll_interval_minutes: 5,
        }
    }
}

/// Glucose boundaries in mg/dL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub low_glucose: f64,
    pub high_glucose: f64,
    pub critical_low: f64,
    pub critical_high: f64,

    /// Correction target used when sizing insulin suggestions
    pub target_glucose: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            low_glucose: 70.0,
            high_glucose: 180.0,
            critical_low: 55.0,
            critical_high: 300.0,
            target_glucose: 120.0,
        }
    }
}

/// Trend classification settings
///
/// Band thresholds are in mg/dL per minute. A rate exactly at a band
/// boundary classifies into the less extreme band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Most recent readings used for the regression slope
    pub calculation_points: usize,

    pub down_threshold: f64,
    pub fast_down_threshold: f64,
    pub very_fast_down_threshold: f64,

    pub up_threshold: f64,
    pub fast_up_threshold: f64,
    pub very_fast_up_threshold: f64,

    /// Whole-window variance (mg/dL²) below which readings count as stable
    pub stable_variance_threshold: f64,

    /// Single-step change (mg/dL) flagged as a rapid rise/fall pattern
    pub rapid_step_threshold: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            calculation_points: 3,
            down_threshold: 0.5,
            fast_down_threshold: 2.0,
            very_fast_down_threshold: 4.0,
            up_threshold: 0.5,
            fast_up_threshold: 2.0,
            very_fast_up_threshold: 4.0,
            stable_variance_threshold: 10.0,
            rapid_step_threshold: 3.0,
        }
    }
}

/// Insulin and carbohydrate activity model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub insulin_duration_rapid_minutes: u32,
    pub insulin_duration_long_minutes: u32,
    pub insulin_duration_intermediate_minutes: u32,

    pub carb_absorption_fast_minutes: u32,
    pub carb_absorption_slow_minutes: u32,
    pub carb_absorption_mixed_minutes: u32,

    /// Expected glucose drop in mg/dL per unit of insulin
    pub insulin_effectiveness: f64,

    /// Expected glucose rise in mg/dL per 15 g of carbs
    pub carb_effectiveness: f64,

    /// Largest single insulin dose accepted from the command channel
    pub max_insulin_units: Decimal,

    /// Largest single carb intake accepted from the command channel
    pub max_carb_grams: Decimal,

    /// Largest IOB override accepted from the command channel
    pub max_override_units: Decimal,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            insulin_duration_rapid_minutes: 180,
            insulin_duration_long_minutes: 720,
            insulin_duration_intermediate_minutes: 360,
            carb_absorption_fast_minutes: 90,
            carb_absorption_slow_minutes: 180,
            carb_absorption_mixed_minutes: 150,
            insulin_effectiveness: 40.0,
            carb_effectiveness: 15.0,
            max_insulin_units: dec!(20),
            max_carb_grams: dec!(200),
            max_override_units: dec!(10),
        }
    }
}

impl ActivityConfig {
    /// Duration of action for an insulin kind
    pub fn insulin_duration_minutes(&self, kind: InsulinKind) -> u32 {
        match kind {
            InsulinKind::Rapid => self.insulin_duration_rapid_minutes,
            InsulinKind::Long => self.insulin_duration_long_minutes,
            InsulinKind::Intermediate => self.insulin_duration_intermediate_minutes,
        }
    }

    /// Absorption duration for a carb kind
    pub fn carb_duration_minutes(&self, kind: CarbKind) -> u32 {
        match kind {
            CarbKind::Fast => self.carb_absorption_fast_minutes,
            CarbKind::Slow => self.carb_absorption_slow_minutes,
            CarbKind::Mixed => self.carb_absorption_mixed_minutes,
        }
    }

    /// Overrides decay on the rapid-insulin curve from their own timestamp
    pub fn override_duration_minutes(&self) -> u32 {
        self.insulin_duration_rapid_minutes
    }
}

/// Prediction ensemble settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Forecast horizon
    pub horizon_minutes: u32,

    /// Minutes over which the bulk of remaining activity is assumed to
    /// land; the projected delta is scaled by horizon/reference, capped
    /// at 1
    pub activity_reference_minutes: u32,

    /// Resolved back-test samples kept per method
    pub backtest_window: usize,

    /// A reading within this many minutes of a forecast target resolves it
    pub backtest_tolerance_minutes: f64,

    /// Exponential smoothing factor
    pub smoothing_alpha: f64,

    /// IOB at or above this is flagged as a prediction uncertainty
    pub iob_uncertainty_threshold: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            horizon_minutes: 15,
            activity_reference_minutes: 60,
            backtest_window: 10,
            backtest_tolerance_minutes: 3.0,
            smoothing_alpha: 0.3,
            iob_uncertainty_threshold: 1.0,
        }
    }
}

/// Recommendation rule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub enable_carb_recommendations: bool,
    pub enable_insulin_recommendations: bool,

    /// Fraction of the raw correction actually suggested; keeps doses
    /// conservative
    pub insulin_unit_ratio: f64,

    /// No insulin suggestion while IOB is at or above this
    pub iob_high_threshold: f64,

    pub min_insulin_units: f64,
    pub max_insulin_suggestion_units: f64,

    pub min_carb_grams: f64,
    pub max_carb_suggestion_grams: f64,

    /// Suppression window for an equivalent repeat recommendation
    pub cooldown_minutes: i64,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        RecommendationConfig {
            enable_carb_recommendations: true,
            enable_insulin_recommendations: true,
            insulin_unit_ratio: 0.2,
            iob_high_threshold: 2.0,
            min_insulin_units: 0.1,
            max_insulin_suggestion_units: 2.0,
            min_carb_grams: 15.0,
            max_carb_suggestion_grams: 30.0,
            cooldown_minutes: 15,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            window: WindowConfig::default(),
            thresholds: ThresholdConfig::default(),
            trend: TrendConfig::default(),
            activity: ActivityConfig::default(),
            prediction: PredictionConfig::default(),
            recommendation: RecommendationConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations that would make analysis ill-defined
    pub fn validate(&self) -> Result<()> {
        if self.window.size < 2 {
            anyhow::bail!("window.size must be at least 2");
        }
        if self.window.poll_interval_minutes == 0 {
            anyhow::bail!("window.poll_interval_minutes must be positive");
        }
        if self.trend.calculation_points < 2 {
            anyhow::bail!("trend.calculation_points must be at least 2");
        }

        let t = &self.thresholds;
        if !(t.critical_low < t.low_glucose
            && t.low_glucose < t.target_glucose
            && t.target_glucose < t.high_glucose
            && t.high_glucose < t.critical_high)
        {
            anyhow::bail!(
                "thresholds must be ordered: critical_low < low < target < high < critical_high"
            );
        }

        let tr = &self.trend;
        if !(0.0 < tr.down_threshold
            && tr.down_threshold < tr.fast_down_threshold
            && tr.fast_down_threshold < tr.very_fast_down_threshold)
        {
            anyhow::bail!("downward trend thresholds must be ordered and positive");
        }
        if !(0.0 < tr.up_threshold
            && tr.up_threshold < tr.fast_up_threshold
            && tr.fast_up_threshold < tr.very_fast_up_threshold)
        {
            anyhow::bail!("upward trend thresholds must be ordered and positive");
        }

        if self.activity.insulin_effectiveness <= 0.0 {
            anyhow::bail!("activity.insulin_effectiveness must be positive");
        }
        if self.activity.carb_effectiveness <= 0.0 {
            anyhow::bail!("activity.carb_effectiveness must be positive");
        }

        if self.prediction.horizon_minutes == 0 {
            anyhow::bail!("prediction.horizon_minutes must be positive");
        }
        if !(0.0..=1.0).contains(&self.prediction.smoothing_alpha) {
            anyhow::bail!("prediction.smoothing_alpha must be within [0, 1]");
        }

        let r = &self.recommendation;
        if r.min_insulin_units > r.max_insulin_suggestion_units {
            anyhow::bail!("recommendation insulin bounds are inverted");
        }
        if r.min_carb_grams > r.max_carb_suggestion_grams {
            anyhow::bail!("recommendation carb bounds are inverted");
        }
        if r.cooldown_minutes < 0 {
            anyhow::bail!("recommendation.cooldown_minutes may not be negative");
        }

        Ok(())
    }
}
