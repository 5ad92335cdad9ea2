//! Per-reading analysis orchestration
//!
//! One cycle per new reading: validate/append to the window, classify the
//! trend, snapshot the activity state, predict, recommend, then hand the
//! results to the registered collaborators. Cycles are strictly
//! sequential; the activity log is read once per cycle as a consistent
//! snapshot, so entries logged mid-cycle take effect on the next one.
//!
//! Nothing in a cycle is fatal: a failing sink is logged and skipped, a
//! duplicate sensor reading is skipped, and thin data degrades confidence
//! instead of erroring, so the orchestrating loop can run indefinitely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, ActivityTracker};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::models::{
    ActivityState, AnalysisWindow, Pattern, Prediction, Reading, Recommendation, TrendResult,
};
use crate::predict::Predictor;
use crate::recommend::{RecommendationEngine, RuleContext};
use crate::trend::TrendAnalyzer;

/// Cycles between expired-entry sweeps of the activity log (about daily
/// at the nominal 5-minute cadence)
const PRUNE_EVERY_CYCLES: u64 = 288;

/// Everything one analysis cycle produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutput {
    pub reading: Reading,
    pub trend: TrendResult,
    pub patterns: Vec<Pattern>,
    pub activity: ActivityState,
    pub prediction: Prediction,
    pub recommendations: Vec<Recommendation>,
}

/// Notification collaborator: receives the cycle's recommendation list
pub trait RecommendationSink {
    fn deliver(&mut self, reading: &Reading, recommendations: &[Recommendation]) -> Result<()>;
}

/// Display/chart collaborator: receives the full cycle snapshot read-only
pub trait SnapshotSink {
    fn publish(&mut self, output: &CycleOutput) -> Result<()>;
}

/// Orchestrates trend, activity, prediction and recommendation per reading
pub struct AnalysisPipeline {
    window: AnalysisWindow,
    analyzer: TrendAnalyzer,
    tracker: ActivityTracker,
    predictor: Predictor,
    engine: RecommendationEngine,
    last_processed: Option<(DateTime<Utc>, u16)>,
    cycles_completed: u64,
    recommendation_sinks: Vec<Box<dyn RecommendationSink>>,
    snapshot_sinks: Vec<Box<dyn SnapshotSink>>,
}

impl AnalysisPipeline {
    pub fn new(config: &MonitorConfig, log: ActivityLog) -> Self {
        AnalysisPipeline {
            window: AnalysisWindow::new(config.window.size),
            analyzer: TrendAnalyzer::new(config),
            tracker: ActivityTracker::new(config, log),
            predictor: Predictor::new(config),
            engine: RecommendationEngine::new(config),
            last_processed: None,
            cycles_completed: 0,
            recommendation_sinks: Vec::new(),
            snapshot_sinks: Vec::new(),
        }
    }

    /// Register a notification collaborator
    pub fn add_recommendation_sink(&mut self, sink: Box<dyn RecommendationSink>) {
        self.recommendation_sinks.push(sink);
    }

    /// Register a display/chart collaborator
    pub fn add_snapshot_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.snapshot_sinks.push(sink);
    }

    pub fn window(&self) -> &AnalysisWindow {
        &self.window
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Run one analysis cycle for a validated reading
    ///
    /// Returns None when the sensor re-delivered the reading already
    /// processed last cycle; that is a skip, not an error.
    pub fn process_reading(&mut self, reading: Reading) -> Result<Option<CycleOutput>> {
        if let Some((timestamp, value)) = self.last_processed {
            if reading.timestamp == timestamp && reading.value == value {
                debug!("same reading already processed, skipping cycle");
                return Ok(None);
            }
        }

        let now = reading.timestamp;
        self.window.push(reading.clone())?;
        self.last_processed = Some((reading.timestamp, reading.value));

        let trend = self.analyzer.analyze(&self.window);
        let patterns = self.analyzer.detect_patterns(&self.window);
        let activity = self.tracker.state_at(now);
        let prediction = self.predictor.predict(&self.window, &trend, &activity);

        let recommendations = self.engine.evaluate(&RuleContext {
            reading: &reading,
            window: &self.window,
            trend: &trend,
            patterns: &patterns,
            prediction: &prediction,
            activity: &activity,
            now,
        });

        info!(
            value = reading.value,
            direction = %trend.direction,
            iob = activity.iob,
            predicted = prediction.predicted_value,
            recommendations = recommendations.len(),
            "analysis cycle completed"
        );

        let output = CycleOutput {
            reading,
            trend,
            patterns,
            activity,
            prediction,
            recommendations,
        };
        self.forward(&output);

        self.cycles_completed += 1;
        if self.cycles_completed % PRUNE_EVERY_CYCLES == 0 {
            self.tracker.prune_expired(now);
        }

        Ok(Some(output))
    }

    /// Hand the cycle's results to the collaborators; their failures are
    /// contained here and never abort a cycle
    fn forward(&mut self, output: &CycleOutput) {
        if !output.recommendations.is_empty() {
            for sink in &mut self.recommendation_sinks {
                if let Err(error) =
                    sink.deliver(&output.reading, &output.recommendations)
                {
                    warn!(%error, "recommendation sink failed");
                }
            }
        }
        for sink in &mut self.snapshot_sinks {
            if let Err(error) = sink.publish(output) {
                warn!(%error, "snapshot sink failed");
            }
        }
    }
}
