// Library interface for the glucowatch analysis core
// This allows integration tests to access the core functionality

pub mod activity;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod predict;
pub mod recommend;
pub mod sensor;
pub mod storage;
pub mod trend;

// Re-export commonly used types for convenience
pub use models::*;
pub use activity::{ActivityLog, ActivityTracker};
pub use commands::{parse_amount, CommandHandler};
pub use config::MonitorConfig;
pub use error::{GlucoWatchError, Result};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use pipeline::{AnalysisPipeline, CycleOutput, RecommendationSink, SnapshotSink};
pub use predict::Predictor;
pub use recommend::{RecommendationEngine, RecommendationRule, RuleContext};
pub use sensor::{MockSensor, ReadingSource};
pub use storage::{GlucoseStore, MemoryStore};
pub use trend::TrendAnalyzer;
