//! Storage collaborator seam
//!
//! Persistence mechanics live outside the core; this trait captures the
//! append-only shape the core requires from whatever store backs it:
//! one table per record kind, keyed by timestamp, queryable by most
//! recent N and by time range. An in-memory implementation ships for
//! simulation and tests.

use chrono::{DateTime, Utc};

use crate::error::{GlucoWatchError, Result};
use crate::models::{ActivityEntry, Reading};

/// Append-only persistence contract required from the storage collaborator
pub trait GlucoseStore {
    fn append_reading(&mut self, reading: &Reading) -> Result<()>;
    fn append_insulin(&mut self, entry: &ActivityEntry) -> Result<()>;
    fn append_carbs(&mut self, entry: &ActivityEntry) -> Result<()>;
    fn append_override(&mut self, entry: &ActivityEntry) -> Result<()>;

    /// The most recent `count` readings, oldest first
    fn recent_readings(&self, count: usize) -> Result<Vec<Reading>>;

    /// Readings with `from <= timestamp < to`, oldest first
    fn readings_between(&self, from: DateTime<Utc>, to: DateTime<Utc>)
        -> Result<Vec<Reading>>;
}

/// In-memory store for simulation and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Vec<Reading>,
    insulin: Vec<ActivityEntry>,
    carbs: Vec<ActivityEntry>,
    overrides: Vec<ActivityEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.len()
    }

    pub fn insulin_entries(&self) -> &[ActivityEntry] {
        &self.insulin
    }

    pub fn carb_entries(&self) -> &[ActivityEntry] {
        &self.carbs
    }

    pub fn override_entries(&self) -> &[ActivityEntry] {
        &self.overrides
    }
}

impl GlucoseStore for MemoryStore {
    fn append_reading(&mut self, reading: &Reading) -> Result<()> {
        self.readings.push(reading.clone());
        Ok(())
    }

    fn append_insulin(&mut self, entry: &ActivityEntry) -> Result<()> {
        if !entry.is_insulin() {
            return Err(GlucoWatchError::Storage(
                "insulin table only accepts insulin entries".to_string(),
            ));
        }
        self.insulin.push(entry.clone());
        Ok(())
    }

    fn append_carbs(&mut self, entry: &ActivityEntry) -> Result<()> {
        if !entry.is_carbs() {
            return Err(GlucoWatchError::Storage(
                "carb table only accepts carb entries".to_string(),
            ));
        }
        self.carbs.push(entry.clone());
        Ok(())
    }

    fn append_override(&mut self, entry: &ActivityEntry) -> Result<()> {
        if !entry.is_override() {
            return Err(GlucoWatchError::Storage(
                "override table only accepts IOB overrides".to_string(),
            ));
        }
        self.overrides.push(entry.clone());
        Ok(())
    }

    fn recent_readings(&self, count: usize) -> Result<Vec<Reading>> {
        let start = self.readings.len().saturating_sub(count);
        Ok(self.readings[start..].to_vec())
    }

    fn readings_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        Ok(self
            .readings
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .cloned()
            .collect())
    }
}
