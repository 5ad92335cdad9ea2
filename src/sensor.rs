//! Sensor collaborator seam
//!
//! The monitor only ever sees validated [`Reading`]s through the
//! [`ReadingSource`] trait; vendor API access, authentication and retry
//! live entirely on the other side of it. A deterministic mock source
//! ships for simulation and tests.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::Reading;

/// Where readings come from
pub trait ReadingSource {
    /// Next available reading, or None when the sensor has nothing new
    fn current_reading(&mut self) -> Result<Option<Reading>>;
}

/// Deterministic glucose source for simulation and tests
///
/// Plays back a scripted value sequence, or generates a smooth sinusoidal
/// profile once the script is exhausted. No randomness: the same
/// construction always produces the same readings.
pub struct MockSensor {
    next_timestamp: DateTime<Utc>,
    interval_minutes: u32,
    scripted: Vec<u16>,
    position: usize,
    base_value: f64,
    amplitude: f64,
    period_minutes: f64,
}

impl MockSensor {
    /// Source that plays back exactly the given values, then a flat profile
    /// at the last value
    pub fn scripted(start: DateTime<Utc>, interval_minutes: u32, values: Vec<u16>) -> Self {
        let base = values.last().copied().unwrap_or(120);
        MockSensor {
            next_timestamp: start,
            interval_minutes,
            scripted: values,
            position: 0,
            base_value: f64::from(base),
            amplitude: 0.0,
            period_minutes: 120.0,
        }
    }

    /// Source that oscillates around a base value with the given amplitude
    /// over a two-hour cycle
    pub fn profile(start: DateTime<Utc>, interval_minutes: u32, base: u16, amplitude: f64) -> Self {
        MockSensor {
            next_timestamp: start,
            interval_minutes,
            scripted: Vec::new(),
            position: 0,
            base_value: f64::from(base),
            amplitude,
            period_minutes: 120.0,
        }
    }

    /// Named test scenarios matching common glucose situations
    pub fn scenario(name: &str, start: DateTime<Utc>) -> Option<Self> {
        let values: Vec<u16> = match name {
            "steady" => (0..24u16).map(|i| 110 + (i % 3) * 2).collect(),
            "rising" => (0..20u16).map(|i| 80 + i * 8).collect(),
            "falling" => (0..16u16).map(|i| 200 - i * 8).collect(),
            "hypo" => (0..12u16).map(|i| 100u16.saturating_sub(i * 5).max(48)).collect(),
            "hyper" => (0..12u16).map(|i| 210 + (i % 4) * 3).collect(),
            "wave" => return Some(MockSensor::profile(start, 5, 130, 40.0)),
            _ => return None,
        };
        Some(MockSensor::scripted(start, 5, values))
    }

    fn next_value(&mut self) -> u16 {
        if self.position < self.scripted.len() {
            let value = self.scripted[self.position];
            self.position += 1;
            return value;
        }
        let minutes = (self.position as f64) * f64::from(self.interval_minutes);
        self.position += 1;
        let angle = minutes / self.period_minutes * std::f64::consts::TAU;
        let value = self.base_value + self.amplitude * angle.sin();
        value.clamp(40.0, 400.0).round() as u16
    }
}

impl ReadingSource for MockSensor {
    fn current_reading(&mut self) -> Result<Option<Reading>> {
        let timestamp = self.next_timestamp;
        self.next_timestamp = timestamp + Duration::minutes(i64::from(self.interval_minutes));
        let value = self.next_value();
        Ok(Some(Reading::new(value, timestamp, None)?))
    }
}
