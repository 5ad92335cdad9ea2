//! Insulin and carbohydrate activity tracking (IOB/COB)
//!
//! Converts the append-only log of doses, intake and overrides into a
//! present-moment activity estimate. Each entry decays along a curve keyed
//! by its kind; the remaining fraction is monotone decreasing, bounded in
//! [0, 1], and reaches exactly zero at the end of the duration of action.
//!
//! The log is shared between the command handler (the only writer) and the
//! analysis pipeline (reader); a cycle always works from one consistent
//! snapshot, so an entry logged mid-cycle takes effect on the next cycle.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::{ActivityConfig, MonitorConfig};
use crate::models::{
    ActiveComponent, ActivityEntry, ActivityState, CarbKind, EntryPayload, InsulinKind,
};

/// Smallest remaining insulin shown in breakdowns, units
const IOB_DISPLAY_FLOOR: f64 = 0.01;

/// Smallest remaining carbs shown in breakdowns, grams
const COB_DISPLAY_FLOOR: f64 = 0.5;

/// Remaining-activity fraction for an insulin entry
///
/// `elapsed_fraction` is elapsed time over duration of action. Rapid
/// insulin tails off on a damped curve; long and intermediate preparations
/// release close to linearly.
pub fn insulin_remaining_fraction(kind: InsulinKind, elapsed_fraction: f64) -> f64 {
    if elapsed_fraction >= 1.0 {
        return 0.0;
    }
    if elapsed_fraction <= 0.0 {
        return 1.0;
    }
    match kind {
        InsulinKind::Rapid => (1.0 - elapsed_fraction) * (-1.5 * elapsed_fraction).exp(),
        InsulinKind::Long | InsulinKind::Intermediate => 1.0 - elapsed_fraction,
    }
}

/// Remaining-absorption fraction for a carb entry
///
/// Fast carbs absorb front-loaded; slow carbs close to linearly; mixed
/// meals blend the two.
pub fn carb_remaining_fraction(kind: CarbKind, elapsed_fraction: f64) -> f64 {
    if elapsed_fraction >= 1.0 {
        return 0.0;
    }
    if elapsed_fraction <= 0.0 {
        return 1.0;
    }
    let linear = 1.0 - elapsed_fraction;
    // Exponential decay rescaled so it still reaches zero at expiry
    let tail = (-3.0f64).exp();
    let fast = ((-3.0 * elapsed_fraction).exp() - tail) / (1.0 - tail);
    match kind {
        CarbKind::Fast => fast,
        CarbKind::Slow => linear,
        CarbKind::Mixed => 0.4 * fast + 0.6 * linear,
    }
}

/// Shared, append-only activity entry log
///
/// Cloning the handle shares the underlying log. Writes are serialized by
/// the interior lock; the command handler is the only call site that
/// appends.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<RwLock<Vec<ActivityEntry>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        ActivityLog::default()
    }

    /// Append one entry to the log
    pub fn append(&self, entry: ActivityEntry) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push(entry);
    }

    /// Consistent copy of the log for one analysis cycle
    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop entries whose duration of action has fully elapsed
    ///
    /// Expired entries contribute exactly zero, so removal never changes
    /// a computed state; the audit value of superseded overrides ends at
    /// their expiry too.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IOB/COB calculator over the shared log
pub struct ActivityTracker {
    config: ActivityConfig,
    log: ActivityLog,
}

impl ActivityTracker {
    pub fn new(config: &MonitorConfig, log: ActivityLog) -> Self {
        ActivityTracker {
            config: config.activity.clone(),
            log,
        }
    }

    /// Another handle to the underlying log
    pub fn log_handle(&self) -> ActivityLog {
        self.log.clone()
    }

    /// Remove fully decayed entries; correctness-neutral
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let removed = self.log.prune_expired(now);
        if removed > 0 {
            debug!(removed, "pruned expired activity entries");
        }
        removed
    }

    /// Compute the activity state at `now` from a consistent log snapshot
    pub fn state_at(&self, now: DateTime<Utc>) -> ActivityState {
        let entries = self.log.snapshot();
        Self::compute(&entries, now, &self.config)
    }

    /// Pure state computation, also used directly by tests
    pub fn compute(
        entries: &[ActivityEntry],
        now: DateTime<Utc>,
        config: &ActivityConfig,
    ) -> ActivityState {
        // The newest non-expired override is authoritative for insulin;
        // earlier overrides and computed IOB are fully superseded while it
        // lasts. The underlying dose entries stay in the log untouched.
        let active_override = entries
            .iter()
            .filter(|e| e.is_override() && !e.is_expired(now) && e.minutes_elapsed(now) >= 0.0)
            .max_by_key(|e| e.timestamp);

        let mut iob = 0.0;
        let mut insulin_breakdown = Vec::new();
        let mut override_age_minutes = None;

        if let Some(ov) = active_override {
            let elapsed = ov.minutes_elapsed(now);
            let fraction = insulin_remaining_fraction(
                InsulinKind::Rapid,
                elapsed / f64::from(ov.duration_minutes),
            );
            let remaining = ov.amount.to_f64().unwrap_or(0.0) * fraction;
            iob = remaining.max(0.0);
            override_age_minutes = Some(elapsed);
            if remaining > IOB_DISPLAY_FLOOR {
                insulin_breakdown.push(ActiveComponent {
                    entry_id: ov.id,
                    logged_at: ov.timestamp,
                    original_amount: ov.amount,
                    remaining,
                    minutes_ago: elapsed,
                });
            }
        } else {
            for entry in entries {
                let EntryPayload::Insulin { kind } = entry.payload else {
                    continue;
                };
                if entry.is_expired(now) {
                    continue;
                }
                let elapsed = entry.minutes_elapsed(now);
                let fraction = insulin_remaining_fraction(
                    kind,
                    elapsed / f64::from(entry.duration_minutes),
                );
                let remaining = entry.amount.to_f64().unwrap_or(0.0) * fraction;
                iob += remaining;
                if remaining > IOB_DISPLAY_FLOOR {
                    insulin_breakdown.push(ActiveComponent {
                        entry_id: entry.id,
                        logged_at: entry.timestamp,
                        original_amount: entry.amount,
                        remaining,
                        minutes_ago: elapsed,
                    });
                }
            }
        }

        let mut cob = 0.0;
        let mut carb_breakdown = Vec::new();
        for entry in entries {
            let EntryPayload::Carbs { kind } = entry.payload else {
                continue;
            };
            if entry.is_expired(now) {
                continue;
            }
            let elapsed = entry.minutes_elapsed(now);
            let fraction =
                carb_remaining_fraction(kind, elapsed / f64::from(entry.duration_minutes));
            let remaining = entry.amount.to_f64().unwrap_or(0.0) * fraction;
            cob += remaining;
            if remaining > COB_DISPLAY_FLOOR {
                carb_breakdown.push(ActiveComponent {
                    entry_id: entry.id,
                    logged_at: entry.timestamp,
                    original_amount: entry.amount,
                    remaining,
                    minutes_ago: elapsed,
                });
            }
        }

        let iob = iob.max(0.0);
        let cob = cob.max(0.0);
        let projected_glucose_delta_mg_dl = -(iob * config.insulin_effectiveness)
            + cob * config.carb_effectiveness / 15.0;

        ActivityState {
            iob,
            cob,
            projected_glucose_delta_mg_dl,
            override_active: active_override.is_some(),
            override_age_minutes,
            insulin_breakdown,
            carb_breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntrySource;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    fn insulin_entry(amount: Decimal, kind: InsulinKind, at: DateTime<Utc>) -> ActivityEntry {
        let config = ActivityConfig::default();
        ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::Insulin { kind },
            duration_minutes: config.insulin_duration_minutes(kind),
            source: EntrySource::Command,
            note: None,
        }
    }

    fn carb_entry(amount: Decimal, kind: CarbKind, at: DateTime<Utc>) -> ActivityEntry {
        let config = ActivityConfig::default();
        ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::Carbs { kind },
            duration_minutes: config.carb_duration_minutes(kind),
            source: EntrySource::Command,
            note: None,
        }
    }

    fn override_entry(amount: Decimal, at: DateTime<Utc>) -> ActivityEntry {
        let config = ActivityConfig::default();
        ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::IobOverride,
            duration_minutes: config.override_duration_minutes(),
            source: EntrySource::Manual,
            note: None,
        }
    }

    #[test]
    fn test_fraction_bounds_and_monotonicity() {
        for kind in [InsulinKind::Rapid, InsulinKind::Long, InsulinKind::Intermediate] {
            assert_eq!(insulin_remaining_fraction(kind, 0.0), 1.0);
            assert_eq!(insulin_remaining_fraction(kind, 1.0), 0.0);
            assert_eq!(insulin_remaining_fraction(kind, 1.5), 0.0);
            let mut prev = 1.0;
            for step in 1..=20 {
                let f = insulin_remaining_fraction(kind, step as f64 / 20.0);
                assert!((0.0..=1.0).contains(&f));
                assert!(f <= prev, "{:?} not monotone at step {}", kind, step);
                prev = f;
            }
        }
        for kind in [CarbKind::Fast, CarbKind::Slow, CarbKind::Mixed] {
            assert_eq!(carb_remaining_fraction(kind, 0.0), 1.0);
            assert_eq!(carb_remaining_fraction(kind, 1.0), 0.0);
            let mut prev = 1.0;
            for step in 1..=20 {
                let f = carb_remaining_fraction(kind, step as f64 / 20.0);
                assert!((0.0..=1.0).contains(&f));
                assert!(f <= prev, "{:?} not monotone at step {}", kind, step);
                prev = f;
            }
        }
    }

    #[test]
    fn test_fast_carbs_absorb_ahead_of_slow() {
        let halfway_fast = carb_remaining_fraction(CarbKind::Fast, 0.5);
        let halfway_slow = carb_remaining_fraction(CarbKind::Slow, 0.5);
        assert!(halfway_fast < halfway_slow);
    }

    #[test]
    fn test_single_entry_full_lifecycle() {
        let config = ActivityConfig::default();
        let entries = vec![insulin_entry(dec!(2.0), InsulinKind::Rapid, ts(0))];

        // Immediately after logging, the full dose is on board
        let state = ActivityTracker::compute(&entries, ts(0), &config);
        assert!((state.iob - 2.0).abs() < 1e-9);

        // Halfway through, some is gone but some remains
        let state = ActivityTracker::compute(&entries, ts(90), &config);
        assert!(state.iob > 0.0 && state.iob < 2.0);

        // At and past the duration the contribution is exactly zero
        let state = ActivityTracker::compute(&entries, ts(180), &config);
        assert_eq!(state.iob, 0.0);
        let state = ActivityTracker::compute(&entries, ts(600), &config);
        assert_eq!(state.iob, 0.0);
    }

    #[test]
    fn test_iob_sums_entries() {
        let config = ActivityConfig::default();
        let entries = vec![
            insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(0)),
            insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(0)),
        ];
        let state = ActivityTracker::compute(&entries, ts(0), &config);
        assert!((state.iob - 2.0).abs() < 1e-9);
        assert_eq!(state.insulin_breakdown.len(), 2);
    }

    #[test]
    fn test_projected_delta_formula() {
        let config = ActivityConfig::default();
        let entries = vec![
            insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(0)),
            carb_entry(dec!(15.0), CarbKind::Slow, ts(0)),
        ];
        let state = ActivityTracker::compute(&entries, ts(0), &config);
        // 1u at 40 mg/dL/u down, 15 g at 15 mg/dL per 15 g up
        assert!((state.projected_glucose_delta_mg_dl - (-40.0 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn test_override_replaces_computed_iob() {
        let config = ActivityConfig::default();
        let entries = vec![
            insulin_entry(dec!(5.0), InsulinKind::Rapid, ts(0)),
            override_entry(dec!(1.2), ts(30)),
        ];
        let state = ActivityTracker::compute(&entries, ts(30), &config);
        assert!(state.override_active);
        assert!((state.iob - 1.2).abs() < 1e-9);
        assert_eq!(state.insulin_breakdown.len(), 1);
        // The dose entry is still in the log, just not authoritative
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_later_override_fully_supersedes() {
        let config = ActivityConfig::default();
        let entries = vec![override_entry(dec!(4.0), ts(0)), override_entry(dec!(1.0), ts(60))];
        let state = ActivityTracker::compute(&entries, ts(60), &config);
        assert!((state.iob - 1.0).abs() < 1e-9);

        // Well after the second override, decay applies to it alone
        let state = ActivityTracker::compute(&entries, ts(120), &config);
        let expected = 1.0 * insulin_remaining_fraction(InsulinKind::Rapid, 60.0 / 180.0);
        assert!((state.iob - expected).abs() < 1e-9);
    }

    #[test]
    fn test_expired_override_falls_back_to_entries() {
        let config = ActivityConfig::default();
        let entries = vec![
            insulin_entry(dec!(2.0), InsulinKind::Long, ts(0)),
            override_entry(dec!(0.5), ts(10)),
        ];
        // Override duration is 180 min; at ts(200) it has expired while
        // the long-acting dose is still active
        let state = ActivityTracker::compute(&entries, ts(200), &config);
        assert!(!state.override_active);
        let expected = 2.0 * insulin_remaining_fraction(InsulinKind::Long, 200.0 / 720.0);
        assert!((state.iob - expected).abs() < 1e-9);
    }

    #[test]
    fn test_future_entry_counts_in_full() {
        let config = ActivityConfig::default();
        let entries = vec![insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(10))];
        let state = ActivityTracker::compute(&entries, ts(5), &config);
        assert!((state.iob - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_log_prune_is_correctness_neutral() {
        let config = MonitorConfig::default();
        let log = ActivityLog::new();
        log.append(insulin_entry(dec!(2.0), InsulinKind::Rapid, ts(0)));
        log.append(carb_entry(dec!(30.0), CarbKind::Fast, ts(0)));
        log.append(insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(170)));

        let tracker = ActivityTracker::new(&config, log.clone());
        let before = tracker.state_at(ts(200));
        let removed = tracker.prune_expired(ts(200));
        let after = tracker.state_at(ts(200));

        assert_eq!(removed, 2);
        assert_eq!(log.len(), 1);
        assert!((before.iob - after.iob).abs() < 1e-12);
        assert_eq!(before.cob, after.cob);
    }

    #[test]
    fn test_shared_log_handles_see_writes() {
        let log = ActivityLog::new();
        let clone = log.clone();
        clone.append(insulin_entry(dec!(1.0), InsulinKind::Rapid, ts(0)));
        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
    }
}
