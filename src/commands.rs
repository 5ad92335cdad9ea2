//! Command-channel boundary for manual activity logging
//!
//! The command handler is the single writer to the shared activity log.
//! Each command produces exactly one new log record or a validation
//! rejection; nothing here ever mutates or deletes an existing entry.
//!
//! Amounts arrive as free text from chat shortcuts and terminal input, so
//! both `2.4` and `2,4` parse to the same exact decimal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::config::{ActivityConfig, MonitorConfig};
use crate::error::{Result, ValidationError};
use crate::models::{ActivityEntry, CarbKind, EntryPayload, EntrySource, InsulinKind};

/// Parse a user-entered amount, accepting `.` or `,` as the decimal
/// separator
pub fn parse_amount(input: &str) -> Result<Decimal> {
    let normalized = input.trim().replace(',', ".");
    Decimal::from_str(&normalized).map_err(|_| {
        ValidationError::UnparsableAmount {
            input: input.to_string(),
        }
        .into()
    })
}

/// Serializes manual insulin/carb/override commands into the activity log
pub struct CommandHandler {
    config: ActivityConfig,
    log: ActivityLog,
}

impl CommandHandler {
    pub fn new(config: &MonitorConfig, log: ActivityLog) -> Self {
        CommandHandler {
            config: config.activity.clone(),
            log,
        }
    }

    /// Log an insulin dose
    pub fn log_insulin(
        &self,
        amount: Decimal,
        kind: InsulinKind,
        at: DateTime<Utc>,
        source: EntrySource,
        note: Option<String>,
    ) -> Result<ActivityEntry> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount { amount }.into());
        }
        if amount > self.config.max_insulin_units {
            return Err(ValidationError::AmountOutOfRange {
                amount,
                limit: self.config.max_insulin_units,
            }
            .into());
        }

        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::Insulin { kind },
            duration_minutes: self.config.insulin_duration_minutes(kind),
            source,
            note,
        };
        self.log.append(entry.clone());
        info!(units = %amount, kind = ?kind, "insulin dose logged");
        Ok(entry)
    }

    /// Log a carbohydrate intake
    pub fn log_carbs(
        &self,
        amount: Decimal,
        kind: CarbKind,
        at: DateTime<Utc>,
        source: EntrySource,
        note: Option<String>,
    ) -> Result<ActivityEntry> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount { amount }.into());
        }
        if amount > self.config.max_carb_grams {
            return Err(ValidationError::AmountOutOfRange {
                amount,
                limit: self.config.max_carb_grams,
            }
            .into());
        }

        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::Carbs { kind },
            duration_minutes: self.config.carb_duration_minutes(kind),
            source,
            note,
        };
        self.log.append(entry.clone());
        info!(grams = %amount, kind = ?kind, "carb intake logged");
        Ok(entry)
    }

    /// Declare the current insulin-on-board, superseding the computed value
    ///
    /// Zero is a valid declaration ("pump shows no active insulin");
    /// negative values are rejected.
    pub fn set_iob_override(
        &self,
        amount: Decimal,
        at: DateTime<Utc>,
        source: EntrySource,
        note: Option<String>,
    ) -> Result<ActivityEntry> {
        if amount < Decimal::ZERO {
            return Err(ValidationError::NegativeAmount { amount }.into());
        }
        if amount > self.config.max_override_units {
            return Err(ValidationError::AmountOutOfRange {
                amount,
                limit: self.config.max_override_units,
            }
            .into());
        }

        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: at,
            amount,
            payload: EntryPayload::IobOverride,
            duration_minutes: self.config.override_duration_minutes(),
            source,
            note,
        };
        self.log.append(entry.clone());
        info!(units = %amount, source = ?source, "IOB override set");
        Ok(entry)
    }
}
