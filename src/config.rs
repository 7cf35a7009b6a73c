use crate::error::{MessLedgerError, Result};
use crate::formatters::ReferenceZone;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Asia/Dhaka, which observes no daylight saving.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 6 * 60;
pub const DEFAULT_LATE_CUTOFF_HOUR: u32 = 18;
pub const DEFAULT_CARRY_FORWARD_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct MessConfig {
    #[schemars(
        description = "Offset from UTC, in minutes, of the reference timezone used for 'today' and late-submission checks"
    )]
    pub reference_utc_offset_minutes: i32,

    #[schemars(
        description = "Hour of day (0-23) in the reference timezone after which a meal entry counts as late"
    )]
    pub late_cutoff_hour: u32,

    #[schemars(
        description = "How many days before the dinner date the meal chart looks back for a value to carry forward"
    )]
    pub carry_forward_window_days: u32,

    #[schemars(description = "Suffix appended to formatted amounts")]
    pub currency_label: String,

    #[schemars(description = "Allowed difference between summed fair shares and the bazar total")]
    pub fairness_tolerance: f64,

    #[schemars(description = "How many rows the dashboard's recent-activity lists show")]
    pub recent_activity_limit: usize,
}

impl Default for MessConfig {
    fn default() -> Self {
        Self {
            reference_utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            late_cutoff_hour: DEFAULT_LATE_CUTOFF_HOUR,
            carry_forward_window_days: DEFAULT_CARRY_FORWARD_WINDOW_DAYS,
            currency_label: "taka".to_string(),
            fairness_tolerance: 0.01,
            recent_activity_limit: 10,
        }
    }
}

impl MessConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MessConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.late_cutoff_hour > 23 {
            return Err(MessLedgerError::InvalidConfig(format!(
                "late_cutoff_hour {} must be between 0 and 23",
                self.late_cutoff_hour
            )));
        }
        if !(-18 * 60..=18 * 60).contains(&self.reference_utc_offset_minutes) {
            return Err(MessLedgerError::InvalidConfig(format!(
                "reference_utc_offset_minutes {} exceeds +/-18 hours",
                self.reference_utc_offset_minutes
            )));
        }
        if self.carry_forward_window_days == 0 {
            return Err(MessLedgerError::InvalidConfig(
                "carry_forward_window_days must be at least 1".to_string(),
            ));
        }
        if !self.fairness_tolerance.is_finite() || self.fairness_tolerance < 0.0 {
            return Err(MessLedgerError::InvalidConfig(format!(
                "fairness_tolerance {} must be a non-negative number",
                self.fairness_tolerance
            )));
        }
        Ok(())
    }

    pub fn reference_zone(&self) -> Result<ReferenceZone> {
        ReferenceZone::from_offset_minutes(self.reference_utc_offset_minutes)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(MessConfig);
        serde_json::to_string_pretty(&schema)
    }
}
