//! Display helpers and the fixed reference timezone used for "today" and for
//! late-submission checks.

use crate::error::{MessLedgerError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl ReferenceZone {
    pub fn from_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                MessLedgerError::InvalidConfig(format!(
                    "UTC offset of {} minutes is invalid",
                    minutes
                ))
            })?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn today(&self) -> NaiveDate {
        self.date_of(Utc::now())
    }

    /// Calendar day an instant falls on in this zone.
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    pub fn time_of(&self, instant: DateTime<Utc>) -> NaiveTime {
        instant.with_timezone(&self.offset).time()
    }

    /// `YYYY-MM-DD` value for a date input.
    pub fn date_input_value(&self, instant: DateTime<Utc>) -> String {
        self.date_of(instant).format("%Y-%m-%d").to_string()
    }

    /// e.g. "7:05 PM"
    pub fn format_time(&self, instant: DateTime<Utc>) -> String {
        self.time_of(instant).format("%-I:%M %p").to_string()
    }

    /// True when the instant's local time-of-day is strictly after `hour:00:00`.
    /// Exactly on the hour is not after it.
    pub fn is_after_hour(&self, instant: DateTime<Utc>, hour: u32) -> bool {
        match NaiveTime::from_hms_opt(hour, 0, 0) {
            Some(cutoff) => self.time_of(instant) > cutoff,
            None => false,
        }
    }
}

/// e.g. "Mon, Aug 4, 2025"
pub fn format_date_with_day(date: NaiveDate) -> String {
    date.format("%a, %b %-d, %Y").to_string()
}

pub fn format_amount(value: f64, currency_label: &str) -> String {
    format!("{:.2} {}", value, currency_label)
}

/// Meal counts without trailing zeros: 2 -> "2", 1.5 -> "1.5".
pub fn format_count(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        let text = format!("{:.2}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
