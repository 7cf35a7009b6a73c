use crate::error::{MessLedgerError, Result};
use chrono::{Datelike, Days, NaiveDate};

pub fn validate_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(MessLedgerError::InvalidMonth(month));
    }
    Ok(())
}

pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    validate_month(month)?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        MessLedgerError::DateError(format!("{:04}-{:02} is out of range", year, month))
    })
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    let (next_year, next_month) = next_month(year, month);

    first_day_of_month(next_year, next_month)?
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| {
            MessLedgerError::DateError(format!("No last day for {:04}-{:02}", year, month))
        })
}

/// Inclusive `[first day, last day]` range of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    Ok((
        first_day_of_month(year, month)?,
        last_day_of_month(year, month)?,
    ))
}

/// Calendar arithmetic on plain dates. `NaiveDate` carries no timezone, so the
/// result never shifts across a day boundary the way local-time math can.
pub fn add_days(date: NaiveDate, days: i64) -> Result<NaiveDate> {
    let shifted = if days >= 0 {
        date.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    };

    shifted.ok_or_else(|| {
        MessLedgerError::DateError(format!("{} shifted by {} days is out of range", date, days))
    })
}

/// Lunch is entered against the dinner date but feeds the following day.
pub fn lunch_date_for(dinner_date: NaiveDate) -> Result<NaiveDate> {
    add_days(dinner_date, 1)
}

/// First day of a trailing window of `window_days` days ending at `anchor`.
pub fn window_start(anchor: NaiveDate, window_days: u32) -> Result<NaiveDate> {
    add_days(anchor, -i64::from(window_days))
}

/// Parses `YYYY-MM-DD`. Longer timestamp strings are accepted and truncated to
/// their date part, matching how the store returns `date` columns.
pub fn parse_iso_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| {
        MessLedgerError::DateError(format!(
            "Invalid date: {}. Expected YYYY-MM-DD",
            value
        ))
    })
}

/// Parses a month selector in the format "YYYY-MM".
pub fn parse_month_string(value: &str) -> Result<(i32, u32)> {
    let start_str = format!("{}-01", value.trim());
    let start = NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
        MessLedgerError::DateError(format!("Invalid month: {}. Expected YYYY-MM", value))
    })?;
    Ok((start.year(), start.month()))
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every `(year, month)` from `start` through `end`, inclusive.
pub fn expand_month_range(start: (i32, u32), end: (i32, u32)) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let (mut year, mut month) = start;

    while year < end.0 || (year == end.0 && month <= end.1) {
        months.push((year, month));
        (year, month) = next_month(year, month);
    }

    months
}
