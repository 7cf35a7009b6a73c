use crate::error::Result;
use crate::schema::DatedRecord;
use crate::utils::{month_bounds, parse_month_string, validate_month};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        validate_month(month)?;
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate)> {
        month_bounds(self.year, self.month)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Reporting scope: everything, or one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Period {
    AllTime,
    Month(MonthKey),
}

impl Period {
    pub fn month(year: i32, month: u32) -> Result<Self> {
        Ok(Self::Month(MonthKey::new(year, month)?))
    }

    /// Accepts "all" / "all-time" or a "YYYY-MM" month.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "all" | "all-time" | "all_time" => Ok(Self::AllTime),
            other => {
                let (year, month) = parse_month_string(other)?;
                Self::month(year, month)
            }
        }
    }

    /// Inclusive date range, `None` for all-time.
    pub fn bounds(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        match self {
            Self::AllTime => Ok(None),
            Self::Month(key) => key.bounds().map(Some),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        match self {
            Self::AllTime => true,
            Self::Month(key) => MonthKey::of(date) == *key,
        }
    }

    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllTime => write!(f, "all time"),
            Self::Month(key) => write!(f, "{}", key),
        }
    }
}

pub fn filter_to_period<R: DatedRecord + Clone>(records: &[R], period: &Period) -> Vec<R> {
    records
        .iter()
        .filter(|r| period.contains(r.date()))
        .cloned()
        .collect()
}

/// Buckets records by calendar month. Every record lands in exactly one bucket.
pub fn partition_by_month<R: DatedRecord + Clone>(records: &[R]) -> BTreeMap<MonthKey, Vec<R>> {
    let mut buckets: BTreeMap<MonthKey, Vec<R>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(MonthKey::of(record.date()))
            .or_default()
            .push(record.clone());
    }
    buckets
}

/// Months that have at least one record, newest first, for a month selector.
pub fn available_months<'a, I>(dates: I) -> Vec<MonthKey>
where
    I: IntoIterator<Item = &'a NaiveDate>,
{
    let mut months: Vec<MonthKey> = dates.into_iter().map(|d| MonthKey::of(*d)).collect();
    months.sort_unstable_by(|a, b| b.cmp(a));
    months.dedup();
    months
}
