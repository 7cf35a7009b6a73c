//! Daily meal chart with carry-forward resolution.
//!
//! A chart is keyed by its dinner date; lunch is the following calendar day. Each
//! member's value for a target day is the latest record dated on or before it,
//! looking back at most `carry_forward_window_days` before the dinner date.

use crate::config::MessConfig;
use crate::error::{MessLedgerError, Result};
use crate::formatters::ReferenceZone;
use crate::schema::{MealRecord, Member, MemberId, RecordId};
use crate::store::{MessStore, RecordFilter};
use crate::utils::{lunch_date_for, window_start};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::try_join_all;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The windowed read a chart needs: `[dinner - window, lunch]`, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartQuery {
    pub dinner_date: NaiveDate,
    pub lunch_date: NaiveDate,
    pub window_start: NaiveDate,
}

impl ChartQuery {
    pub fn for_dinner(dinner_date: NaiveDate, window_days: u32) -> Result<Self> {
        Ok(Self {
            dinner_date,
            lunch_date: lunch_date_for(dinner_date)?,
            window_start: window_start(dinner_date, window_days)?,
        })
    }

    pub fn filter(&self) -> RecordFilter {
        RecordFilter::between(self.window_start, self.lunch_date)
    }
}

/// The record a cell was resolved from, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub value: f64,
    pub late: bool,
    pub source_date: Option<NaiveDate>,
    pub record_id: Option<RecordId>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Resolution {
    fn empty() -> Self {
        Self {
            value: 0.0,
            late: false,
            source_date: None,
            record_id: None,
            created_at: None,
        }
    }

    /// True when the value came from a record dated before the target day.
    pub fn is_carried_forward(&self, target: NaiveDate) -> bool {
        self.source_date.is_some_and(|d| d < target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRow {
    pub member_id: MemberId,
    pub name: String,
    pub dinner: Resolution,
    pub lunch: Resolution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartTotals {
    pub dinner: f64,
    pub lunch: f64,
    pub all: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealChart {
    pub query: ChartQuery,
    pub rows: Vec<ChartRow>,
}

fn sort_for_resolution(records: &mut [&MealRecord]) {
    records.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// `records` must be sorted ascending by date then creation time.
fn resolve(
    records: &[&MealRecord],
    target: NaiveDate,
    zone: &ReferenceZone,
    cutoff_hour: u32,
) -> Resolution {
    match records.iter().rev().find(|r| r.date <= target) {
        Some(record) => Resolution {
            value: if record.meal_count.is_finite() {
                record.meal_count
            } else {
                0.0
            },
            late: record
                .created_at
                .is_some_and(|at| zone.is_after_hour(at, cutoff_hour)),
            source_date: Some(record.date),
            record_id: Some(record.id),
            created_at: record.created_at,
        },
        None => Resolution::empty(),
    }
}

impl MealChart {
    /// Resolves every member for `dinner_date` and the day after.
    ///
    /// Records outside the chart window are ignored, so a member silent for
    /// longer than the window shows 0.
    pub fn build(
        members: &[Member],
        meals: &[MealRecord],
        dinner_date: NaiveDate,
        config: &MessConfig,
    ) -> Result<Self> {
        let query = ChartQuery::for_dinner(dinner_date, config.carry_forward_window_days)?;
        let zone = config.reference_zone()?;

        let mut by_member: HashMap<&str, Vec<&MealRecord>> = HashMap::new();
        for meal in meals
            .iter()
            .filter(|r| r.date >= query.window_start && r.date <= query.lunch_date)
        {
            by_member.entry(meal.member_id.as_str()).or_default().push(meal);
        }
        for records in by_member.values_mut() {
            sort_for_resolution(records);
        }

        let mut rows: Vec<ChartRow> = members
            .iter()
            .map(|member| {
                let records = by_member
                    .get(member.id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                ChartRow {
                    member_id: member.id.clone(),
                    name: member.display_name().to_string(),
                    dinner: resolve(records, query.dinner_date, &zone, config.late_cutoff_hour),
                    lunch: resolve(records, query.lunch_date, &zone, config.late_cutoff_hour),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.member_id.cmp(&b.member_id)));

        debug!(
            "Meal chart for {}: {} rows from {} records",
            dinner_date,
            rows.len(),
            meals.len()
        );
        Ok(Self { query, rows })
    }

    pub fn row(&self, member_id: &str) -> Option<&ChartRow> {
        self.rows.iter().find(|r| r.member_id == member_id)
    }

    pub fn totals(&self) -> ChartTotals {
        let dinner: f64 = self.rows.iter().map(|r| r.dinner.value).sum();
        let lunch: f64 = self.rows.iter().map(|r| r.lunch.value).sum();
        ChartTotals {
            dinner,
            lunch,
            all: dinner + lunch,
        }
    }

    pub fn late_rows(&self) -> impl Iterator<Item = &ChartRow> {
        self.rows.iter().filter(|r| r.dinner.late || r.lunch.late)
    }
}

pub async fn load_meal_chart(
    store: &dyn MessStore,
    dinner_date: NaiveDate,
    config: &MessConfig,
) -> Result<MealChart> {
    let query = ChartQuery::for_dinner(dinner_date, config.carry_forward_window_days)?;
    let filter = query.filter();
    let (members, meals) = futures::try_join!(store.get_members(), store.get_meals(&filter))?;
    MealChart::build(&members, &meals, dinner_date, config)
}

/// Which resolved cells of a row an edit or delete acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartTargets {
    pub dinner: bool,
    pub lunch: bool,
}

impl ChartTargets {
    pub fn both() -> Self {
        Self {
            dinner: true,
            lunch: true,
        }
    }

    pub fn dinner_only() -> Self {
        Self {
            dinner: true,
            lunch: false,
        }
    }

    pub fn lunch_only() -> Self {
        Self {
            dinner: false,
            lunch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChartOp {
    SetCount { record_id: RecordId, meal_count: f64 },
    Delete { record_id: RecordId },
}

impl ChartOp {
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::SetCount { record_id, .. } | Self::Delete { record_id } => *record_id,
        }
    }
}

fn validate_meal_count(value: f64) -> Result<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(MessLedgerError::InvalidMealCount(value));
    }
    Ok(value)
}

/// Count updates on the source records behind the selected cells.
///
/// Only cells backed by a record are touched. When dinner and lunch resolve to the
/// same record they collapse into one update, which requires equal values.
pub fn plan_edit(
    row: &ChartRow,
    targets: ChartTargets,
    dinner_value: f64,
    lunch_value: f64,
) -> Result<Vec<ChartOp>> {
    let dinner = match row.dinner.record_id {
        Some(id) if targets.dinner => Some((id, validate_meal_count(dinner_value)?)),
        _ => None,
    };
    let lunch = match row.lunch.record_id {
        Some(id) if targets.lunch => Some((id, validate_meal_count(lunch_value)?)),
        _ => None,
    };

    let ops = match (dinner, lunch) {
        (None, None) => return Err(MessLedgerError::NoChartTarget),
        (Some((d_id, d_val)), Some((l_id, l_val))) if d_id == l_id => {
            if d_val != l_val {
                return Err(MessLedgerError::ConflictingChartEdit {
                    record_id: d_id,
                    dinner: d_val,
                    lunch: l_val,
                });
            }
            vec![ChartOp::SetCount {
                record_id: d_id,
                meal_count: d_val,
            }]
        }
        (dinner, lunch) => dinner
            .into_iter()
            .chain(lunch)
            .map(|(record_id, meal_count)| ChartOp::SetCount {
                record_id,
                meal_count,
            })
            .collect(),
    };
    Ok(ops)
}

/// Deletes of the source records behind the selected cells, each id at most once.
pub fn plan_delete(row: &ChartRow, targets: ChartTargets) -> Result<Vec<ChartOp>> {
    let mut ids: Vec<RecordId> = Vec::with_capacity(2);
    if targets.dinner {
        ids.extend(row.dinner.record_id);
    }
    if targets.lunch {
        if let Some(id) = row.lunch.record_id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if ids.is_empty() {
        return Err(MessLedgerError::NoChartTarget);
    }
    Ok(ids
        .into_iter()
        .map(|record_id| ChartOp::Delete { record_id })
        .collect())
}

/// Runs the planned operations concurrently; the first failure is returned.
pub async fn apply_chart_plan(store: &dyn MessStore, plan: &[ChartOp]) -> Result<()> {
    if plan.is_empty() {
        return Err(MessLedgerError::NoChartTarget);
    }
    try_join_all(plan.iter().map(|op| async move {
        match *op {
            ChartOp::SetCount {
                record_id,
                meal_count,
            } => store.update_meal_count(record_id, meal_count).await.map(|_| ()),
            ChartOp::Delete { record_id } => store.delete_meal(record_id).await,
        }
    }))
    .await?;
    info!("Applied {} meal chart operations", plan.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.to_string(),
            name: Some(name.to_string()),
            email: None,
            phone: None,
            auth_user_id: None,
        }
    }

    fn meal(id: RecordId, member_id: &str, day: NaiveDate, count: f64) -> MealRecord {
        MealRecord {
            id,
            member_id: member_id.to_string(),
            date: day,
            meal_count: count,
            created_at: None,
        }
    }

    fn chart_for(meals: &[MealRecord], dinner: NaiveDate) -> MealChart {
        MealChart::build(&[member("a", "A")], meals, dinner, &MessConfig::default()).unwrap()
    }

    #[test]
    fn test_carry_forward_resolution() {
        let meals = vec![
            meal(1, "a", date(2025, 1, 1), 2.0),
            meal(2, "a", date(2025, 1, 3), 5.0),
        ];

        let chart = chart_for(&meals, date(2025, 1, 2));
        let row = chart.row("a").unwrap();
        assert_eq!(row.dinner.value, 2.0);
        assert_eq!(row.dinner.source_date, Some(date(2025, 1, 1)));
        assert!(row.dinner.is_carried_forward(date(2025, 1, 2)));
        assert_eq!(row.lunch.value, 5.0);
        assert_eq!(row.lunch.record_id, Some(2));

        let chart = chart_for(&meals, date(2025, 1, 3));
        assert_eq!(chart.row("a").unwrap().dinner.value, 5.0);

        let chart = chart_for(&meals, date(2024, 12, 30));
        let row = chart.row("a").unwrap();
        assert_eq!(row.dinner.value, 0.0);
        assert_eq!(row.dinner.record_id, None);
        assert_eq!(row.lunch.value, 0.0);
    }

    #[test]
    fn test_lunch_date_rolls_over_month_end() {
        let query = ChartQuery::for_dinner(date(2025, 2, 28), 30).unwrap();
        assert_eq!(query.lunch_date, date(2025, 3, 1));
        let query = ChartQuery::for_dinner(date(2024, 2, 28), 30).unwrap();
        assert_eq!(query.lunch_date, date(2024, 2, 29));
        assert_eq!(query.window_start, date(2024, 1, 29));
    }

    #[test]
    fn test_same_day_records_resolve_to_latest_created() {
        let early = Utc.with_ymd_and_hms(2025, 1, 5, 2, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 5, 4, 0, 0).unwrap();
        let meals = vec![
            MealRecord {
                created_at: Some(later),
                ..meal(8, "a", date(2025, 1, 5), 3.0)
            },
            MealRecord {
                created_at: Some(early),
                ..meal(9, "a", date(2025, 1, 5), 1.0)
            },
        ];
        let chart = chart_for(&meals, date(2025, 1, 5));
        assert_eq!(chart.row("a").unwrap().dinner.record_id, Some(8));
    }

    #[test]
    fn test_late_flag_uses_reference_zone() {
        // 12:00:01 UTC is 18:00:01 in UTC+6.
        let late = Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 1).unwrap();
        let on_time = Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 0).unwrap();
        let meals = vec![
            MealRecord {
                created_at: Some(on_time),
                ..meal(1, "a", date(2025, 1, 4), 1.0)
            },
            MealRecord {
                created_at: Some(late),
                ..meal(2, "a", date(2025, 1, 5), 2.0)
            },
        ];
        let chart = chart_for(&meals, date(2025, 1, 4));
        let row = chart.row("a").unwrap();
        assert!(!row.dinner.late);
        assert!(row.lunch.late);
        assert_eq!(chart.late_rows().count(), 1);
    }

    #[test]
    fn test_records_outside_window_are_ignored() {
        let meals = vec![meal(1, "a", date(2024, 11, 1), 4.0)];
        let chart = chart_for(&meals, date(2025, 1, 10));
        assert_eq!(chart.row("a").unwrap().dinner.value, 0.0);
    }

    #[test]
    fn test_rows_sorted_and_totalled() {
        let members = vec![member("b", "Bina"), member("a", "Arif")];
        let meals = vec![
            meal(1, "a", date(2025, 1, 1), 1.0),
            meal(2, "b", date(2025, 1, 1), 2.0),
            meal(3, "b", date(2025, 1, 2), 0.5),
        ];
        let chart =
            MealChart::build(&members, &meals, date(2025, 1, 1), &MessConfig::default()).unwrap();
        assert_eq!(chart.rows[0].name, "Arif");
        let totals = chart.totals();
        assert_eq!(totals.dinner, 3.0);
        assert_eq!(totals.lunch, 1.5);
        assert_eq!(totals.all, 4.5);
    }

    #[test]
    fn test_plan_edit_targets_source_records() {
        let meals = vec![
            meal(1, "a", date(2025, 1, 1), 2.0),
            meal(2, "a", date(2025, 1, 2), 3.0),
        ];
        let chart = chart_for(&meals, date(2025, 1, 1));
        let row = chart.row("a").unwrap();

        let ops = plan_edit(row, ChartTargets::both(), 1.0, 4.0).unwrap();
        assert_eq!(
            ops,
            vec![
                ChartOp::SetCount {
                    record_id: 1,
                    meal_count: 1.0
                },
                ChartOp::SetCount {
                    record_id: 2,
                    meal_count: 4.0
                },
            ]
        );

        let ops = plan_edit(row, ChartTargets::lunch_only(), 9.0, 4.0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].record_id(), 2);

        assert!(matches!(
            plan_edit(row, ChartTargets::both(), -1.0, 4.0),
            Err(MessLedgerError::InvalidMealCount(_))
        ));
    }

    #[test]
    fn test_shared_source_record_collapses() {
        let meals = vec![meal(7, "a", date(2025, 1, 1), 2.0)];
        let chart = chart_for(&meals, date(2025, 1, 3));
        let row = chart.row("a").unwrap();

        assert_eq!(plan_delete(row, ChartTargets::both()).unwrap().len(), 1);
        assert_eq!(plan_edit(row, ChartTargets::both(), 3.0, 3.0).unwrap().len(), 1);
        assert!(matches!(
            plan_edit(row, ChartTargets::both(), 3.0, 1.0),
            Err(MessLedgerError::ConflictingChartEdit { record_id: 7, .. })
        ));
    }

    #[test]
    fn test_no_target_without_source_record() {
        let chart = chart_for(&[], date(2025, 1, 3));
        let row = chart.row("a").unwrap();
        assert!(matches!(
            plan_delete(row, ChartTargets::both()),
            Err(MessLedgerError::NoChartTarget)
        ));
        assert!(matches!(
            plan_edit(row, ChartTargets::default(), 1.0, 1.0),
            Err(MessLedgerError::NoChartTarget)
        ));
    }

    #[tokio::test]
    async fn test_apply_plan_against_store() {
        let store = InMemoryStore::from_snapshot(crate::schema::MessSnapshot {
            members: vec![member("a", "A")],
            meals: vec![
                meal(1, "a", date(2025, 1, 1), 2.0),
                meal(2, "a", date(2025, 1, 2), 3.0),
            ],
            bazar: vec![],
            deposits: vec![],
        });
        let config = MessConfig::default();

        let chart = load_meal_chart(&store, date(2025, 1, 1), &config).await.unwrap();
        let ops = plan_edit(chart.row("a").unwrap(), ChartTargets::dinner_only(), 1.5, 0.0).unwrap();
        apply_chart_plan(&store, &ops).await.unwrap();

        let ops = plan_delete(chart.row("a").unwrap(), ChartTargets::lunch_only()).unwrap();
        apply_chart_plan(&store, &ops).await.unwrap();

        let chart = load_meal_chart(&store, date(2025, 1, 1), &config).await.unwrap();
        let row = chart.row("a").unwrap();
        assert_eq!(row.dinner.value, 1.5);
        assert_eq!(row.lunch.record_id, Some(1));
    }
}
