//! Period reports: monthly or all-time ledger, meal pivot and line listings, plus
//! the single-member report and the dashboard summary.

use crate::aggregates::{fetch_global_aggregates, AggregateSource, GlobalAggregate};
use crate::error::{MessLedgerError, Result};
use crate::formatters::format_count;
use crate::ledger::{build_ledger, sum_by_member, Ledger};
use crate::period::{filter_to_period, MonthKey, Period};
use crate::rate::{fair_share, meal_rate, net_balance, pool_remaining};
use crate::schema::*;
use crate::store::{MessStore, RecordFilter};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotColumn {
    pub member_id: MemberId,
    pub name: String,
}

/// Date x member grid of meal counts.
///
/// A cell is `None` when the member has no record that day (rendered blank) and
/// `Some(0.0)` when they explicitly recorded zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MealPivot {
    pub dates: Vec<NaiveDate>,
    pub members: Vec<PivotColumn>,
    cells: Vec<Vec<Option<f64>>>,
}

impl MealPivot {
    /// Same-day records of one member are summed. Records of unknown members are
    /// skipped and do not create date rows.
    pub fn build(members: &[Member], meals: &[MealRecord]) -> Self {
        let mut columns: Vec<PivotColumn> = members
            .iter()
            .map(|m| PivotColumn {
                member_id: m.id.clone(),
                name: m.display_name().to_string(),
            })
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.member_id.cmp(&b.member_id)));

        let column_of: HashMap<&str, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.member_id.as_str(), i))
            .collect();

        let mut by_date: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
        for meal in meals {
            let Some(&column) = column_of.get(meal.member_id.as_str()) else {
                continue;
            };
            let row = by_date
                .entry(meal.date)
                .or_insert_with(|| vec![None; columns.len()]);
            let cell = &mut row[column];
            *cell = Some(cell.unwrap_or(0.0) + meal.meal_count);
        }

        let (dates, cells) = by_date.into_iter().unzip();
        Self {
            dates,
            members: columns,
            cells,
        }
    }

    pub fn cell(&self, date: NaiveDate, member_id: &str) -> Option<f64> {
        let row = self.dates.binary_search(&date).ok()?;
        let column = self.members.iter().position(|c| c.member_id == member_id)?;
        self.cells[row][column]
    }

    pub fn render_cell(&self, date: NaiveDate, member_id: &str) -> String {
        self.cell(date, member_id).map(format_count).unwrap_or_default()
    }

    pub fn row(&self, date: NaiveDate) -> Option<&[Option<f64>]> {
        let index = self.dates.binary_search(&date).ok()?;
        Some(&self.cells[index])
    }

    pub fn column_totals(&self) -> Vec<f64> {
        (0..self.members.len())
            .map(|c| self.cells.iter().filter_map(|row| row[c]).sum())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BazarLine {
    pub id: RecordId,
    pub date: NaiveDate,
    pub member_id: MemberId,
    pub member_name: String,
    pub item_name: String,
    pub cost: f64,
    pub paid_from: PaidFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositLine {
    pub id: RecordId,
    pub date: NaiveDate,
    pub member_id: MemberId,
    pub member_name: String,
    pub amount: f64,
}

/// Bazar rows ascending by date, ties broken by id.
pub fn bazar_lines(snapshot: &MessSnapshot, bazar: &[BazarRecord]) -> Vec<BazarLine> {
    let mut lines: Vec<BazarLine> = bazar
        .iter()
        .map(|r| BazarLine {
            id: r.id,
            date: r.date,
            member_id: r.member_id.clone(),
            member_name: snapshot.member_label(&r.member_id).to_string(),
            item_name: r.item_name.clone(),
            cost: r.cost,
            paid_from: r.paid_from,
        })
        .collect();
    lines.sort_by_key(|l| (l.date, l.id));
    lines
}

/// Deposit rows ascending by date, ties broken by id.
pub fn deposit_lines(snapshot: &MessSnapshot, deposits: &[DepositRecord]) -> Vec<DepositLine> {
    let mut lines: Vec<DepositLine> = deposits
        .iter()
        .map(|r| DepositLine {
            id: r.id,
            date: r.date,
            member_id: r.member_id.clone(),
            member_name: snapshot.member_label(&r.member_id).to_string(),
            amount: r.amount,
        })
        .collect();
    lines.sort_by_key(|l| (l.date, l.id));
    lines
}

/// Where a report's meal rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateBasis {
    /// The global aggregate, fetched through the given path.
    Global(AggregateSource),
    /// Recomputed from this period's own rows.
    PeriodRows,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotals {
    pub meals: f64,
    pub bazar_cost: f64,
    pub deposits: f64,
    pub pool_remaining: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReport {
    pub period: Period,
    pub bounds: Option<(NaiveDate, NaiveDate)>,
    pub meal_rate: f64,
    pub rate_basis: RateBasis,
    pub totals: PeriodTotals,
    pub global: Option<GlobalAggregate>,
    pub ledger: Ledger,
    pub pivot: MealPivot,
    pub bazar: Vec<BazarLine>,
    pub deposits: Vec<DepositLine>,
}

impl PeriodReport {
    /// Builds the report for `period` from an input snapshot.
    ///
    /// An all-time report charges the global rate when `global` is given. A month
    /// is always self-contained: its rate comes from its own bazar and meals.
    pub fn build(
        snapshot: &MessSnapshot,
        period: Period,
        global: Option<&GlobalAggregate>,
    ) -> Result<Self> {
        let bounds = period.bounds()?;
        let meals = filter_to_period(&snapshot.meals, &period);
        let bazar = filter_to_period(&snapshot.bazar, &period);
        let deposits = filter_to_period(&snapshot.deposits, &period);

        let total_meals: f64 = meals.iter().map(|r| r.meal_count).sum();
        let total_bazar: f64 = bazar.iter().map(|r| r.cost).sum();
        let total_deposits: f64 = deposits.iter().map(|r| r.amount).sum();
        let totals = PeriodTotals {
            meals: total_meals,
            bazar_cost: total_bazar,
            deposits: total_deposits,
            pool_remaining: pool_remaining(total_deposits, total_bazar),
        };

        let (rate, rate_basis) = match (period, global) {
            (Period::AllTime, Some(global)) => (global.meal_rate, RateBasis::Global(global.source)),
            _ => (meal_rate(totals.bazar_cost, totals.meals), RateBasis::PeriodRows),
        };

        debug!(
            "Period {}: {} meals, {} bazar, {} deposits, rate {:.4} ({:?})",
            period,
            meals.len(),
            bazar.len(),
            deposits.len(),
            rate,
            rate_basis
        );

        let ledger = build_ledger(&snapshot.members, &meals, &deposits, rate);
        let pivot = MealPivot::build(&snapshot.members, &meals);

        Ok(Self {
            period,
            bounds,
            meal_rate: rate,
            rate_basis,
            totals,
            global: global.cloned(),
            ledger,
            pivot,
            bazar: bazar_lines(snapshot, &bazar),
            deposits: deposit_lines(snapshot, &deposits),
        })
    }

    /// Meal and bazar totals the rate was derived from.
    pub fn rate_basis_totals(&self) -> (f64, f64) {
        match (&self.rate_basis, &self.global) {
            (RateBasis::Global(_), Some(global)) => (global.total_meals, global.total_bazar_cost),
            _ => (self.totals.meals, self.totals.bazar_cost),
        }
    }
}

/// Fetches the rows for `period` concurrently and builds its report.
pub async fn load_period_report(store: &dyn MessStore, period: Period) -> Result<PeriodReport> {
    let filter = match period.bounds()? {
        Some((from, to)) => RecordFilter::between(from, to),
        None => RecordFilter::all(),
    };

    let global_fetch = async {
        match period {
            Period::AllTime => fetch_global_aggregates(store).await.map(Some),
            Period::Month(_) => Ok(None),
        }
    };

    let (members, meals, bazar, deposits, global) = futures::try_join!(
        store.get_members(),
        store.get_meals(&filter),
        store.get_bazar(&filter),
        store.get_deposits(&filter),
        global_fetch,
    )?;

    info!(
        "Loaded {} report input: {} members, {} meals, {} bazar, {} deposits",
        period,
        members.len(),
        meals.len(),
        bazar.len(),
        deposits.len()
    );

    let snapshot = MessSnapshot {
        members,
        meals,
        bazar,
        deposits,
    };
    PeriodReport::build(&snapshot, period, global.as_ref())
}

/// Builds one report per month that has any meal, bazar or deposit record.
pub fn monthly_reports(snapshot: &MessSnapshot) -> Result<BTreeMap<MonthKey, PeriodReport>> {
    let months: HashSet<MonthKey> = snapshot
        .meals
        .iter()
        .map(|r| MonthKey::of(r.date))
        .chain(snapshot.bazar.iter().map(|r| MonthKey::of(r.date)))
        .chain(snapshot.deposits.iter().map(|r| MonthKey::of(r.date)))
        .collect();

    months
        .into_iter()
        .map(|key| Ok((key, PeriodReport::build(snapshot, Period::Month(key), None)?)))
        .collect()
}

/// All-time view of a single member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberReport {
    pub member: Member,
    pub meal_rate: f64,
    pub meals: f64,
    pub deposits: f64,
    pub fair_share: f64,
    pub net_balance: f64,
    /// Newest first.
    pub meal_records: Vec<MealRecord>,
    pub bazar_records: Vec<BazarRecord>,
    pub deposit_records: Vec<DepositRecord>,
}

impl MemberReport {
    pub fn build(snapshot: &MessSnapshot, member_id: &str, global: &GlobalAggregate) -> Result<Self> {
        let member = snapshot
            .member(member_id)
            .cloned()
            .ok_or_else(|| MessLedgerError::UnknownMember(member_id.to_string()))?;

        let mut meal_records = owned_by(&snapshot.meals, member_id);
        let mut bazar_records = owned_by(&snapshot.bazar, member_id);
        let mut deposit_records = owned_by(&snapshot.deposits, member_id);
        meal_records.sort_by(|a, b| (b.date, b.id).cmp(&(a.date, a.id)));
        bazar_records.sort_by(|a, b| (b.date, b.id).cmp(&(a.date, a.id)));
        deposit_records.sort_by(|a, b| (b.date, b.id).cmp(&(a.date, a.id)));

        let meals = sum_by_member(&meal_records, |r| r.meal_count)
            .get(member_id)
            .copied()
            .unwrap_or(0.0);
        let deposits = sum_by_member(&deposit_records, |r| r.amount)
            .get(member_id)
            .copied()
            .unwrap_or(0.0);
        let share = fair_share(meals, global.meal_rate);

        Ok(Self {
            member,
            meal_rate: global.meal_rate,
            meals,
            deposits,
            fair_share: share,
            net_balance: net_balance(deposits, share),
            meal_records,
            bazar_records,
            deposit_records,
        })
    }
}

fn owned_by<R: DatedRecord + Clone>(records: &[R], member_id: &str) -> Vec<R> {
    records
        .iter()
        .filter(|r| r.member_id() == member_id)
        .cloned()
        .collect()
}

pub async fn load_member_report(store: &dyn MessStore, member_id: &str) -> Result<MemberReport> {
    let filter = RecordFilter::for_member(member_id);
    let (members, meals, bazar, deposits, global) = futures::try_join!(
        store.get_members(),
        store.get_meals(&filter),
        store.get_bazar(&filter),
        store.get_deposits(&filter),
        fetch_global_aggregates(store),
    )?;

    let snapshot = MessSnapshot {
        members,
        meals,
        bazar,
        deposits,
    };
    MemberReport::build(&snapshot, member_id, &global)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecentEntry {
    Meal { date: NaiveDate, meal_count: f64 },
    Bazar { date: NaiveDate, item_name: String, cost: f64 },
}

impl RecentEntry {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Meal { date, .. } | Self::Bazar { date, .. } => *date,
        }
    }
}

/// A signed-in member's landing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub member_id: MemberId,
    pub my_meals: f64,
    pub my_bazar_cost: f64,
    pub my_deposits: f64,
    pub meal_rate: f64,
    pub net_balance: f64,
    pub pool_remaining: f64,
    pub current_month_bazar: f64,
    pub used_fallback: bool,
    pub recent: Vec<RecentEntry>,
}

impl DashboardSummary {
    /// `snapshot` holds the member's own rows; `global` supplies the shared rate
    /// and the pool. `today` selects the current month.
    pub fn build(
        snapshot: &MessSnapshot,
        member_id: &str,
        global: &GlobalAggregate,
        today: NaiveDate,
        recent_limit: usize,
    ) -> Self {
        let meals = owned_by(&snapshot.meals, member_id);
        let bazar = owned_by(&snapshot.bazar, member_id);
        let deposits = owned_by(&snapshot.deposits, member_id);

        let my_meals: f64 = meals.iter().map(|r| r.meal_count).sum();
        let my_bazar_cost: f64 = bazar.iter().map(|r| r.cost).sum();
        let my_deposits: f64 = deposits.iter().map(|r| r.amount).sum();

        let this_month = Period::Month(MonthKey::of(today));
        let current_month_bazar = snapshot
            .bazar
            .iter()
            .filter(|r| this_month.contains(r.date))
            .map(|r| r.cost)
            .sum();

        let mut recent: Vec<RecentEntry> = meals
            .iter()
            .map(|r| RecentEntry::Meal {
                date: r.date,
                meal_count: r.meal_count,
            })
            .chain(bazar.iter().map(|r| RecentEntry::Bazar {
                date: r.date,
                item_name: r.item_name.clone(),
                cost: r.cost,
            }))
            .collect();
        recent.sort_by(|a, b| b.date().cmp(&a.date()));
        recent.truncate(recent_limit);

        Self {
            member_id: member_id.to_string(),
            my_meals,
            my_bazar_cost,
            my_deposits,
            meal_rate: global.meal_rate,
            net_balance: net_balance(my_deposits, fair_share(my_meals, global.meal_rate)),
            pool_remaining: global.pool_remaining(),
            current_month_bazar,
            used_fallback: global.used_fallback(),
            recent,
        }
    }
}
