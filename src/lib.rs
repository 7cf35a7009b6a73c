//! # Mess Ledger
//!
//! Settlement engine for a shared meal mess: members log daily meal counts, shared
//! grocery ("bazar") purchases and cash deposits, and the ledger works out what
//! each member owes or is owed.
//!
//! ## Core Concepts
//!
//! - **Meal rate**: total bazar cost divided by total meals; 0 when nobody ate
//! - **Fair share**: a member's meals times the meal rate
//! - **Net balance**: deposits minus fair share; positive means credit
//! - **Pool remaining**: total deposits minus total bazar cost
//! - **Carry-forward**: a member's meal count for a day is their latest entry on
//!   or before it
//!
//! All computation is pure and runs on a [`MessSnapshot`]. Fetching goes through
//! the [`MessStore`] trait; [`InMemoryStore`] implements it in process and the
//! `postgrest` feature adds an HTTP implementation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mess_ledger::*;
//! use chrono::NaiveDate;
//!
//! let day = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
//! let member = |id: &str| Member {
//!     id: id.to_string(),
//!     name: Some(id.to_string()),
//!     email: None,
//!     phone: None,
//!     auth_user_id: None,
//! };
//! let snapshot = MessSnapshot {
//!     members: vec![member("A"), member("B")],
//!     meals: vec![
//!         MealRecord { id: 1, member_id: "A".into(), date: day, meal_count: 10.0, created_at: None },
//!         MealRecord { id: 2, member_id: "B".into(), date: day, meal_count: 20.0, created_at: None },
//!     ],
//!     bazar: vec![BazarRecord {
//!         id: 3,
//!         member_id: "B".into(),
//!         item_name: "Fish".into(),
//!         cost: 300.0,
//!         date: day,
//!         paid_from: PaidFrom::Box,
//!     }],
//!     deposits: vec![
//!         DepositRecord { id: 4, member_id: "A".into(), amount: 150.0, date: day },
//!         DepositRecord { id: 5, member_id: "B".into(), amount: 150.0, date: day },
//!     ],
//! };
//!
//! let report = process_with_verification(&snapshot, Period::parse("2025-01")?, None, 0.01)?;
//! assert_eq!(report.meal_rate, 10.0);
//! assert_eq!(report.ledger.row("A").unwrap().net_balance, 50.0);
//! ```

pub mod aggregates;
pub mod audit;
pub mod bazar;
pub mod changes;
pub mod config;
pub mod error;
pub mod formatters;
pub mod ledger;
pub mod meal_chart;
pub mod period;
pub mod rate;
pub mod report;
pub mod schema;
pub mod session;
pub mod store;
pub mod utils;

#[cfg(feature = "postgrest")]
pub mod postgrest;

pub use aggregates::{
    fetch_global_aggregates, fetch_visible_aggregates, AggregateSource, GlobalAggregate,
};
pub use audit::{log_action, AuditAction, AuditEntry, AuditSink, AuditTable, NoAudit};
pub use bazar::{delete_bazar_entry, record_bazar, update_bazar, BazarDraft, BazarWriteOutcome};
pub use changes::{ChangeEvent, ChangeFeed, ChangeKind, ChangeTable, Subscription};
pub use config::MessConfig;
pub use error::{MessLedgerError, Result};
pub use formatters::*;
pub use ledger::{build_ledger, Ledger, LedgerRow, LedgerTotals};
pub use meal_chart::{
    apply_chart_plan, load_meal_chart, plan_delete, plan_edit, ChartOp, ChartQuery, ChartRow,
    ChartTargets, ChartTotals, MealChart, Resolution,
};
pub use period::{available_months, filter_to_period, partition_by_month, MonthKey, Period};
pub use rate::{fair_share, meal_rate, net_balance, pool_remaining};
pub use report::{
    load_member_report, load_period_report, monthly_reports, BazarLine, DashboardSummary,
    DepositLine, MealPivot, MemberReport, PeriodReport, PeriodTotals, RateBasis, RecentEntry,
};
pub use schema::*;
pub use session::{ensure_member, open_session, Identity, Session, SessionWatch};
pub use store::{InMemoryStore, MessStore, RecordFilter};
pub use utils::*;

#[cfg(feature = "postgrest")]
pub use postgrest::PostgrestStore;

use log::{debug, info, warn};

pub struct SettlementProcessor;

impl SettlementProcessor {
    pub fn process(
        snapshot: &MessSnapshot,
        period: Period,
        global: Option<&GlobalAggregate>,
    ) -> Result<PeriodReport> {
        validate_snapshot(snapshot)?;

        info!("Settling {} for {} members", period, snapshot.members.len());
        debug!(
            "Snapshot contains {} meal, {} bazar and {} deposit records",
            snapshot.meals.len(),
            snapshot.bazar.len(),
            snapshot.deposits.len()
        );

        let report = PeriodReport::build(snapshot, period, global)?;

        if !report.ledger.orphaned_meal_ids.is_empty() {
            debug!(
                "Orphaned meal records left out of the ledger: {:?}",
                report.ledger.orphaned_meal_ids
            );
        }

        Ok(report)
    }

    /// Like [`process`](Self::process), then checks that fair shares add back up
    /// to the bazar total the rate was derived from.
    ///
    /// The check is skipped with a warning when the ledger does not carry every
    /// meal behind the rate, e.g. meals of removed members or rows hidden from
    /// the caller while the rate is global.
    pub fn process_with_verification(
        snapshot: &MessSnapshot,
        period: Period,
        global: Option<&GlobalAggregate>,
        tolerance: f64,
    ) -> Result<PeriodReport> {
        let report = Self::process(snapshot, period, global)?;

        let (basis_meals, basis_bazar) = report.rate_basis_totals();
        let ledger_meals = report.ledger.totals().meals;
        if (ledger_meals - basis_meals).abs() > tolerance {
            warn!(
                "Skipping fair-share check for {}: ledger holds {} of {} meals behind the rate",
                period, ledger_meals, basis_meals
            );
            return Ok(report);
        }

        report
            .ledger
            .verify_fair_share(&period.label(), basis_bazar, tolerance)?;

        Ok(report)
    }
}

pub fn process_period(
    snapshot: &MessSnapshot,
    period: Period,
    global: Option<&GlobalAggregate>,
) -> Result<PeriodReport> {
    SettlementProcessor::process(snapshot, period, global)
}

pub fn process_with_verification(
    snapshot: &MessSnapshot,
    period: Period,
    global: Option<&GlobalAggregate>,
    tolerance: f64,
) -> Result<PeriodReport> {
    SettlementProcessor::process_with_verification(snapshot, period, global, tolerance)
}

fn validate_snapshot(snapshot: &MessSnapshot) -> Result<()> {
    for meal in &snapshot.meals {
        if !meal.meal_count.is_finite() || meal.meal_count < 0.0 {
            return Err(MessLedgerError::InvalidMealCount(meal.meal_count));
        }
    }

    for bazar in &snapshot.bazar {
        if !bazar.cost.is_finite() || bazar.cost < 0.0 {
            return Err(MessLedgerError::InvalidAmount(bazar.cost));
        }
    }

    for deposit in &snapshot.deposits {
        if !deposit.amount.is_finite() {
            return Err(MessLedgerError::InvalidAmount(deposit.amount));
        }
    }

    Ok(())
}
