//! Global totals across every member.
//!
//! The privileged store operation is preferred because row-level visibility would
//! otherwise turn the "global" meal rate into the caller's own rate. When it is
//! unavailable the totals are summed from whatever rows the caller can see, and
//! the result says so.

use crate::error::Result;
use crate::rate::{meal_rate, pool_remaining};
use crate::schema::{MessSnapshot, RawAggregates};
use crate::store::{MessStore, RecordFilter};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateSource {
    /// Computed by the store across all rows, bypassing visibility rules.
    Privileged,
    /// Summed client-side from visible rows; may under-count other members.
    VisibleRows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    pub total_meals: f64,
    pub total_bazar_cost: f64,
    pub total_deposits: f64,
    pub total_members: u64,
    pub meal_rate: f64,
    pub source: AggregateSource,
}

impl GlobalAggregate {
    pub fn new(
        total_meals: f64,
        total_bazar_cost: f64,
        total_deposits: f64,
        total_members: u64,
        source: AggregateSource,
    ) -> Self {
        Self {
            total_meals,
            total_bazar_cost,
            total_deposits,
            total_members,
            meal_rate: meal_rate(total_bazar_cost, total_meals),
            source,
        }
    }

    pub fn from_raw(raw: &RawAggregates) -> Self {
        Self::new(
            raw.total_meals,
            raw.total_bazar,
            raw.total_deposits,
            raw.total_members,
            AggregateSource::Privileged,
        )
    }

    /// Totals of an already-fetched snapshot, attributed to `source`.
    pub fn from_snapshot(snapshot: &MessSnapshot, source: AggregateSource) -> Self {
        Self::new(
            snapshot.meals.iter().map(|r| r.meal_count).sum(),
            snapshot.bazar.iter().map(|r| r.cost).sum(),
            snapshot.deposits.iter().map(|r| r.amount).sum(),
            snapshot.members.len() as u64,
            source,
        )
    }

    pub fn used_fallback(&self) -> bool {
        self.source == AggregateSource::VisibleRows
    }

    pub fn pool_remaining(&self) -> f64 {
        pool_remaining(self.total_deposits, self.total_bazar_cost)
    }
}

/// Privileged totals when available, otherwise visible-row summation.
///
/// Only a failure of the fallback reads is returned as an error.
pub async fn fetch_global_aggregates(store: &dyn MessStore) -> Result<GlobalAggregate> {
    match store.get_global_aggregates().await {
        Ok(raw) => {
            debug!(
                "Privileged aggregates: {} meals, {} bazar, {} deposits, {} members",
                raw.total_meals, raw.total_bazar, raw.total_deposits, raw.total_members
            );
            Ok(GlobalAggregate::from_raw(&raw))
        }
        Err(e) => {
            warn!(
                "Privileged aggregates unavailable ({}); summing visible rows instead",
                e
            );
            fetch_visible_aggregates(store).await
        }
    }
}

/// Sums unscoped reads of the four tables. Subject to row visibility.
pub async fn fetch_visible_aggregates(store: &dyn MessStore) -> Result<GlobalAggregate> {
    let all = RecordFilter::all();
    let (meals, bazar, deposits, members) = futures::try_join!(
        store.get_meals(&all),
        store.get_bazar(&all),
        store.get_deposits(&all),
        store.get_members(),
    )?;

    Ok(GlobalAggregate::new(
        meals.iter().map(|r| r.meal_count).sum(),
        bazar.iter().map(|r| r.cost).sum(),
        deposits.iter().map(|r| r.amount).sum(),
        members.len() as u64,
        AggregateSource::VisibleRows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BazarRecord, DepositRecord, Member, MealRecord, PaidFrom};
    use crate::store::InMemoryStore;
    use chrono::NaiveDate;

    fn snapshot() -> MessSnapshot {
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let member = |id: &str| Member {
            id: id.to_string(),
            name: Some(id.to_string()),
            email: None,
            phone: None,
            auth_user_id: None,
        };
        MessSnapshot {
            members: vec![member("A"), member("B")],
            meals: vec![
                MealRecord {
                    id: 1,
                    member_id: "A".to_string(),
                    date,
                    meal_count: 10.0,
                    created_at: None,
                },
                MealRecord {
                    id: 2,
                    member_id: "B".to_string(),
                    date,
                    meal_count: 20.0,
                    created_at: None,
                },
            ],
            bazar: vec![BazarRecord {
                id: 3,
                member_id: "B".to_string(),
                item_name: "Fish".to_string(),
                cost: 300.0,
                date,
                paid_from: PaidFrom::Box,
            }],
            deposits: vec![
                DepositRecord {
                    id: 4,
                    member_id: "A".to_string(),
                    amount: 150.0,
                    date,
                },
                DepositRecord {
                    id: 5,
                    member_id: "B".to_string(),
                    amount: 150.0,
                    date,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_privileged_path_sees_everything() {
        let store = InMemoryStore::from_snapshot(snapshot()).visible_only_to("A");
        let totals = fetch_global_aggregates(&store).await.unwrap();

        assert!(!totals.used_fallback());
        assert_eq!(totals.total_meals, 30.0);
        assert_eq!(totals.meal_rate, 10.0);
        assert_eq!(totals.total_members, 2);
        assert_eq!(totals.pool_remaining(), 0.0);
    }

    #[tokio::test]
    async fn test_fallback_is_flagged_and_visibility_limited() {
        let store = InMemoryStore::from_snapshot(snapshot())
            .visible_only_to("A")
            .without_privileged_aggregates();
        let totals = fetch_global_aggregates(&store).await.unwrap();

        assert!(totals.used_fallback());
        assert_eq!(totals.total_meals, 10.0);
        assert_eq!(totals.total_bazar_cost, 0.0);
        assert_eq!(totals.meal_rate, 0.0);
        assert_eq!(totals.total_members, 2);
    }

    #[tokio::test]
    async fn test_privileged_error_also_falls_back() {
        let store = InMemoryStore::from_snapshot(snapshot());
        store.fail_on("get_global_aggregates");
        let totals = fetch_global_aggregates(&store).await.unwrap();
        assert!(totals.used_fallback());
        assert_eq!(totals.meal_rate, 10.0);
    }

    #[tokio::test]
    async fn test_fallback_read_failure_propagates() {
        let store = InMemoryStore::from_snapshot(snapshot()).without_privileged_aggregates();
        store.fail_on("get_bazar");
        let err = fetch_global_aggregates(&store).await.unwrap_err();
        assert!(err.is_data_access());
    }

    #[test]
    fn test_empty_snapshot_has_zero_rate() {
        let totals = GlobalAggregate::from_snapshot(&MessSnapshot::default(), AggregateSource::VisibleRows);
        assert_eq!(totals.meal_rate, 0.0);
        assert!(totals.meal_rate.is_finite());
    }
}
