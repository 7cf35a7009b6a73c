use crate::error::{MessLedgerError, Result};
use crate::rate::{fair_share, net_balance};
use crate::schema::{DatedRecord, DepositRecord, MealRecord, Member, MemberId, RecordId};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub member_id: MemberId,
    pub name: String,
    pub meals: f64,
    pub deposits: f64,
    pub meal_rate: f64,
    pub fair_share: f64,
    pub net_balance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub meals: f64,
    pub deposits: f64,
    pub fair_share: f64,
    pub net_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub meal_rate: f64,
    /// One row per member, sorted by display name.
    pub rows: Vec<LedgerRow>,
    /// Meal records whose member no longer exists; left out of every row.
    pub orphaned_meal_ids: Vec<RecordId>,
    pub orphaned_deposit_ids: Vec<RecordId>,
}

/// Sums `value` per member id.
pub fn sum_by_member<'a, R, F>(records: &'a [R], value: F) -> HashMap<&'a str, f64>
where
    R: DatedRecord,
    F: Fn(&R) -> f64,
{
    let mut sums: HashMap<&str, f64> = HashMap::new();
    for record in records {
        *sums.entry(record.member_id()).or_insert(0.0) += value(record);
    }
    sums
}

/// Builds the per-member ledger for one scope.
///
/// `meals`, `deposits` and `meal_rate` must all describe the same period. Every
/// member gets a row, with zeros when they had no activity.
pub fn build_ledger(
    members: &[Member],
    meals: &[MealRecord],
    deposits: &[DepositRecord],
    meal_rate: f64,
) -> Ledger {
    let meals_by_member = sum_by_member(meals, |r| r.meal_count);
    let deposits_by_member = sum_by_member(deposits, |r| r.amount);

    let mut rows: Vec<LedgerRow> = members
        .iter()
        .map(|member| {
            let member_meals = meals_by_member.get(member.id.as_str()).copied().unwrap_or(0.0);
            let member_deposits = deposits_by_member
                .get(member.id.as_str())
                .copied()
                .unwrap_or(0.0);
            let share = fair_share(member_meals, meal_rate);

            LedgerRow {
                member_id: member.id.clone(),
                name: member.display_name().to_string(),
                meals: member_meals,
                deposits: member_deposits,
                meal_rate,
                fair_share: share,
                net_balance: net_balance(member_deposits, share),
            }
        })
        .collect();

    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.member_id.cmp(&b.member_id)));

    let known: HashSet<&str> = members.iter().map(|m| m.id.as_str()).collect();
    let orphaned_meal_ids = orphans(meals, &known);
    let orphaned_deposit_ids = orphans(deposits, &known);

    if !orphaned_meal_ids.is_empty() || !orphaned_deposit_ids.is_empty() {
        warn!(
            "Ledger skipped {} meal and {} deposit records with no matching member",
            orphaned_meal_ids.len(),
            orphaned_deposit_ids.len()
        );
    }
    debug!("Built ledger of {} rows at rate {:.4}", rows.len(), meal_rate);

    Ledger {
        meal_rate,
        rows,
        orphaned_meal_ids,
        orphaned_deposit_ids,
    }
}

fn orphans<R: DatedRecord>(records: &[R], known: &HashSet<&str>) -> Vec<RecordId> {
    records
        .iter()
        .filter(|r| !known.contains(r.member_id()))
        .map(|r| r.record_id())
        .collect()
}

impl Ledger {
    pub fn row(&self, member_id: &str) -> Option<&LedgerRow> {
        self.rows.iter().find(|r| r.member_id == member_id)
    }

    pub fn totals(&self) -> LedgerTotals {
        self.rows.iter().fold(LedgerTotals::default(), |acc, row| LedgerTotals {
            meals: acc.meals + row.meals,
            deposits: acc.deposits + row.deposits,
            fair_share: acc.fair_share + row.fair_share,
            net_balance: acc.net_balance + row.net_balance,
        })
    }

    /// Checks that fair shares add back up to the period's bazar total.
    ///
    /// Only holds when the rate was derived from these same rows; a period with no
    /// meals charges nobody and is accepted as is.
    pub fn verify_fair_share(
        &self,
        period: &str,
        total_bazar_cost: f64,
        tolerance: f64,
    ) -> Result<()> {
        let totals = self.totals();
        if totals.meals <= 0.0 {
            return Ok(());
        }

        let difference = (totals.fair_share - total_bazar_cost).abs();
        if difference > tolerance {
            return Err(MessLedgerError::FairShareMismatch {
                period: period.to_string(),
                expected: total_bazar_cost,
                actual: totals.fair_share,
                difference,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::meal_rate;
    use chrono::NaiveDate;

    fn member(id: &str, name: Option<&str>, email: Option<&str>) -> Member {
        Member {
            id: id.to_string(),
            name: name.map(str::to_string),
            email: email.map(str::to_string),
            phone: None,
            auth_user_id: None,
        }
    }

    fn meal(id: RecordId, member_id: &str, count: f64) -> MealRecord {
        MealRecord {
            id,
            member_id: member_id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            meal_count: count,
            created_at: None,
        }
    }

    fn deposit(id: RecordId, member_id: &str, amount: f64) -> DepositRecord {
        DepositRecord {
            id,
            member_id: member_id.to_string(),
            amount,
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let members = vec![member("b", Some("B"), None), member("a", Some("A"), None)];
        let meals = vec![meal(1, "a", 4.0), meal(2, "a", 6.0), meal(3, "b", 20.0)];
        let deposits = vec![deposit(4, "a", 150.0), deposit(5, "b", 150.0)];
        let rate = meal_rate(300.0, 30.0);

        let ledger = build_ledger(&members, &meals, &deposits, rate);

        assert_eq!(ledger.rows[0].name, "A");
        assert_eq!(ledger.rows[0].meals, 10.0);
        assert_eq!(ledger.rows[0].fair_share, 100.0);
        assert_eq!(ledger.rows[0].net_balance, 50.0);
        assert_eq!(ledger.rows[1].fair_share, 200.0);
        assert_eq!(ledger.rows[1].net_balance, -50.0);
        assert!(ledger.verify_fair_share("all time", 300.0, 1e-9).is_ok());
    }

    #[test]
    fn test_members_without_activity_still_appear() {
        let members = vec![member("a", Some("A"), None), member("z", None, Some("z@x.com"))];
        let ledger = build_ledger(&members, &[meal(1, "a", 3.0)], &[], 5.0);

        assert_eq!(ledger.rows.len(), 2);
        let idle = ledger.row("z").unwrap();
        assert_eq!(idle.name, "z@x.com");
        assert_eq!(idle.meals, 0.0);
        assert_eq!(idle.deposits, 0.0);
        assert_eq!(idle.fair_share, 0.0);
        assert_eq!(idle.net_balance, 0.0);
    }

    #[test]
    fn test_sort_is_case_sensitive() {
        let members = vec![
            member("1", Some("bob"), None),
            member("2", Some("Carol"), None),
            member("3", Some("alice"), None),
        ];
        let ledger = build_ledger(&members, &[], &[], 0.0);
        let names: Vec<&str> = ledger.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Carol", "alice", "bob"]);
    }

    #[test]
    fn test_orphaned_records_do_not_inflate_rows() {
        let members = vec![member("a", Some("A"), None)];
        let meals = vec![meal(1, "a", 2.0), meal(2, "ghost", 8.0)];
        let deposits = vec![deposit(3, "ghost", 500.0)];

        let ledger = build_ledger(&members, &meals, &deposits, 10.0);

        assert_eq!(ledger.rows.len(), 1);
        assert_eq!(ledger.totals().meals, 2.0);
        assert_eq!(ledger.totals().deposits, 0.0);
        assert_eq!(ledger.orphaned_meal_ids, vec![2]);
        assert_eq!(ledger.orphaned_deposit_ids, vec![3]);
    }

    #[test]
    fn test_net_balance_identity_holds_exactly() {
        let members = vec![member("a", Some("A"), None), member("b", Some("B"), None)];
        let meals = vec![meal(1, "a", 7.5), meal(2, "b", 11.0)];
        let deposits = vec![deposit(3, "a", 333.3)];
        let rate = meal_rate(1234.56, 18.5);

        let ledger = build_ledger(&members, &meals, &deposits, rate);
        for row in &ledger.rows {
            assert_eq!(row.net_balance, row.deposits - row.meals * rate);
        }
        assert!(ledger.verify_fair_share("2025-01", 1234.56, 1e-6).is_ok());
    }

    #[test]
    fn test_mismatch_is_reported() {
        let members = vec![member("a", Some("A"), None)];
        let ledger = build_ledger(&members, &[meal(1, "a", 10.0)], &[], 10.0);
        let err = ledger.verify_fair_share("2025-01", 250.0, 0.01).unwrap_err();
        assert!(matches!(err, MessLedgerError::FairShareMismatch { .. }));
    }
}
