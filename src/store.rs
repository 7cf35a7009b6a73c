//! The data-store seam.
//!
//! Persistence, row-level visibility and change notification live behind
//! [`MessStore`]. [`InMemoryStore`] is a complete in-process implementation used by
//! tests and demos; it can simulate per-member visibility, a missing privileged
//! aggregate operation, older schemas and failing operations.

use crate::audit::{AuditEntry, AuditSink};
use crate::changes::{ChangeEvent, ChangeFeed, ChangeKind, ChangeTable};
use crate::error::{MessLedgerError, Result};
use crate::schema::*;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Optional member and inclusive date-range scope for a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub member_id: Option<MemberId>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_member(member_id: impl Into<MemberId>) -> Self {
        Self {
            member_id: Some(member_id.into()),
            ..Self::default()
        }
    }

    pub fn between(date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            date_from: Some(date_from),
            date_to: Some(date_to),
            ..Self::default()
        }
    }

    pub fn with_member(mut self, member_id: impl Into<MemberId>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    pub fn matches<R: DatedRecord>(&self, record: &R) -> bool {
        self.member_id
            .as_deref()
            .map_or(true, |id| record.member_id() == id)
            && self.date_from.map_or(true, |from| record.date() >= from)
            && self.date_to.map_or(true, |to| record.date() <= to)
    }
}

#[async_trait]
pub trait MessStore: Send + Sync {
    async fn get_members(&self) -> Result<Vec<Member>>;

    async fn get_meals(&self, filter: &RecordFilter) -> Result<Vec<MealRecord>>;

    async fn get_bazar(&self, filter: &RecordFilter) -> Result<Vec<BazarRecord>>;

    async fn get_deposits(&self, filter: &RecordFilter) -> Result<Vec<DepositRecord>>;

    /// Totals across every member regardless of row visibility. Stores that cannot
    /// offer this return an error and callers fall back to summing visible rows.
    async fn get_global_aggregates(&self) -> Result<RawAggregates> {
        Err(MessLedgerError::Unsupported(
            "get_global_aggregates".to_string(),
        ))
    }

    async fn schema_capabilities(&self) -> Result<SchemaCapabilities> {
        Ok(SchemaCapabilities::default())
    }

    async fn find_member_by_auth_id(&self, auth_user_id: &str) -> Result<Option<Member>>;

    async fn insert_member(&self, member: NewMember) -> Result<Member>;

    async fn insert_meal(&self, meal: NewMeal) -> Result<MealRecord>;

    async fn update_meal_count(&self, id: RecordId, meal_count: f64) -> Result<MealRecord>;

    async fn delete_meal(&self, id: RecordId) -> Result<()>;

    /// `with_paid_from = false` leaves the column out of the write entirely.
    async fn insert_bazar(&self, bazar: NewBazar, with_paid_from: bool) -> Result<BazarRecord>;

    /// Updates a row owned by `member_id`; rows of other members are not found.
    async fn update_bazar(
        &self,
        id: RecordId,
        member_id: &str,
        update: BazarUpdate,
        with_paid_from: bool,
    ) -> Result<BazarRecord>;

    async fn delete_bazar(&self, id: RecordId) -> Result<()>;

    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<DepositRecord>;

    async fn delete_deposit(&self, id: RecordId) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    next_id: RecordId,
    members: Vec<Member>,
    meals: Vec<MealRecord>,
    bazar: Vec<BazarRecord>,
    deposits: Vec<DepositRecord>,
    audit_log: Vec<AuditEntry>,
}

impl Tables {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

pub struct InMemoryStore {
    tables: Mutex<Tables>,
    visible_member: Option<MemberId>,
    privileged_aggregates: bool,
    capabilities: SchemaCapabilities,
    failing: Mutex<HashSet<String>>,
    changes: ChangeFeed,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            visible_member: None,
            privileged_aggregates: true,
            capabilities: SchemaCapabilities::default(),
            failing: Mutex::new(HashSet::new()),
            changes: ChangeFeed::new(),
        }
    }

    pub fn from_snapshot(snapshot: MessSnapshot) -> Self {
        let store = Self::new();
        if let Ok(mut tables) = store.tables.lock() {
            tables.next_id = snapshot
                .meals
                .iter()
                .map(|r| r.id)
                .chain(snapshot.bazar.iter().map(|r| r.id))
                .chain(snapshot.deposits.iter().map(|r| r.id))
                .max()
                .unwrap_or(0);
            tables.members = snapshot.members;
            tables.meals = snapshot.meals;
            tables.bazar = snapshot.bazar;
            tables.deposits = snapshot.deposits;
        }
        store
    }

    /// Simulates a row-level access policy: meal, bazar and deposit reads only
    /// return rows of `member_id`. Members stay fully visible.
    pub fn visible_only_to(mut self, member_id: impl Into<MemberId>) -> Self {
        self.visible_member = Some(member_id.into());
        self
    }

    pub fn without_privileged_aggregates(mut self) -> Self {
        self.privileged_aggregates = false;
        self
    }

    pub fn with_capabilities(mut self, capabilities: SchemaCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Makes every call of the named trait operation fail with a store error.
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation.to_string());
        }
    }

    pub fn recover(&self, operation: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(operation);
        }
    }

    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }

    pub fn snapshot(&self) -> Result<MessSnapshot> {
        let tables = self.tables("snapshot")?;
        Ok(MessSnapshot {
            members: tables.members.clone(),
            meals: tables.meals.clone(),
            bazar: tables.bazar.clone(),
            deposits: tables.deposits.clone(),
        })
    }

    pub fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.tables("audit_log")?.audit_log.clone())
    }

    fn tables(&self, operation: &str) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| MessLedgerError::store(operation, "store lock poisoned"))
    }

    fn check(&self, operation: &str) -> Result<()> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| MessLedgerError::store(operation, "store lock poisoned"))?;
        if failing.contains(operation) {
            return Err(MessLedgerError::store(operation, "injected failure"));
        }
        Ok(())
    }

    fn visible<R: DatedRecord>(&self, record: &R) -> bool {
        self.visible_member
            .as_deref()
            .map_or(true, |id| record.member_id() == id)
    }

    fn read<R: DatedRecord + Clone>(&self, rows: &[R], filter: &RecordFilter) -> Vec<R> {
        rows.iter()
            .filter(|r| self.visible(*r) && filter.matches(*r))
            .cloned()
            .collect()
    }

    fn notify(&self, table: ChangeTable, kind: ChangeKind, row_id: Option<RecordId>) {
        self.changes.publish(ChangeEvent {
            table,
            kind,
            row_id,
        });
    }
}

fn not_found(operation: &str, id: RecordId) -> MessLedgerError {
    MessLedgerError::store(operation, format!("row {} not found", id))
}

#[async_trait]
impl MessStore for InMemoryStore {
    async fn get_members(&self) -> Result<Vec<Member>> {
        self.check("get_members")?;
        Ok(self.tables("get_members")?.members.clone())
    }

    async fn get_meals(&self, filter: &RecordFilter) -> Result<Vec<MealRecord>> {
        self.check("get_meals")?;
        let tables = self.tables("get_meals")?;
        Ok(self.read(&tables.meals, filter))
    }

    async fn get_bazar(&self, filter: &RecordFilter) -> Result<Vec<BazarRecord>> {
        self.check("get_bazar")?;
        let tables = self.tables("get_bazar")?;
        Ok(self.read(&tables.bazar, filter))
    }

    async fn get_deposits(&self, filter: &RecordFilter) -> Result<Vec<DepositRecord>> {
        self.check("get_deposits")?;
        let tables = self.tables("get_deposits")?;
        Ok(self.read(&tables.deposits, filter))
    }

    async fn get_global_aggregates(&self) -> Result<RawAggregates> {
        if !self.privileged_aggregates {
            return Err(MessLedgerError::Unsupported(
                "get_global_aggregates".to_string(),
            ));
        }
        self.check("get_global_aggregates")?;
        let tables = self.tables("get_global_aggregates")?;
        Ok(RawAggregates {
            total_meals: tables.meals.iter().map(|r| r.meal_count).sum(),
            total_bazar: tables.bazar.iter().map(|r| r.cost).sum(),
            total_deposits: tables.deposits.iter().map(|r| r.amount).sum(),
            total_members: tables.members.len() as u64,
        })
    }

    async fn schema_capabilities(&self) -> Result<SchemaCapabilities> {
        self.check("schema_capabilities")?;
        Ok(self.capabilities)
    }

    async fn find_member_by_auth_id(&self, auth_user_id: &str) -> Result<Option<Member>> {
        self.check("find_member_by_auth_id")?;
        Ok(self
            .tables("find_member_by_auth_id")?
            .members
            .iter()
            .find(|m| m.auth_user_id.as_deref() == Some(auth_user_id))
            .cloned())
    }

    async fn insert_member(&self, member: NewMember) -> Result<Member> {
        self.check("insert_member")?;
        let created = {
            let mut tables = self.tables("insert_member")?;
            let id = tables.allocate_id();
            let created = Member {
                id: format!("member-{}", id),
                name: member.name,
                email: member.email,
                phone: member.phone,
                auth_user_id: member.auth_user_id,
            };
            tables.members.push(created.clone());
            created
        };
        self.notify(ChangeTable::Members, ChangeKind::Insert, None);
        Ok(created)
    }

    async fn insert_meal(&self, meal: NewMeal) -> Result<MealRecord> {
        self.check("insert_meal")?;
        let created = {
            let mut tables = self.tables("insert_meal")?;
            let id = tables.allocate_id();
            let created = MealRecord {
                id,
                member_id: meal.member_id,
                date: meal.date,
                meal_count: meal.meal_count,
                created_at: self.capabilities.meal_created_at.then(Utc::now),
            };
            tables.meals.push(created.clone());
            created
        };
        self.notify(ChangeTable::Meals, ChangeKind::Insert, Some(created.id));
        Ok(created)
    }

    async fn update_meal_count(&self, id: RecordId, meal_count: f64) -> Result<MealRecord> {
        self.check("update_meal_count")?;
        let updated = {
            let mut tables = self.tables("update_meal_count")?;
            let row = tables
                .meals
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| not_found("update_meal_count", id))?;
            row.meal_count = meal_count;
            row.clone()
        };
        self.notify(ChangeTable::Meals, ChangeKind::Update, Some(id));
        Ok(updated)
    }

    async fn delete_meal(&self, id: RecordId) -> Result<()> {
        self.check("delete_meal")?;
        {
            let mut tables = self.tables("delete_meal")?;
            let before = tables.meals.len();
            tables.meals.retain(|r| r.id != id);
            if tables.meals.len() == before {
                return Err(not_found("delete_meal", id));
            }
        }
        self.notify(ChangeTable::Meals, ChangeKind::Delete, Some(id));
        Ok(())
    }

    async fn insert_bazar(&self, bazar: NewBazar, with_paid_from: bool) -> Result<BazarRecord> {
        self.check("insert_bazar")?;
        if with_paid_from && !self.capabilities.bazar_paid_from {
            return Err(MessLedgerError::store(
                "insert_bazar",
                "column bazar.paid_from does not exist",
            ));
        }
        let created = {
            let mut tables = self.tables("insert_bazar")?;
            let id = tables.allocate_id();
            let created = BazarRecord {
                id,
                member_id: bazar.member_id,
                item_name: bazar.item_name,
                cost: bazar.cost,
                date: bazar.date,
                paid_from: if with_paid_from {
                    bazar.paid_from
                } else {
                    PaidFrom::default()
                },
            };
            tables.bazar.push(created.clone());
            created
        };
        self.notify(ChangeTable::Bazar, ChangeKind::Insert, Some(created.id));
        Ok(created)
    }

    async fn update_bazar(
        &self,
        id: RecordId,
        member_id: &str,
        update: BazarUpdate,
        with_paid_from: bool,
    ) -> Result<BazarRecord> {
        self.check("update_bazar")?;
        if with_paid_from && !self.capabilities.bazar_paid_from {
            return Err(MessLedgerError::store(
                "update_bazar",
                "column bazar.paid_from does not exist",
            ));
        }
        let updated = {
            let mut tables = self.tables("update_bazar")?;
            let row = tables
                .bazar
                .iter_mut()
                .find(|r| r.id == id && r.member_id == member_id)
                .ok_or_else(|| not_found("update_bazar", id))?;
            row.item_name = update.item_name;
            row.cost = update.cost;
            row.date = update.date;
            if with_paid_from {
                row.paid_from = update.paid_from;
            }
            row.clone()
        };
        self.notify(ChangeTable::Bazar, ChangeKind::Update, Some(id));
        Ok(updated)
    }

    async fn delete_bazar(&self, id: RecordId) -> Result<()> {
        self.check("delete_bazar")?;
        {
            let mut tables = self.tables("delete_bazar")?;
            let before = tables.bazar.len();
            tables.bazar.retain(|r| r.id != id);
            if tables.bazar.len() == before {
                return Err(not_found("delete_bazar", id));
            }
        }
        self.notify(ChangeTable::Bazar, ChangeKind::Delete, Some(id));
        Ok(())
    }

    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<DepositRecord> {
        self.check("insert_deposit")?;
        let created = {
            let mut tables = self.tables("insert_deposit")?;
            let id = tables.allocate_id();
            let created = DepositRecord {
                id,
                member_id: deposit.member_id,
                amount: deposit.amount,
                date: deposit.date,
            };
            tables.deposits.push(created.clone());
            created
        };
        self.notify(ChangeTable::Deposits, ChangeKind::Insert, Some(created.id));
        Ok(created)
    }

    async fn delete_deposit(&self, id: RecordId) -> Result<()> {
        self.check("delete_deposit")?;
        {
            let mut tables = self.tables("delete_deposit")?;
            let before = tables.deposits.len();
            tables.deposits.retain(|r| r.id != id);
            if tables.deposits.len() == before {
                return Err(not_found("delete_deposit", id));
            }
        }
        self.notify(ChangeTable::Deposits, ChangeKind::Delete, Some(id));
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.check("audit")?;
        self.tables("audit")?.audit_log.push(entry.clone());
        Ok(())
    }
}
