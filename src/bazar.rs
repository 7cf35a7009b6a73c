//! Bazar writes and their deposit side effects.
//!
//! A purchase paid out of a member's own pocket is recorded as the bazar row plus a
//! deposit of the same amount, date and member. The two writes are not atomic, so
//! a failed deposit write is compensated by undoing the bazar write.

use crate::audit::{log_action, AuditAction, AuditEntry, AuditSink, AuditTable};
use crate::error::{MessLedgerError, Result};
use crate::schema::{
    BazarRecord, BazarUpdate, DepositRecord, NewBazar, NewDeposit, PaidFrom, RecordId,
};
use crate::session::Session;
use crate::store::{MessStore, RecordFilter};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};

const AUDIT_SOURCE: &str = "bazar";

/// A purchase as entered by the signed-in member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BazarDraft {
    pub item_name: String,
    pub cost: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub paid_from: PaidFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BazarWriteOutcome {
    pub record: BazarRecord,
    /// Deposit inserted alongside a user-paid purchase.
    pub deposit: Option<DepositRecord>,
    /// Deposit removed when a purchase moved back to the box.
    pub removed_deposit: Option<RecordId>,
    /// Degradations the caller should surface, e.g. an older schema.
    pub warnings: Vec<String>,
}

impl BazarWriteOutcome {
    fn new(record: BazarRecord) -> Self {
        Self {
            record,
            deposit: None,
            removed_deposit: None,
            warnings: Vec::new(),
        }
    }
}

fn validate(item_name: &str, cost: f64) -> Result<()> {
    if item_name.trim().is_empty() {
        return Err(MessLedgerError::InvalidEntry(
            "bazar item name is empty".to_string(),
        ));
    }
    if !cost.is_finite() || cost < 0.0 {
        return Err(MessLedgerError::InvalidAmount(cost));
    }
    Ok(())
}

const MISSING_PAID_FROM: &str =
    "bazar.paid_from column is missing; saved without it. Run the schema migration.";

/// Inserts a purchase for the session member.
///
/// When `paid_from` is [`PaidFrom::User`] a matching deposit is inserted next. If
/// that fails the bazar row is deleted again and the deposit error is returned;
/// if the delete fails too the result is [`MessLedgerError::CompensationFailed`].
pub async fn record_bazar(
    store: &dyn MessStore,
    audit: &dyn AuditSink,
    session: &Session,
    draft: BazarDraft,
) -> Result<BazarWriteOutcome> {
    validate(&draft.item_name, draft.cost)?;
    let capabilities = store.schema_capabilities().await?;
    let member = session.member();

    let record = store
        .insert_bazar(
            NewBazar {
                member_id: member.id.clone(),
                item_name: draft.item_name,
                cost: draft.cost,
                date: draft.date,
                paid_from: draft.paid_from,
            },
            capabilities.bazar_paid_from,
        )
        .await?;
    let mut outcome = BazarWriteOutcome::new(record);
    if !capabilities.bazar_paid_from {
        warn!("Bazar {} saved without paid_from", outcome.record.id);
        outcome.warnings.push(MISSING_PAID_FROM.to_string());
    }

    if draft.paid_from == PaidFrom::User {
        let deposit = NewDeposit {
            member_id: member.id.clone(),
            amount: draft.cost,
            date: draft.date,
        };
        match store.insert_deposit(deposit).await {
            Ok(deposit) => outcome.deposit = Some(deposit),
            Err(cause) => {
                let bazar_id = outcome.record.id;
                warn!(
                    "Deposit for user-paid bazar {} failed ({}); deleting the bazar row",
                    bazar_id, cause
                );
                return match store.delete_bazar(bazar_id).await {
                    Ok(()) => Err(cause),
                    Err(rollback) => Err(MessLedgerError::CompensationFailed {
                        bazar_id,
                        cause: cause.to_string(),
                        rollback: rollback.to_string(),
                    }),
                };
            }
        }
    }

    log_action(
        audit,
        AuditEntry::new(AuditTable::Bazar, AuditAction::Create, Some(outcome.record.id))
            .by(member)
            .after(&outcome.record)
            .from_source(AUDIT_SOURCE),
    )
    .await;
    if let Some(deposit) = &outcome.deposit {
        log_action(
            audit,
            AuditEntry::new(AuditTable::Deposits, AuditAction::Create, Some(deposit.id))
                .by(member)
                .after(deposit)
                .from_source(AUDIT_SOURCE),
        )
        .await;
    }

    info!(
        "Recorded bazar {} ({:.2}, paid from {:?})",
        outcome.record.id, outcome.record.cost, outcome.record.paid_from
    );
    Ok(outcome)
}

/// Oldest deposit of `member_id` with exactly `amount` on `date`.
async fn find_matching_deposit(
    store: &dyn MessStore,
    member_id: &str,
    amount: f64,
    date: NaiveDate,
) -> Result<Option<DepositRecord>> {
    let filter = RecordFilter::between(date, date).with_member(member_id);
    let deposits = store.get_deposits(&filter).await?;
    Ok(deposits
        .into_iter()
        .filter(|d| d.amount == amount)
        .min_by_key(|d| d.id))
}

/// Deletes the oldest deposit matching `amount` and `date`, if any.
async fn remove_matching_deposit(
    store: &dyn MessStore,
    member_id: &str,
    amount: f64,
    date: NaiveDate,
) -> Result<Option<DepositRecord>> {
    match find_matching_deposit(store, member_id, amount, date).await? {
        Some(deposit) => {
            store.delete_deposit(deposit.id).await?;
            Ok(Some(deposit))
        }
        None => Ok(None),
    }
}

fn previous_values(existing: &BazarRecord) -> BazarUpdate {
    BazarUpdate {
        item_name: existing.item_name.clone(),
        cost: existing.cost,
        date: existing.date,
        paid_from: existing.paid_from,
    }
}

/// Writes `revert` back over a bazar row after a failed deposit step and returns
/// the error to report.
async fn restore_bazar(
    store: &dyn MessStore,
    bazar_id: RecordId,
    member_id: &str,
    revert: BazarUpdate,
    cause: MessLedgerError,
) -> MessLedgerError {
    match store.update_bazar(bazar_id, member_id, revert, true).await {
        Ok(_) => cause,
        Err(rollback) => MessLedgerError::CompensationFailed {
            bazar_id,
            cause: cause.to_string(),
            rollback: rollback.to_string(),
        },
    }
}

async fn log_deposit_removal(audit: &dyn AuditSink, session: &Session, deposit: &DepositRecord) {
    log_action(
        audit,
        AuditEntry::new(AuditTable::Deposits, AuditAction::Delete, Some(deposit.id))
            .by(session.member())
            .before(deposit)
            .from_source(AUDIT_SOURCE),
    )
    .await;
}

/// Updates one of the session member's purchases and keeps its deposit in step.
///
/// Box to user inserts a deposit for the new cost and date; a failure restores the
/// previous `paid_from`. User to box removes one deposit matching the purchase as
/// it was before the edit; that removal is best-effort and only warns. A user-paid
/// purchase whose cost or date changes gets a deposit for the new values and loses
/// the old one; if either step fails the row and deposits are put back.
pub async fn update_bazar(
    store: &dyn MessStore,
    audit: &dyn AuditSink,
    session: &Session,
    existing: &BazarRecord,
    update: BazarUpdate,
) -> Result<BazarWriteOutcome> {
    validate(&update.item_name, update.cost)?;
    let capabilities = store.schema_capabilities().await?;
    let member = session.member();

    let record = store
        .update_bazar(existing.id, &member.id, update.clone(), capabilities.bazar_paid_from)
        .await?;
    let mut outcome = BazarWriteOutcome::new(record);
    if !capabilities.bazar_paid_from {
        outcome.warnings.push(
            "bazar.paid_from column is missing; other fields were updated. Run the schema migration."
                .to_string(),
        );
    }

    let transition = (existing.paid_from, outcome.record.paid_from);
    let moved = existing.cost != outcome.record.cost || existing.date != outcome.record.date;
    if capabilities.bazar_paid_from {
        match transition {
            (PaidFrom::Box, PaidFrom::User) => {
                let deposit = NewDeposit {
                    member_id: member.id.clone(),
                    amount: outcome.record.cost,
                    date: outcome.record.date,
                };
                match store.insert_deposit(deposit).await {
                    Ok(deposit) => outcome.deposit = Some(deposit),
                    Err(cause) => {
                        warn!(
                            "Deposit for bazar {} failed ({}); restoring paid_from",
                            existing.id, cause
                        );
                        let revert = BazarUpdate {
                            paid_from: existing.paid_from,
                            ..update
                        };
                        return Err(restore_bazar(store, existing.id, &member.id, revert, cause).await);
                    }
                }
            }
            (PaidFrom::User, PaidFrom::Box) => {
                match remove_matching_deposit(store, &member.id, existing.cost, existing.date).await {
                    Ok(Some(removed)) => {
                        outcome.removed_deposit = Some(removed.id);
                        log_deposit_removal(audit, session, &removed).await;
                    }
                    Ok(None) => outcome
                        .warnings
                        .push("no matching deposit found to remove".to_string()),
                    Err(e) => {
                        warn!("Matching deposit for bazar {} not removed: {}", existing.id, e);
                        outcome
                            .warnings
                            .push(format!("matching deposit was not removed: {}", e));
                    }
                }
            }
            (PaidFrom::User, PaidFrom::User) if moved => {
                let deposit = NewDeposit {
                    member_id: member.id.clone(),
                    amount: outcome.record.cost,
                    date: outcome.record.date,
                };
                let deposit = match store.insert_deposit(deposit).await {
                    Ok(deposit) => deposit,
                    Err(cause) => {
                        warn!(
                            "Replacement deposit for bazar {} failed ({}); restoring the row",
                            existing.id, cause
                        );
                        let revert = previous_values(existing);
                        return Err(restore_bazar(store, existing.id, &member.id, revert, cause).await);
                    }
                };
                match remove_matching_deposit(store, &member.id, existing.cost, existing.date).await {
                    Ok(Some(removed)) => {
                        outcome.removed_deposit = Some(removed.id);
                        log_deposit_removal(audit, session, &removed).await;
                    }
                    Ok(None) => outcome
                        .warnings
                        .push("no deposit matched the purchase before the edit".to_string()),
                    Err(cause) => {
                        warn!(
                            "Old deposit for bazar {} not removed ({}); undoing the edit",
                            existing.id, cause
                        );
                        return Err(match store.delete_deposit(deposit.id).await {
                            Ok(()) => {
                                let revert = previous_values(existing);
                                restore_bazar(store, existing.id, &member.id, revert, cause).await
                            }
                            Err(rollback) => MessLedgerError::CompensationFailed {
                                bazar_id: existing.id,
                                cause: cause.to_string(),
                                rollback: rollback.to_string(),
                            },
                        });
                    }
                }
                outcome.deposit = Some(deposit);
            }
            _ => {}
        }
    }

    log_action(
        audit,
        AuditEntry::new(AuditTable::Bazar, AuditAction::Update, Some(existing.id))
            .by(member)
            .before(existing)
            .after(&outcome.record)
            .from_source(AUDIT_SOURCE),
    )
    .await;
    if let Some(deposit) = &outcome.deposit {
        log_action(
            audit,
            AuditEntry::new(AuditTable::Deposits, AuditAction::Create, Some(deposit.id))
                .by(member)
                .after(deposit)
                .from_source(AUDIT_SOURCE),
        )
        .await;
    }
    Ok(outcome)
}

/// Deletes one of the session member's purchases. Any deposit it produced stays.
pub async fn delete_bazar_entry(
    store: &dyn MessStore,
    audit: &dyn AuditSink,
    session: &Session,
    existing: &BazarRecord,
) -> Result<()> {
    if existing.member_id != session.member_id() {
        return Err(MessLedgerError::NotOwner {
            record_id: existing.id,
            member_id: session.member_id().to_string(),
        });
    }
    store.delete_bazar(existing.id).await?;
    log_action(
        audit,
        AuditEntry::new(AuditTable::Bazar, AuditAction::Delete, Some(existing.id))
            .by(session.member())
            .before(existing)
            .from_source(AUDIT_SOURCE),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoAudit;
    use crate::schema::SchemaCapabilities;
    use crate::session::{open_session, Identity};
    use crate::store::InMemoryStore;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn draft(paid_from: PaidFrom) -> BazarDraft {
        BazarDraft {
            item_name: "Rice".to_string(),
            cost: 640.0,
            date: date(2),
            paid_from,
        }
    }

    async fn session(store: &InMemoryStore) -> Session {
        open_session(
            store,
            Identity {
                user_id: "u1".to_string(),
                email: Some("sumi@mess.test".to_string()),
                display_name: Some("Sumi".to_string()),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_user_paid_purchase_adds_matching_deposit() {
        let store = InMemoryStore::new();
        let session = session(&store).await;

        let outcome = record_bazar(&store, &store, &session, draft(PaidFrom::User))
            .await
            .unwrap();

        let deposit = outcome.deposit.unwrap();
        assert_eq!(deposit.amount, 640.0);
        assert_eq!(deposit.date, date(2));
        assert_eq!(deposit.member_id, session.member_id());
        assert!(outcome.warnings.is_empty());
        assert_eq!(store.audit_log().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_box_purchase_has_no_deposit() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let outcome = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::Box))
            .await
            .unwrap();
        assert!(outcome.deposit.is_none());
        assert!(store.get_deposits(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deposit_rolls_back_bazar() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        store.fail_on("insert_deposit");

        let err = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap_err();
        assert!(err.is_data_access());
        assert!(store.get_bazar(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_reported() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        store.fail_on("insert_deposit");
        store.fail_on("delete_bazar");

        let err = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap_err();
        assert!(matches!(err, MessLedgerError::CompensationFailed { .. }));
    }

    #[tokio::test]
    async fn test_older_schema_saves_without_paid_from() {
        let store = InMemoryStore::new().with_capabilities(SchemaCapabilities {
            bazar_paid_from: false,
            meal_created_at: true,
        });
        let session = session(&store).await;

        let outcome = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::Box))
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_drafts_are_rejected_before_writing() {
        let store = InMemoryStore::new();
        let session = session(&store).await;

        let mut negative = draft(PaidFrom::Box);
        negative.cost = -5.0;
        assert!(matches!(
            record_bazar(&store, &NoAudit, &session, negative).await,
            Err(MessLedgerError::InvalidAmount(_))
        ));

        let mut unnamed = draft(PaidFrom::Box);
        unnamed.item_name = "  ".to_string();
        assert!(matches!(
            record_bazar(&store, &NoAudit, &session, unnamed).await,
            Err(MessLedgerError::InvalidEntry(_))
        ));
        assert!(store.get_bazar(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_switching_to_user_adds_deposit_and_back_removes_it() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::Box))
            .await
            .unwrap()
            .record;

        let to_user = BazarUpdate {
            item_name: saved.item_name.clone(),
            cost: 700.0,
            date: date(3),
            paid_from: PaidFrom::User,
        };
        let outcome = update_bazar(&store, &NoAudit, &session, &saved, to_user)
            .await
            .unwrap();
        assert_eq!(outcome.deposit.as_ref().unwrap().amount, 700.0);
        let user_paid = outcome.record;

        let to_box = BazarUpdate {
            item_name: user_paid.item_name.clone(),
            cost: 710.0,
            date: date(4),
            paid_from: PaidFrom::Box,
        };
        let outcome = update_bazar(&store, &NoAudit, &session, &user_paid, to_box)
            .await
            .unwrap();
        assert!(outcome.removed_deposit.is_some());
        assert!(store.get_deposits(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deposit_on_update_restores_paid_from() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::Box))
            .await
            .unwrap()
            .record;
        store.fail_on("insert_deposit");

        let to_user = BazarUpdate {
            item_name: saved.item_name.clone(),
            cost: saved.cost,
            date: saved.date,
            paid_from: PaidFrom::User,
        };
        assert!(update_bazar(&store, &NoAudit, &session, &saved, to_user)
            .await
            .is_err());

        let rows = store.get_bazar(&RecordFilter::all()).await.unwrap();
        assert_eq!(rows[0].paid_from, PaidFrom::Box);
    }

    #[tokio::test]
    async fn test_delete_only_own_rows() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap()
            .record;

        let mut foreign = saved.clone();
        foreign.member_id = "someone-else".to_string();
        let err = delete_bazar_entry(&store, &NoAudit, &session, &foreign)
            .await
            .unwrap_err();
        assert!(matches!(err, MessLedgerError::NotOwner { .. }));
        assert!(!err.is_data_access());

        delete_bazar_entry(&store, &NoAudit, &session, &saved).await.unwrap();
        assert!(store.get_bazar(&RecordFilter::all()).await.unwrap().is_empty());
        assert_eq!(store.get_deposits(&RecordFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_editing_user_paid_purchase_moves_its_deposit() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap();
        let old_deposit = saved.deposit.unwrap();

        let edit = BazarUpdate {
            item_name: "Rice".to_string(),
            cost: 900.0,
            date: date(5),
            paid_from: PaidFrom::User,
        };
        let outcome = update_bazar(&store, &NoAudit, &session, &saved.record, edit)
            .await
            .unwrap();
        assert_eq!(outcome.removed_deposit, Some(old_deposit.id));

        let deposits = store.get_deposits(&RecordFilter::all()).await.unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].amount, 900.0);
        assert_eq!(deposits[0].date, date(5));
        assert_eq!(deposits[0].member_id, session.member_id());
        assert_eq!(outcome.deposit.as_ref().map(|d| d.id), Some(deposits[0].id));
    }

    #[tokio::test]
    async fn test_renaming_user_paid_purchase_leaves_deposit_alone() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap();

        let rename = BazarUpdate {
            item_name: "Basmati rice".to_string(),
            cost: 640.0,
            date: date(2),
            paid_from: PaidFrom::User,
        };
        let outcome = update_bazar(&store, &NoAudit, &session, &saved.record, rename)
            .await
            .unwrap();
        assert!(outcome.deposit.is_none());
        assert!(outcome.removed_deposit.is_none());
        let deposits = store.get_deposits(&RecordFilter::all()).await.unwrap();
        assert_eq!(deposits, vec![saved.deposit.unwrap()]);
    }

    #[tokio::test]
    async fn test_failed_deposit_move_restores_purchase() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap();
        store.fail_on("insert_deposit");

        let edit = BazarUpdate {
            item_name: "Rice".to_string(),
            cost: 900.0,
            date: date(5),
            paid_from: PaidFrom::User,
        };
        assert!(update_bazar(&store, &NoAudit, &session, &saved.record, edit)
            .await
            .is_err());

        let rows = store.get_bazar(&RecordFilter::all()).await.unwrap();
        assert_eq!(rows, vec![saved.record]);
        let deposits = store.get_deposits(&RecordFilter::all()).await.unwrap();
        assert_eq!(deposits, vec![saved.deposit.unwrap()]);
    }

    #[tokio::test]
    async fn test_stuck_old_deposit_is_reported_when_undo_fails() {
        let store = InMemoryStore::new();
        let session = session(&store).await;
        let saved = record_bazar(&store, &NoAudit, &session, draft(PaidFrom::User))
            .await
            .unwrap();
        store.fail_on("delete_deposit");

        let edit = BazarUpdate {
            item_name: "Rice".to_string(),
            cost: 900.0,
            date: date(5),
            paid_from: PaidFrom::User,
        };
        let err = update_bazar(&store, &NoAudit, &session, &saved.record, edit)
            .await
            .unwrap_err();
        assert!(matches!(err, MessLedgerError::CompensationFailed { .. }));
    }
}
