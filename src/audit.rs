//! Best-effort audit trail for meal, bazar and deposit writes.
//!
//! Audit writes never fail the operation they describe: errors are logged and
//! dropped.

use crate::error::Result;
use crate::schema::{Member, RecordId};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditTable {
    Meals,
    Bazar,
    Deposits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub table_name: AuditTable,
    pub action: AuditAction,
    pub row_id: Option<RecordId>,
    pub actor_member_id: Option<String>,
    pub actor_email: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub source: Option<String>,
}

impl AuditEntry {
    pub fn new(table_name: AuditTable, action: AuditAction, row_id: Option<RecordId>) -> Self {
        Self {
            table_name,
            action,
            row_id,
            actor_member_id: None,
            actor_email: None,
            before: None,
            after: None,
            source: None,
        }
    }

    pub fn by(mut self, actor: &Member) -> Self {
        self.actor_member_id = Some(actor.id.clone());
        self.actor_email = actor.email.clone();
        self
    }

    pub fn before<T: Serialize>(mut self, row: &T) -> Self {
        self.before = serde_json::to_value(row).ok();
        self
    }

    pub fn after<T: Serialize>(mut self, row: &T) -> Self {
        self.after = serde_json::to_value(row).ok();
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// Sink that discards everything.
pub struct NoAudit;

#[async_trait]
impl AuditSink for NoAudit {
    async fn record(&self, _entry: &AuditEntry) -> Result<()> {
        Ok(())
    }
}

pub async fn log_action(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.record(&entry).await {
        warn!(
            "Audit log insert failed for {:?} {:?} (row {:?}): {}",
            entry.table_name, entry.action, entry.row_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessLedgerError;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _entry: &AuditEntry) -> Result<()> {
            Err(MessLedgerError::store("audit_logs.insert", "relation does not exist"))
        }
    }

    #[tokio::test]
    async fn test_log_action_swallows_sink_failures() {
        log_action(
            &BrokenSink,
            AuditEntry::new(AuditTable::Meals, AuditAction::Delete, Some(4)),
        )
        .await;
    }

    #[test]
    fn test_entry_builder_captures_actor_and_rows() {
        let actor = Member {
            id: "m1".to_string(),
            name: Some("Karim".to_string()),
            email: Some("karim@example.com".to_string()),
            phone: None,
            auth_user_id: None,
        };
        let entry = AuditEntry::new(AuditTable::Bazar, AuditAction::Create, Some(11))
            .by(&actor)
            .after(&serde_json::json!({ "cost": 120.0 }))
            .from_source("bazar-form");

        assert_eq!(entry.actor_member_id.as_deref(), Some("m1"));
        assert_eq!(entry.actor_email.as_deref(), Some("karim@example.com"));
        assert_eq!(entry.after.unwrap()["cost"], 120.0);
        assert_eq!(entry.source.as_deref(), Some("bazar-form"));
    }
}
