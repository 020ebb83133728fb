use crate::core::ids::{AuditId, ExpenseId, GroupId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Tag identifying what an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GroupCreated,
    ParticipantAdded,
    ParticipantRemoved,
    ParticipantLeft,
    ParticipantInvited,
    ExpensesTransferred,
    ExpenseAdded,
    ExpenseEdited,
    ExpenseDeleted,
    GroupSettled,
    GroupSettledPeriod,
    GroupSettledRecurring,
    GroupExpiredSettled,
    GroupExpiredNoSettlement,
    GroupReopened,
    ExpirationRemoved,
    SettlementDateChanged,
    ExpirationDateChanged,
    PaymentMarkedPaid,
    PaymentMarkedUnpaid,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::GroupCreated => "group_created",
            AuditAction::ParticipantAdded => "participant_added",
            AuditAction::ParticipantRemoved => "participant_removed",
            AuditAction::ParticipantLeft => "participant_left",
            AuditAction::ParticipantInvited => "participant_invited",
            AuditAction::ExpensesTransferred => "expenses_transferred",
            AuditAction::ExpenseAdded => "expense_added",
            AuditAction::ExpenseEdited => "expense_edited",
            AuditAction::ExpenseDeleted => "expense_deleted",
            AuditAction::GroupSettled => "group_settled",
            AuditAction::GroupSettledPeriod => "group_settled_period",
            AuditAction::GroupSettledRecurring => "group_settled_recurring",
            AuditAction::GroupExpiredSettled => "group_expired_settled",
            AuditAction::GroupExpiredNoSettlement => "group_expired_no_settlement",
            AuditAction::GroupReopened => "group_reopened",
            AuditAction::ExpirationRemoved => "expiration_removed",
            AuditAction::SettlementDateChanged => "settlement_date_changed",
            AuditAction::ExpirationDateChanged => "expiration_date_changed",
            AuditAction::PaymentMarkedPaid => "payment_marked_paid",
            AuditAction::PaymentMarkedUnpaid => "payment_marked_unpaid",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of something that happened to a group.
///
/// The only permitted change after insert is [`AuditEntry::amend`], used to
/// attach delivery statistics that are known only after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub group_id: GroupId,
    pub action: AuditAction,
    pub description: String,
    pub details: Value,
    pub performed_by: String,
    pub participant_id: Option<ParticipantId>,
    pub expense_id: Option<ExpenseId>,
    pub created_at: DateTime<Utc>,
    pub amended_at: Option<DateTime<Utc>>,
    /// Text the last amendment appended to `description`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amendment: Option<String>,
}

impl AuditEntry {
    /// Merge `extra` into the details object and append `suffix` to the
    /// description. Existing keys are overwritten and a previous suffix is
    /// replaced, so amending twice leaves one suffix.
    pub fn amend(&mut self, suffix: &str, extra: Map<String, Value>, at: DateTime<Utc>) {
        match &mut self.details {
            Value::Object(details) => details.extend(extra),
            other => {
                let mut details = Map::new();
                details.insert("original".to_string(), other.take());
                details.extend(extra);
                *other = Value::Object(details);
            }
        }
        if let Some(previous) = self.amendment.take() {
            if let Some(base) = self.description.strip_suffix(previous.as_str()) {
                self.description.truncate(base.len());
            }
        }
        if !suffix.is_empty() {
            self.description.push_str(suffix);
            self.amendment = Some(suffix.to_string());
        }
        self.amended_at = Some(at);
    }
}

/// Fields for a new audit entry; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub description: String,
    pub details: Value,
    pub performed_by: String,
    pub participant_id: Option<ParticipantId>,
    pub expense_id: Option<ExpenseId>,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, description: impl Into<String>, details: Value, performed_by: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            details,
            performed_by: performed_by.into(),
            participant_id: None,
            expense_id: None,
        }
    }

    pub fn participant(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn expense(mut self, id: ExpenseId) -> Self {
        self.expense_id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_action_serializes_snake_case() {
        let s = serde_json::to_string(&AuditAction::GroupExpiredNoSettlement).unwrap();
        assert_eq!(s, "\"group_expired_no_settlement\"");
        assert_eq!(AuditAction::GroupSettledPeriod.as_str(), "group_settled_period");
    }

    #[test]
    fn test_amend_merges_details() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entry = AuditEntry {
            id: AuditId::new(1),
            group_id: GroupId::new(1),
            action: AuditAction::GroupSettled,
            description: "Group settled.".into(),
            details: json!({"period_name": "2024-01-FINAL"}),
            performed_by: "Admin".into(),
            participant_id: None,
            expense_id: None,
            created_at: at,
            amended_at: None,
            amendment: None,
        };
        let mut extra = Map::new();
        extra.insert("emails_sent".into(), json!(2));
        entry.amend(" 2 email reports sent.", extra, at);

        assert_eq!(entry.details["period_name"], "2024-01-FINAL");
        assert_eq!(entry.details["emails_sent"], 2);
        assert_eq!(entry.description, "Group settled. 2 email reports sent.");
        assert_eq!(entry.amended_at, Some(at));
    }

    #[test]
    fn test_amend_twice_keeps_one_suffix() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entry = AuditEntry {
            id: AuditId::new(2),
            group_id: GroupId::new(1),
            action: AuditAction::GroupSettledPeriod,
            description: "Period settled.".into(),
            details: json!("legacy"),
            performed_by: "System (Auto-settlement)".into(),
            participant_id: None,
            expense_id: None,
            created_at: at,
            amended_at: None,
            amendment: None,
        };
        entry.amend(" 2 email reports sent.", Map::new(), at);
        entry.amend(" 2 email reports sent.", Map::new(), at);
        assert_eq!(entry.description, "Period settled. 2 email reports sent.");

        let later = at + chrono::Duration::minutes(5);
        let mut extra = Map::new();
        extra.insert("emails_sent".into(), json!(3));
        entry.amend(" 3 email reports sent.", extra, later);
        assert_eq!(entry.description, "Period settled. 3 email reports sent.");
        assert_eq!(entry.details["original"], "legacy");
        assert_eq!(entry.details["emails_sent"], 3);
        assert_eq!(entry.amended_at, Some(later));
    }
}
