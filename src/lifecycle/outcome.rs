use crate::core::ids::{AuditId, GroupId};
use crate::notify::DeliverySummary;
use crate::optimization::netting::Transfer;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Result of a lifecycle call that may legitimately do nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Transition<T> {
    Applied(T),
    /// Nothing changed; the message says why.
    Unchanged(String),
}

impl<T> Transition<T> {
    pub fn unchanged(reason: impl Into<String>) -> Self {
        Transition::Unchanged(reason.into())
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Transition::Applied(v) => Some(v),
            Transition::Unchanged(_) => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Which flow produced a [`SettlementOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Final,
    Period,
    Recurring,
    Expiration,
    ExpirationWithoutExpenses,
    DateAdvanced,
}

impl fmt::Display for SettlementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SettlementKind::Final => "final settlement",
            SettlementKind::Period => "period settlement",
            SettlementKind::Recurring => "recurring settlement",
            SettlementKind::Expiration => "expiration settlement",
            SettlementKind::ExpirationWithoutExpenses => "expiration without settlement",
            SettlementKind::DateAdvanced => "settlement date advanced",
        };
        f.write_str(label)
    }
}

/// What a settlement flow did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementOutcome {
    pub group_id: GroupId,
    pub kind: SettlementKind,
    pub period_name: Option<String>,
    pub expenses_archived: usize,
    pub total_amount: Decimal,
    pub participant_count: usize,
    pub transfers: Vec<Transfer>,
    pub next_settlement_date: Option<DateTime<Utc>>,
    pub audit_id: AuditId,
    pub delivery: DeliverySummary,
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ({}) ===", self.kind, self.group_id)?;
        if let Some(period) = &self.period_name {
            writeln!(f, "Period:          {period}")?;
        }
        writeln!(f, "Expenses:        {}", self.expenses_archived)?;
        writeln!(f, "Total:           {}", self.total_amount)?;
        writeln!(f, "Transfers:       {}", self.transfers.len())?;
        writeln!(
            f,
            "Emails:          {} sent, {} failed, {} without email",
            self.delivery.sent,
            self.delivery.failed.len(),
            self.delivery.no_email
        )?;
        if let Some(next) = self.next_settlement_date {
            writeln!(f, "Next settlement: {}", next.to_rfc3339())?;
        }
        Ok(())
    }
}

/// What [`reopen`](crate::lifecycle::SettlementManager::reopen) changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReopenOutcome {
    pub was_expired: bool,
    pub was_settled: bool,
    pub expiration_removed: bool,
}

/// Rows removed by a group deletion, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionSummary {
    pub group_name: String,
    pub email_logs: usize,
    pub audit_logs: usize,
    pub settlement_payments: usize,
    pub expense_shares: usize,
    pub expenses: usize,
    pub participants: usize,
    pub settlement_periods: usize,
    pub groups: usize,
    pub notifications: DeliverySummary,
}

impl fmt::Display for DeletionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Deleted '{}' ===", self.group_name)?;
        writeln!(f, "Email logs:          {}", self.email_logs)?;
        writeln!(f, "Audit logs:          {}", self.audit_logs)?;
        writeln!(f, "Settlement payments: {}", self.settlement_payments)?;
        writeln!(f, "Expense shares:      {}", self.expense_shares)?;
        writeln!(f, "Expenses:            {}", self.expenses)?;
        writeln!(f, "Participants:        {}", self.participants)?;
        writeln!(f, "Settlement periods:  {}", self.settlement_periods)?;
        Ok(())
    }
}
