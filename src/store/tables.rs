use crate::core::audit::{AuditEntry, NewAuditEntry};
use crate::core::currency::{CurrencyPair, ExchangeRate};
use crate::core::expense::{Expense, ExpenseShare};
use crate::core::group::{Group, Participant};
use crate::core::ids::{
    AuditId, EmailLogId, ExpenseId, GroupId, ParticipantId, PaymentId, PeriodId, ShareId,
};
use crate::core::notification::{EmailLog, NotificationKind};
use crate::core::settlement::{SettlementPayment, SettlementPeriod};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sequences {
    group: u64,
    participant: u64,
    expense: u64,
    share: u64,
    period: u64,
    payment: u64,
    audit: u64,
    email_log: u64,
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

/// Every persisted row, keyed by id.
///
/// `Tables` is plain data: a committed snapshot is shared read-only behind
/// an `Arc`, and a write transaction works on its own clone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    groups: BTreeMap<GroupId, Group>,
    participants: BTreeMap<ParticipantId, Participant>,
    expenses: BTreeMap<ExpenseId, Expense>,
    shares: BTreeMap<ShareId, ExpenseShare>,
    periods: BTreeMap<PeriodId, SettlementPeriod>,
    payments: BTreeMap<PaymentId, SettlementPayment>,
    audit: BTreeMap<AuditId, AuditEntry>,
    email_logs: BTreeMap<EmailLogId, EmailLog>,
    /// Keyed by `"FROM/TO"`.
    #[serde(default)]
    exchange_rates: BTreeMap<String, ExchangeRate>,
    sequences: Sequences,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- groups ----

    pub fn next_group_id(&mut self) -> GroupId {
        GroupId::new(bump(&mut self.sequences.group))
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn require_group(&self, id: GroupId) -> Result<&Group, StoreError> {
        self.group(id).ok_or_else(|| StoreError::not_found("group", id))
    }

    pub fn require_group_mut(&mut self, id: GroupId) -> Result<&mut Group, StoreError> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("group", id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group_by_share_token(&self, token: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.share_token == token)
    }

    /// Insert a new group. Share and admin tokens must be unused.
    pub fn insert_group(&mut self, group: Group) -> Result<(), StoreError> {
        if self.groups.contains_key(&group.id) {
            return Err(StoreError::Conflict(format!("{} already exists", group.id)));
        }
        let taken = self.groups.values().any(|g| {
            g.share_token == group.share_token
                || g.admin_token == group.admin_token
                || g.share_token == group.admin_token
                || g.admin_token == group.share_token
        });
        if taken {
            return Err(StoreError::Conflict("group token already in use".into()));
        }
        self.groups.insert(group.id, group);
        Ok(())
    }

    pub fn remove_group(&mut self, id: GroupId) -> usize {
        usize::from(self.groups.remove(&id).is_some())
    }

    // ---- participants ----

    pub fn next_participant_id(&mut self) -> ParticipantId {
        ParticipantId::new(bump(&mut self.sequences.participant))
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Participants of a group in join (id) order.
    pub fn participants_of(&self, group: GroupId) -> Vec<&Participant> {
        self.participants
            .values()
            .filter(|p| p.group_id == group)
            .collect()
    }

    pub fn participant_by_token(&self, token: &str) -> Option<&Participant> {
        self.participants.values().find(|p| p.access_token == token)
    }

    pub fn insert_participant(&mut self, participant: Participant) -> Result<(), StoreError> {
        if !self.groups.contains_key(&participant.group_id) {
            return Err(StoreError::not_found("group", participant.group_id));
        }
        if self
            .participants
            .values()
            .any(|p| p.access_token == participant.access_token)
        {
            return Err(StoreError::Conflict("participant token already in use".into()));
        }
        self.participants.insert(participant.id, participant);
        Ok(())
    }

    pub fn remove_participant(&mut self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id)
    }

    pub fn remove_participants_of(&mut self, group: GroupId) -> usize {
        let before = self.participants.len();
        self.participants.retain(|_, p| p.group_id != group);
        before - self.participants.len()
    }

    // ---- expenses and shares ----

    pub fn next_expense_id(&mut self) -> ExpenseId {
        ExpenseId::new(bump(&mut self.sequences.expense))
    }

    pub fn next_share_id(&mut self) -> ShareId {
        ShareId::new(bump(&mut self.sequences.share))
    }

    pub fn expense(&self, id: ExpenseId) -> Option<&Expense> {
        self.expenses.get(&id)
    }

    pub fn expense_mut(&mut self, id: ExpenseId) -> Option<&mut Expense> {
        self.expenses.get_mut(&id)
    }

    /// All expenses of a group, archived or not, in id order.
    pub fn expenses_of(&self, group: GroupId) -> Vec<&Expense> {
        self.expenses
            .values()
            .filter(|e| e.group_id == group)
            .collect()
    }

    /// Non-archived expenses of a group.
    pub fn active_expenses_of(&self, group: GroupId) -> Vec<&Expense> {
        self.expenses
            .values()
            .filter(|e| e.group_id == group && !e.is_archived)
            .collect()
    }

    pub fn active_expense_ids(&self, group: GroupId) -> Vec<ExpenseId> {
        self.active_expenses_of(group).iter().map(|e| e.id).collect()
    }

    pub fn expenses_paid_by(&self, participant: ParticipantId) -> Vec<ExpenseId> {
        self.expenses
            .values()
            .filter(|e| e.paid_by == participant)
            .map(|e| e.id)
            .collect()
    }

    pub fn insert_expense(&mut self, expense: Expense) -> Result<(), StoreError> {
        if !self.participants.contains_key(&expense.paid_by) {
            return Err(StoreError::not_found("participant", expense.paid_by));
        }
        self.expenses.insert(expense.id, expense);
        Ok(())
    }

    /// Remove an expense together with its shares.
    pub fn remove_expense(&mut self, id: ExpenseId) -> Option<Expense> {
        self.shares.retain(|_, s| s.expense_id != id);
        self.expenses.remove(&id)
    }

    pub fn remove_expenses_of(&mut self, group: GroupId) -> usize {
        let before = self.expenses.len();
        self.expenses.retain(|_, e| e.group_id != group);
        before - self.expenses.len()
    }

    pub fn shares_of(&self, expense: ExpenseId) -> Vec<&ExpenseShare> {
        self.shares
            .values()
            .filter(|s| s.expense_id == expense)
            .collect()
    }

    pub fn insert_share(&mut self, share: ExpenseShare) -> Result<(), StoreError> {
        if !self.expenses.contains_key(&share.expense_id) {
            return Err(StoreError::not_found("expense", share.expense_id));
        }
        self.shares.insert(share.id, share);
        Ok(())
    }

    pub fn remove_shares_of_expense(&mut self, expense: ExpenseId) -> usize {
        let before = self.shares.len();
        self.shares.retain(|_, s| s.expense_id != expense);
        before - self.shares.len()
    }

    pub fn remove_shares_of_participant(&mut self, participant: ParticipantId) -> usize {
        let before = self.shares.len();
        self.shares.retain(|_, s| s.participant_id != participant);
        before - self.shares.len()
    }

    /// Remove every share belonging to an expense of `group`.
    pub fn remove_shares_of_group(&mut self, group: GroupId) -> usize {
        let expenses = &self.expenses;
        let before = self.shares.len();
        self.shares.retain(|_, s| {
            expenses
                .get(&s.expense_id)
                .map_or(true, |e| e.group_id != group)
        });
        before - self.shares.len()
    }

    // ---- settlement periods and payments ----

    pub fn next_period_id(&mut self) -> PeriodId {
        PeriodId::new(bump(&mut self.sequences.period))
    }

    pub fn insert_period(&mut self, period: SettlementPeriod) {
        self.periods.insert(period.id, period);
    }

    pub fn periods_of(&self, group: GroupId) -> Vec<&SettlementPeriod> {
        self.periods
            .values()
            .filter(|p| p.group_id == group)
            .collect()
    }

    pub fn remove_periods_of(&mut self, group: GroupId) -> usize {
        let before = self.periods.len();
        self.periods.retain(|_, p| p.group_id != group);
        before - self.periods.len()
    }

    pub fn next_payment_id(&mut self) -> PaymentId {
        PaymentId::new(bump(&mut self.sequences.payment))
    }

    pub fn insert_payment(&mut self, payment: SettlementPayment) {
        self.payments.insert(payment.id, payment);
    }

    pub fn payment(&self, id: PaymentId) -> Option<&SettlementPayment> {
        self.payments.get(&id)
    }

    pub fn payment_mut(&mut self, id: PaymentId) -> Option<&mut SettlementPayment> {
        self.payments.get_mut(&id)
    }

    pub fn payments_of(&self, group: GroupId) -> Vec<&SettlementPayment> {
        self.payments
            .values()
            .filter(|p| p.group_id == group)
            .collect()
    }

    pub fn remove_payments_of(&mut self, group: GroupId) -> usize {
        let before = self.payments.len();
        self.payments.retain(|_, p| p.group_id != group);
        before - self.payments.len()
    }

    // ---- audit log ----

    /// Append an audit entry and return its id.
    pub fn append_audit(&mut self, group: GroupId, entry: NewAuditEntry, at: DateTime<Utc>) -> AuditId {
        let id = AuditId::new(bump(&mut self.sequences.audit));
        self.audit.insert(
            id,
            AuditEntry {
                id,
                group_id: group,
                action: entry.action,
                description: entry.description,
                details: entry.details,
                performed_by: entry.performed_by,
                participant_id: entry.participant_id,
                expense_id: entry.expense_id,
                created_at: at,
                amended_at: None,
                amendment: None,
            },
        );
        id
    }

    pub fn audit_entry(&self, id: AuditId) -> Option<&AuditEntry> {
        self.audit.get(&id)
    }

    pub(crate) fn audit_entry_mut(&mut self, id: AuditId) -> Option<&mut AuditEntry> {
        self.audit.get_mut(&id)
    }

    /// Audit entries for a group, newest first, at most `limit`.
    pub fn audit_of(&self, group: GroupId, limit: usize) -> Vec<&AuditEntry> {
        self.audit
            .values()
            .rev()
            .filter(|a| a.group_id == group)
            .take(limit)
            .collect()
    }

    pub fn remove_audit_of(&mut self, group: GroupId) -> usize {
        let before = self.audit.len();
        self.audit.retain(|_, a| a.group_id != group);
        before - self.audit.len()
    }

    // ---- email log ----

    #[allow(clippy::too_many_arguments)]
    pub fn record_email(
        &mut self,
        recipient: &str,
        kind: NotificationKind,
        group_id: Option<GroupId>,
        participant_id: Option<ParticipantId>,
        subject: &str,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> EmailLogId {
        let id = EmailLogId::new(bump(&mut self.sequences.email_log));
        self.email_logs.insert(
            id,
            EmailLog {
                id,
                recipient: recipient.to_string(),
                kind,
                group_id,
                participant_id,
                subject: subject.to_string(),
                success: error.is_none(),
                error,
                sent_at: at,
            },
        );
        id
    }

    /// Downgrade a reserved row after the mailer rejected the message.
    pub fn mark_email_failed(&mut self, id: EmailLogId, error: String) -> bool {
        match self.email_logs.get_mut(&id) {
            Some(log) => {
                log.success = false;
                log.error = Some(error);
                true
            }
            None => false,
        }
    }

    pub fn email_logs(&self) -> impl Iterator<Item = &EmailLog> {
        self.email_logs.values()
    }

    /// Successful sends to `recipient` since `since`, optionally narrowed
    /// to one notification kind and one group.
    pub fn count_sent(
        &self,
        recipient: &str,
        kind: Option<NotificationKind>,
        group: Option<GroupId>,
        since: DateTime<Utc>,
    ) -> usize {
        self.email_logs
            .values()
            .filter(|l| l.success && l.sent_at >= since && l.recipient == recipient)
            .filter(|l| kind.map_or(true, |k| l.kind == k))
            .filter(|l| group.map_or(true, |g| l.group_id == Some(g)))
            .count()
    }

    pub fn remove_email_logs_of(&mut self, group: GroupId) -> usize {
        let before = self.email_logs.len();
        self.email_logs.retain(|_, l| l.group_id != Some(group));
        before - self.email_logs.len()
    }

    pub fn exchange_rate(&self, pair: &CurrencyPair) -> Option<&ExchangeRate> {
        self.exchange_rates.get(&pair.to_string())
    }

    pub fn exchange_rates(&self) -> impl Iterator<Item = &ExchangeRate> {
        self.exchange_rates.values()
    }

    /// Insert or overwrite the rate for its pair.
    pub fn upsert_exchange_rate(&mut self, rate: ExchangeRate) {
        self.exchange_rates.insert(rate.pair().to_string(), rate);
    }

    /// Drop rates last updated before `cutoff`; returns the pairs removed.
    pub fn remove_exchange_rates_before(&mut self, cutoff: DateTime<Utc>) -> Vec<CurrencyPair> {
        let stale: Vec<String> = self
            .exchange_rates
            .iter()
            .filter(|(_, r)| r.updated_at < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .iter()
            .filter_map(|key| self.exchange_rates.remove(key))
            .map(|r| r.pair())
            .collect()
    }
}
