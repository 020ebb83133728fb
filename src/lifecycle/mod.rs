//! Settlement lifecycle of a group.
//!
//! A group moves between four states (see [`GroupState`](crate::core::group::GroupState)):
//!
//! ```text
//!   Open ──settle_period──▶ PeriodSettled ──settle_period──▶ PeriodSettled
//!    │                           │
//!    ├──settle_final─────────────┴──▶ FinalSettled
//!    └──process_expiration───────────▶ Expired
//!   FinalSettled / Expired ──reopen──▶ Open
//! ```
//!
//! Every transition locks the group row, re-checks its preconditions under
//! the lock, and commits exactly one audit entry with its state change.
//! Settlement reports go out only after the commit, and their delivery
//! statistics are attached to the audit entry in a second, independent
//! transaction ([`SettlementManager::finalize_audit`]).

pub mod dates;
pub mod outcome;

pub use outcome::{DeletionSummary, ReopenOutcome, SettlementKind, SettlementOutcome, Transition};

use crate::context::Context;
use crate::core::actor::Actor;
use crate::core::audit::{AuditAction, NewAuditEntry};
use crate::core::group::Group;
use crate::core::ids::{AuditId, GroupId, ParticipantId, PeriodId};
use crate::core::ledger::Ledger;
use crate::core::notification::NotificationKind;
use crate::core::settlement::{
    expiration_period_label, final_period_label, period_label, SettlementPayment, SettlementPeriod,
};
use crate::error::{Error, Result};
use crate::notify::report::{self, ReportVariant, SettlementReport};
use crate::notify::{DeliverySummary, NotificationRequest};
use crate::optimization::{BalanceEngine, NettingEngine, SettlementPlan};
use crate::store::{Tables, Transaction};
use chrono::{DateTime, Utc};
use dates::next_settlement_after;
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `performed_by` for scheduler-driven recurring settlements.
pub const AUTO_SETTLEMENT_ACTOR: &str = "System (Auto-Settlement)";
/// `performed_by` for scheduler-driven expirations.
pub const AUTO_EXPIRATION_ACTOR: &str = "System (Auto-Expiration)";
/// `performed_by` for operator overrides from the command line.
pub const CLI_ACTOR: &str = "System (CLI)";

fn require_admin(actor: &Actor) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

struct Member {
    id: ParticipantId,
    email: Option<String>,
    access_token: String,
}

/// Who gets a report, captured inside the transaction and used after it.
struct Audience {
    group_name: String,
    share_token: String,
    names: BTreeMap<ParticipantId, String>,
    members: Vec<Member>,
}

impl Audience {
    fn of(tables: &Tables, group: &Group) -> Self {
        let participants = tables.participants_of(group.id);
        Self {
            group_name: group.name.clone(),
            share_token: group.share_token.clone(),
            names: participants.iter().map(|p| (p.id, p.name.clone())).collect(),
            members: participants
                .iter()
                .map(|p| Member {
                    id: p.id,
                    email: p.email.clone().filter(|_| p.has_email()),
                    access_token: p.access_token.clone(),
                })
                .collect(),
        }
    }
}

/// What archiving a group's current expenses produced.
struct Archive {
    period_name: String,
    expenses_archived: usize,
    total_amount: Decimal,
    participant_count: usize,
    ledger: Ledger,
    plan: SettlementPlan,
}

impl Archive {
    fn details(&self, settlement_type: &str, group_closed: bool) -> Value {
        json!({
            "settlement_type": settlement_type,
            "period_name": self.period_name,
            "expenses_archived": self.expenses_archived,
            "total_amount": self.total_amount,
            "participants_count": self.participant_count,
            "transfers": self.plan.len(),
            "group_closed": group_closed,
        })
    }

    fn into_outcome(
        self,
        group_id: GroupId,
        kind: SettlementKind,
        next_settlement_date: Option<DateTime<Utc>>,
        audit_id: AuditId,
        delivery: DeliverySummary,
    ) -> SettlementOutcome {
        SettlementOutcome {
            group_id,
            kind,
            period_name: Some(self.period_name),
            expenses_archived: self.expenses_archived,
            total_amount: self.total_amount,
            participant_count: self.participant_count,
            transfers: self.plan.into_transfers(),
            next_settlement_date,
            audit_id,
            delivery,
        }
    }
}

/// Runs the settlement state machine against the store.
pub struct SettlementManager {
    ctx: Arc<Context>,
}

impl SettlementManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Settle every current expense and close the group.
    pub fn settle_final(&self, group_id: GroupId, actor: &Actor) -> Result<SettlementOutcome> {
        require_admin(actor)?;
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        if !group.is_active {
            return Err(Error::GroupClosed(group_id));
        }
        if group.is_expired(now) {
            return Err(Error::GroupExpired(group_id));
        }
        if group.is_settled {
            return Err(Error::AlreadySettled(group_id));
        }

        let archive = self.archive_current(tx.tables_mut(), &group, final_period_label(now), now)?;
        let audience = Audience::of(tx.tables(), &group);
        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.is_settled = true;
        row.settled_at = Some(now);
        row.updated_at = now;

        let entry = NewAuditEntry::new(
            AuditAction::GroupSettled,
            format!(
                "Group settled and closed: {} expenses archived to period {}.",
                archive.expenses_archived, archive.period_name
            ),
            archive.details("final_settlement", true),
            actor.label(None),
        );
        let audit_id = tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!(
            "{} settled and closed: {} expenses archived to {}",
            group_id, archive.expenses_archived, archive.period_name
        );

        let delivery = self.deliver(ReportVariant::Final, &audience, group_id, &archive, audit_id);
        Ok(archive.into_outcome(group_id, SettlementKind::Final, None, audit_id, delivery))
    }

    /// Settle current expenses in place, leaving the group open.
    ///
    /// Recurring groups get their next settlement date moved to the end of
    /// the following month.
    pub fn settle_period(&self, group_id: GroupId, actor: &Actor) -> Result<Transition<SettlementOutcome>> {
        require_admin(actor)?;
        let now = self.ctx.now();
        let tx = self.ctx.store.begin()?;
        self.settle_period_locked(tx, group_id, now, actor.label(None))
    }

    fn settle_period_locked(
        &self,
        mut tx: Box<dyn Transaction + '_>,
        group_id: GroupId,
        now: DateTime<Utc>,
        performed_by: String,
    ) -> Result<Transition<SettlementOutcome>> {
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        if group.is_settled {
            return Err(Error::AlreadySettled(group_id));
        }
        if !group.is_active {
            return Err(Error::GroupClosed(group_id));
        }
        if group.is_expired(now) {
            return Err(Error::GroupExpired(group_id));
        }
        if tx.tables().active_expenses_of(group_id).is_empty() {
            return Ok(Transition::unchanged("No current expenses to settle"));
        }
        let ledger = BalanceEngine::compute(tx.tables(), group_id, &group.currency, &self.ctx.converter)?;
        if ledger.is_settled() {
            return Ok(Transition::unchanged("All balances are already settled"));
        }

        let next = group.is_recurring.then(|| next_settlement_after(now));
        self.settle_in_place(tx, &group, now, period_label(now), next, performed_by, SettlementKind::Period)
            .map(Transition::Applied)
    }

    /// Scheduler entry point for a due recurring settlement.
    ///
    /// Re-checks the due condition under the row lock. The period is named
    /// after the month that was due. With no current expenses only the
    /// settlement date moves forward.
    pub fn auto_settle(&self, group_id: GroupId) -> Result<Transition<SettlementOutcome>> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let due = match group.next_settlement_date {
            Some(due) if group.is_settlement_due(now) && !group.is_settled && !group.is_expired(now) => due,
            _ => return Ok(Transition::unchanged("Settlement is no longer due")),
        };
        let next = next_settlement_after(due);

        if !tx.tables().active_expenses_of(group_id).is_empty() {
            return self
                .settle_in_place(
                    tx,
                    &group,
                    now,
                    // Labelled by the due month, not the run date: a pass that
                    // runs just after midnight on the 1st still names the month
                    // it closes.
                    period_label(due),
                    Some(next),
                    AUTO_SETTLEMENT_ACTOR.to_string(),
                    SettlementKind::Recurring,
                )
                .map(Transition::Applied);
        }

        let participant_count = tx.tables().participants_of(group_id).len();
        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.next_settlement_date = Some(next);
        row.updated_at = now;
        let entry = NewAuditEntry::new(
            AuditAction::SettlementDateChanged,
            format!(
                "No expenses to settle. Next settlement date moved to {}.",
                next.format("%Y-%m-%d")
            ),
            json!({
                "reason": "no_expenses",
                "previous_settlement_date": due.to_rfc3339(),
                "next_settlement_date": next.to_rfc3339(),
            }),
            AUTO_SETTLEMENT_ACTOR,
        );
        let audit_id = tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} had nothing to settle; next settlement {}", group_id, next);

        Ok(Transition::Applied(SettlementOutcome {
            group_id,
            kind: SettlementKind::DateAdvanced,
            period_name: None,
            expenses_archived: 0,
            total_amount: Decimal::ZERO,
            participant_count,
            transfers: Vec::new(),
            next_settlement_date: Some(next),
            audit_id,
            delivery: DeliverySummary::default(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_in_place(
        &self,
        mut tx: Box<dyn Transaction + '_>,
        group: &Group,
        now: DateTime<Utc>,
        period_name: String,
        next: Option<DateTime<Utc>>,
        performed_by: String,
        kind: SettlementKind,
    ) -> Result<SettlementOutcome> {
        let archive = self.archive_current(tx.tables_mut(), group, period_name, now)?;
        let audience = Audience::of(tx.tables(), group);
        let row = tx.tables_mut().require_group_mut(group.id)?;
        row.settled_at = Some(now);
        row.updated_at = now;
        if next.is_some() {
            row.next_settlement_date = next;
        }

        let (action, settlement_type, description) = match kind {
            SettlementKind::Recurring => (
                AuditAction::GroupSettledRecurring,
                "recurring_settlement",
                format!(
                    "Automatic recurring settlement for period {}: {} expenses archived.",
                    archive.period_name, archive.expenses_archived
                ),
            ),
            _ => (
                AuditAction::GroupSettledPeriod,
                "period_settlement",
                format!(
                    "Group settled for period {}: {} expenses archived.",
                    archive.period_name, archive.expenses_archived
                ),
            ),
        };
        let mut details = archive.details(settlement_type, false);
        details["next_settlement_date"] = json!(next.map(|d| d.to_rfc3339()));
        let entry = NewAuditEntry::new(action, description, details, performed_by);
        let audit_id = tx.tables_mut().append_audit(group.id, entry, now);
        tx.commit()?;
        info!(
            "{} settled period {} in place: {} expenses archived",
            group.id, archive.period_name, archive.expenses_archived
        );

        let delivery = self.deliver(ReportVariant::Period, &audience, group.id, &archive, audit_id);
        Ok(archive.into_outcome(group.id, kind, next, audit_id, delivery))
    }

    /// Close a group whose expiry timestamp has passed, settling any
    /// current expenses first. Recurrence is switched off for good.
    pub fn process_expiration(&self, group_id: GroupId) -> Result<Transition<SettlementOutcome>> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        if !group.is_active || !group.is_expired(now) {
            return Ok(Transition::unchanged("Group is not due for expiration"));
        }

        let archive = if tx.tables().active_expenses_of(group_id).is_empty() {
            None
        } else {
            Some(self.archive_current(tx.tables_mut(), &group, expiration_period_label(now), now)?)
        };
        let audience = Audience::of(tx.tables(), &group);
        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.is_active = false;
        row.is_recurring = false;
        row.next_settlement_date = None;
        row.updated_at = now;
        if archive.is_some() {
            row.is_settled = true;
            row.settled_at = Some(now);
        }

        let expired_at = group.expires_at.map(|at| at.to_rfc3339());
        let entry = match &archive {
            Some(archive) => {
                let mut details = archive.details("expiration_settlement", true);
                details["expired_at"] = json!(expired_at);
                details["recurring_disabled"] = json!(group.is_recurring);
                NewAuditEntry::new(
                    AuditAction::GroupExpiredSettled,
                    format!(
                        "Group expired and settled: {} expenses archived to period {}.",
                        archive.expenses_archived, archive.period_name
                    ),
                    details,
                    AUTO_EXPIRATION_ACTOR,
                )
            }
            None => NewAuditEntry::new(
                AuditAction::GroupExpiredNoSettlement,
                "Group expired with no expenses to settle.",
                json!({
                    "expired_at": expired_at,
                    "recurring_disabled": group.is_recurring,
                    "group_closed": true,
                }),
                AUTO_EXPIRATION_ACTOR,
            ),
        };
        let audit_id = tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} expired and closed", group_id);

        let outcome = match archive {
            Some(archive) => {
                let delivery = self.deliver(ReportVariant::Expiration, &audience, group_id, &archive, audit_id);
                archive.into_outcome(group_id, SettlementKind::Expiration, None, audit_id, delivery)
            }
            None => SettlementOutcome {
                group_id,
                kind: SettlementKind::ExpirationWithoutExpenses,
                period_name: None,
                expenses_archived: 0,
                total_amount: Decimal::ZERO,
                participant_count: audience.members.len(),
                transfers: Vec::new(),
                next_settlement_date: None,
                audit_id,
                delivery: DeliverySummary::default(),
            },
        };
        Ok(Transition::Applied(outcome))
    }

    /// Reopen a settled, expired or closed group.
    ///
    /// A group reopened after expiring loses its expiry date, otherwise the
    /// next scheduler pass would close it again.
    pub fn reopen(&self, group_id: GroupId, actor: &Actor) -> Result<Transition<ReopenOutcome>> {
        require_admin(actor)?;
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let was_expired = group.is_expired(now);
        let was_settled = group.is_settled;
        if group.is_active && !was_settled && !was_expired {
            return Ok(Transition::unchanged("Group is already active"));
        }

        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.is_active = true;
        row.is_settled = false;
        row.settled_at = None;
        if was_expired {
            row.expires_at = None;
        }
        row.updated_at = now;

        let outcome = ReopenOutcome {
            was_expired,
            was_settled,
            expiration_removed: was_expired,
        };
        let description = if was_expired {
            "Group reopened and expiration date removed."
        } else {
            "Group reopened."
        };
        let entry = NewAuditEntry::new(AuditAction::GroupReopened, description, json!(outcome), actor.label(None));
        tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} reopened (expired: {}, settled: {})", group_id, was_expired, was_settled);
        Ok(Transition::Applied(outcome))
    }

    /// Drop the expiry date of a group.
    pub fn remove_expiration(&self, group_id: GroupId, actor: &Actor) -> Result<Transition<()>> {
        require_admin(actor)?;
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let Some(previous) = group.expires_at else {
            return Ok(Transition::unchanged("Group has no expiration date"));
        };

        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.expires_at = None;
        row.updated_at = now;
        let entry = NewAuditEntry::new(
            AuditAction::ExpirationRemoved,
            format!("Expiration date removed (was {}).", previous.format("%Y-%m-%d")),
            json!({ "previous_expires_at": previous.to_rfc3339() }),
            actor.label(None),
        );
        tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        Ok(Transition::Applied(()))
    }

    /// Delete a group and everything it owns.
    ///
    /// An unsettled group with outstanding balances first mails a final
    /// balance report to every participant with an address. Delivery
    /// failures never block the deletion.
    pub fn delete(&self, group_id: GroupId, actor: &Actor) -> Result<DeletionSummary> {
        require_admin(actor)?;
        let notifications = self.notify_before_delete(group_id)?;

        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let tables = tx.tables_mut();
        let email_logs = tables.remove_email_logs_of(group_id);
        let audit_logs = tables.remove_audit_of(group_id);
        let settlement_payments = tables.remove_payments_of(group_id);
        let expense_shares = tables.remove_shares_of_group(group_id);
        let expenses = tables.remove_expenses_of(group_id);
        let participants = tables.remove_participants_of(group_id);
        let settlement_periods = tables.remove_periods_of(group_id);
        let groups = tables.remove_group(group_id);
        tx.commit()?;

        let summary = DeletionSummary {
            group_name: group.name,
            email_logs,
            audit_logs,
            settlement_payments,
            expense_shares,
            expenses,
            participants,
            settlement_periods,
            groups,
            notifications,
        };
        info!(
            "deleted {} ({}): {} expenses, {} participants, {} periods",
            group_id, summary.group_name, summary.expenses, summary.participants, summary.settlement_periods
        );
        Ok(summary)
    }

    fn notify_before_delete(&self, group_id: GroupId) -> Result<DeliverySummary> {
        let snapshot = self.ctx.store.snapshot();
        let group = snapshot.require_group(group_id).map_err(Error::lookup)?;
        if group.is_settled {
            return Ok(DeliverySummary::default());
        }
        let ledger = BalanceEngine::compute(&snapshot, group_id, &group.currency, &self.ctx.converter)?;
        if ledger.is_settled() {
            return Ok(DeliverySummary::default());
        }
        let plan = NettingEngine::settle(&ledger);
        let audience = Audience::of(&snapshot, group);
        Ok(self.send_reports(ReportVariant::Deletion, &audience, group_id, None, &ledger, &plan))
    }

    /// Attach delivery statistics to a settlement audit entry.
    ///
    /// Runs in its own transaction. If it never runs, the entry simply
    /// lacks the statistics.
    pub fn finalize_audit(&self, audit_id: AuditId, delivery: &DeliverySummary) -> Result<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let entry = tx
            .tables_mut()
            .audit_entry_mut(audit_id)
            .ok_or_else(|| Error::not_found(audit_id.to_string()))?;
        let mut extra = Map::new();
        extra.insert("emails_sent".to_string(), json!(delivery.sent));
        extra.insert("emails_failed".to_string(), json!(delivery.failed.len()));
        extra.insert("participants_without_email".to_string(), json!(delivery.no_email));
        entry.amend(&format!(" {} email reports sent.", delivery.sent), extra, now);
        tx.commit()?;
        Ok(())
    }

    /// Operator override of a recurring group's next settlement date.
    pub fn force_settlement_date(&self, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        if !group.is_recurring {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a recurring group",
                group.name
            )));
        }
        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.next_settlement_date = Some(at);
        row.updated_at = now;
        let entry = NewAuditEntry::new(
            AuditAction::SettlementDateChanged,
            format!("Next settlement date set to {}.", at.format("%Y-%m-%d %H:%M UTC")),
            json!({
                "previous_settlement_date": group.next_settlement_date.map(|d| d.to_rfc3339()),
                "next_settlement_date": at.to_rfc3339(),
            }),
            CLI_ACTOR,
        );
        tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} next settlement date forced to {}", group_id, at);
        Ok(())
    }

    /// Operator override of a group's expiry timestamp.
    pub fn force_expiration_date(&self, group_id: GroupId, at: DateTime<Utc>) -> Result<()> {
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin()?;
        let group = tx.lock_group(group_id).map_err(Error::lookup)?;
        let row = tx.tables_mut().require_group_mut(group_id)?;
        row.expires_at = Some(at);
        row.updated_at = now;
        let entry = NewAuditEntry::new(
            AuditAction::ExpirationDateChanged,
            format!("Expiration date set to {}.", at.format("%Y-%m-%d %H:%M UTC")),
            json!({
                "previous_expires_at": group.expires_at.map(|d| d.to_rfc3339()),
                "expires_at": at.to_rfc3339(),
            }),
            CLI_ACTOR,
        );
        tx.tables_mut().append_audit(group_id, entry, now);
        tx.commit()?;
        info!("{} expiration date forced to {}", group_id, at);
        Ok(())
    }

    /// Compute balances and the plan, archive every current expense into a
    /// new period and record one payment per transfer.
    fn archive_current(
        &self,
        tables: &mut Tables,
        group: &Group,
        period_name: String,
        now: DateTime<Utc>,
    ) -> Result<Archive> {
        let ledger = BalanceEngine::compute(tables, group.id, &group.currency, &self.ctx.converter)?;
        let plan = NettingEngine::settle(&ledger);

        let expense_ids = tables.active_expense_ids(group.id);
        let total_amount: Decimal = expense_ids
            .iter()
            .filter_map(|id| tables.expense(*id))
            .map(|e| e.amount)
            .sum();
        for id in &expense_ids {
            if let Some(expense) = tables.expense_mut(*id) {
                expense.archive(&period_name);
            }
        }
        let participant_count = tables.participants_of(group.id).len();

        let period_id: PeriodId = tables.next_period_id();
        tables.insert_period(SettlementPeriod {
            id: period_id,
            group_id: group.id,
            period_name: period_name.clone(),
            settled_at: now,
            total_amount,
            participant_count,
        });
        for transfer in plan.transfers() {
            let id = tables.next_payment_id();
            tables.insert_payment(SettlementPayment {
                id,
                group_id: group.id,
                period_id: Some(period_id),
                from: transfer.from,
                to: transfer.to,
                amount: transfer.amount,
                currency: group.currency.clone(),
                is_paid: false,
                paid_at: None,
                confirmed_by: None,
                created_at: now,
            });
        }

        Ok(Archive {
            period_name,
            expenses_archived: expense_ids.len(),
            total_amount,
            participant_count,
            ledger,
            plan,
        })
    }

    fn deliver(
        &self,
        variant: ReportVariant,
        audience: &Audience,
        group_id: GroupId,
        archive: &Archive,
        audit_id: AuditId,
    ) -> DeliverySummary {
        let delivery = self.send_reports(
            variant,
            audience,
            group_id,
            Some(&archive.period_name),
            &archive.ledger,
            &archive.plan,
        );
        if let Err(e) = self.finalize_audit(audit_id, &delivery) {
            error!("could not record email statistics on {}: {}", audit_id, e);
        }
        delivery
    }

    fn send_reports(
        &self,
        variant: ReportVariant,
        audience: &Audience,
        group_id: GroupId,
        period_name: Option<&str>,
        ledger: &Ledger,
        plan: &SettlementPlan,
    ) -> DeliverySummary {
        let mut summary = DeliverySummary::default();
        for member in &audience.members {
            let Some(email) = &member.email else {
                summary.skip_no_email();
                continue;
            };
            let link = (variant != ReportVariant::Deletion)
                .then(|| self.ctx.links.participant(&audience.share_token, &member.access_token));
            let message = report::settlement_report(&SettlementReport {
                variant,
                group_name: &audience.group_name,
                period_name,
                recipient: member.id,
                names: &audience.names,
                ledger,
                plan,
                link,
            });
            let outcome = self.ctx.dispatcher.send(&NotificationRequest {
                kind: NotificationKind::Settlement,
                recipient: email.clone(),
                group_id: Some(group_id),
                participant_id: Some(member.id),
                message,
            });
            summary.record(email, &outcome);
        }
        if !summary.failed.is_empty() {
            warn!(
                "{}: {} of {} settlement reports failed",
                group_id,
                summary.failed.len(),
                summary.attempted()
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core::currency::CurrencyCode;
    use crate::core::expense::{Expense, ExpenseShare, SplitType};
    use crate::core::group::Participant;
    use crate::fx::StaticRateProvider;
    use crate::notify::RecordingMailer;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    struct Harness {
        manager: SettlementManager,
        mailer: Arc<RecordingMailer>,
        clock: Arc<ManualClock>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let mailer = Arc::new(RecordingMailer::new());
        let clock = Arc::new(ManualClock::new(now()));
        let ctx = Context::builder(Arc::new(StaticRateProvider::new()))
            .mailer(mailer.clone())
            .clock(clock.clone())
            .build();
        Harness {
            manager: SettlementManager::new(Arc::new(ctx)),
            mailer,
            clock,
        }
    }

    impl Harness {
        fn tables(&self) -> Arc<Tables> {
            self.manager.ctx.store.snapshot()
        }

        /// A group with one participant per entry; `Some` entries get an address.
        fn group(&self, people: &[(&str, Option<&str>)], recurring: bool) -> (GroupId, Vec<ParticipantId>) {
            let mut tx = self.manager.ctx.store.begin().unwrap();
            let t = tx.tables_mut();
            let id = t.next_group_id();
            t.insert_group(Group {
                id,
                name: "Flat".into(),
                description: None,
                currency: CurrencyCode::new("EUR"),
                share_token: format!("SHARE{id}"),
                admin_token: format!("ADMIN{id}"),
                is_active: true,
                is_settled: false,
                settled_at: None,
                expires_at: None,
                is_recurring: recurring,
                next_settlement_date: recurring.then(|| dates::end_of_month(now())),
                created_at: now(),
                updated_at: now(),
            })
            .unwrap();
            let mut ids = Vec::new();
            for (i, (name, email)) in people.iter().enumerate() {
                let pid = t.next_participant_id();
                t.insert_participant(Participant {
                    id: pid,
                    group_id: id,
                    name: name.to_string(),
                    email: email.map(str::to_string),
                    color: "#3B82F6".into(),
                    is_admin: i == 0,
                    access_token: format!("TOKEN{pid}"),
                    joined_at: now(),
                })
                .unwrap();
                ids.push(pid);
            }
            tx.commit().unwrap();
            (id, ids)
        }

        fn expense(&self, group: GroupId, payer: ParticipantId, amount: Decimal, among: &[ParticipantId]) {
            let mut tx = self.manager.ctx.store.begin().unwrap();
            let t = tx.tables_mut();
            let id = t.next_expense_id();
            t.insert_expense(Expense {
                id,
                group_id: group,
                title: "Groceries".into(),
                amount,
                original_amount: amount,
                currency: CurrencyCode::new("EUR"),
                exchange_rate: Decimal::ONE,
                paid_by: payer,
                date: now().date_naive(),
                split_type: SplitType::Equal,
                is_archived: false,
                settlement_period: None,
                created_at: now(),
            })
            .unwrap();
            for p in among {
                let sid = t.next_share_id();
                t.insert_share(ExpenseShare {
                    id: sid,
                    expense_id: id,
                    participant_id: *p,
                    amount: amount / Decimal::from(among.len()),
                })
                .unwrap();
            }
            tx.commit().unwrap();
        }

        fn set_group(&self, id: GroupId, f: impl FnOnce(&mut Group)) {
            let mut tx = self.manager.ctx.store.begin().unwrap();
            f(tx.tables_mut().require_group_mut(id).unwrap());
            tx.commit().unwrap();
        }
    }

    #[test]
    fn test_settle_final_archives_and_reports() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", Some("ben@x.io")), ("Cy", None)], false);
        h.expense(g, p[0], dec!(30.00), &p);

        let outcome = h.manager.settle_final(g, &Actor::Admin).unwrap();
        assert_eq!(outcome.period_name.as_deref(), Some("2024-09-FINAL"));
        assert_eq!(outcome.expenses_archived, 1);
        assert_eq!(outcome.transfers.len(), 2);
        assert_eq!(outcome.transfers[0].from, p[1]);
        assert_eq!(outcome.transfers[0].amount, dec!(10.00));
        assert_eq!(outcome.delivery.sent, 2);
        assert_eq!(outcome.delivery.no_email, 1);
        assert_eq!(h.mailer.sent().len(), 2);

        let t = h.tables();
        let group = t.group(g).unwrap();
        assert!(group.is_settled && group.is_active);
        assert!(t.active_expenses_of(g).is_empty());
        assert_eq!(t.expenses_of(g)[0].settlement_period.as_deref(), Some("2024-09-FINAL"));
        assert_eq!(t.payments_of(g).len(), 2);

        let audit = t.audit_entry(outcome.audit_id).unwrap();
        assert_eq!(audit.action, AuditAction::GroupSettled);
        assert_eq!(audit.performed_by, "Admin");
        assert_eq!(audit.details["emails_sent"], 2);
        assert_eq!(audit.details["group_closed"], true);
        assert!(audit.description.ends_with(" 2 email reports sent."));
    }

    #[test]
    fn test_settle_final_twice_is_rejected() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", None), ("Ben", None)], false);
        h.expense(g, p[0], dec!(10), &p);
        h.manager.settle_final(g, &Actor::Admin).unwrap();

        let second = h.manager.settle_final(g, &Actor::Admin);
        assert!(matches!(second, Err(Error::AlreadySettled(id)) if id == g));
        assert_eq!(h.tables().periods_of(g).len(), 1);
    }

    #[test]
    fn test_finalize_audit_repeats_cleanly() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", Some("ben@x.io"))], false);
        h.expense(g, p[0], dec!(20), &p);
        let outcome = h.manager.settle_final(g, &Actor::Admin).unwrap();

        h.manager.finalize_audit(outcome.audit_id, &outcome.delivery).unwrap();
        let audit = h.tables().audit_entry(outcome.audit_id).cloned().unwrap();
        assert_eq!(audit.description.matches("email reports sent").count(), 1);
        assert!(audit.description.ends_with(" 2 email reports sent."));
        assert_eq!(audit.details["emails_sent"], 2);

        let missing = AuditId::new(9_999);
        let result = h.manager.finalize_audit(missing, &outcome.delivery);
        assert!(matches!(result, Err(Error::NotFound(_))));
        let t = h.tables();
        assert!(t.group(g).unwrap().is_settled);
        assert_eq!(t.periods_of(g).len(), 1);
        assert_eq!(t.payments_of(g).len(), 1);
        assert_eq!(t.audit_entry(outcome.audit_id), Some(&audit));
    }

    #[test]
    fn test_non_admin_cannot_settle() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", None), ("Ben", None)], false);
        let result = h.manager.settle_final(g, &Actor::Real(p[1]));
        assert!(matches!(result, Err(Error::Forbidden)));
        let result = h.manager.settle_period(g, &Actor::Viewer(None));
        assert!(matches!(result, Err(Error::Forbidden)));
    }

    #[test]
    fn test_settle_expired_group_rejected() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", None), ("Ben", None)], false);
        h.expense(g, p[0], dec!(10), &p);
        h.set_group(g, |g| g.expires_at = Some(now() - Duration::days(1)));
        assert!(matches!(h.manager.settle_final(g, &Actor::Admin), Err(Error::GroupExpired(_))));
        assert_eq!(h.tables().active_expenses_of(g).len(), 1);
    }

    #[test]
    fn test_settle_period_keeps_group_open() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", None)], true);
        h.expense(g, p[0], dec!(40), &p);

        let outcome = h.manager.settle_period(g, &Actor::Admin).unwrap().applied().unwrap();
        assert_eq!(outcome.period_name.as_deref(), Some("2024-09"));
        let next = Utc.with_ymd_and_hms(2024, 10, 31, 23, 59, 0).unwrap();
        assert_eq!(outcome.next_settlement_date, Some(next));

        let t = h.tables();
        let group = t.group(g).unwrap();
        assert!(group.is_active);
        assert!(!group.is_settled);
        assert_eq!(group.settled_at, Some(now()));
        assert_eq!(group.next_settlement_date, Some(next));
        assert!(group.accepts_changes(now()));
        assert_eq!(h.mailer.sent()[0].1.subject, "Settlement Report - Flat");
    }

    #[test]
    fn test_settle_period_without_work_is_a_no_op() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", None), ("Ben", None)], false);
        assert_eq!(
            h.manager.settle_period(g, &Actor::Admin).unwrap(),
            Transition::unchanged("No current expenses to settle")
        );
        h.expense(g, p[0], dec!(10), &[p[0]]);
        assert_eq!(
            h.manager.settle_period(g, &Actor::Admin).unwrap(),
            Transition::unchanged("All balances are already settled")
        );
        assert!(h.tables().periods_of(g).is_empty());
    }

    #[test]
    fn test_auto_settle_rechecks_due_date() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", None), ("Ben", None)], true);
        h.expense(g, p[0], dec!(10), &p);
        assert!(!h.manager.auto_settle(g).unwrap().is_applied());

        h.clock.set(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        let outcome = h.manager.auto_settle(g).unwrap().applied().unwrap();
        assert_eq!(outcome.kind, SettlementKind::Recurring);
        assert_eq!(outcome.period_name.as_deref(), Some("2024-09"));
        assert_eq!(
            outcome.next_settlement_date,
            Some(Utc.with_ymd_and_hms(2024, 10, 31, 23, 59, 0).unwrap())
        );
        let audit = h.tables().audit_entry(outcome.audit_id).cloned().unwrap();
        assert_eq!(audit.action, AuditAction::GroupSettledRecurring);
        assert_eq!(audit.performed_by, AUTO_SETTLEMENT_ACTOR);
        assert!(!h.manager.auto_settle(g).unwrap().is_applied());
    }

    #[test]
    fn test_auto_settle_without_expenses_moves_date() {
        let h = harness();
        let (g, _) = h.group(&[("Ana", None)], true);
        h.clock.set(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        let outcome = h.manager.auto_settle(g).unwrap().applied().unwrap();
        assert_eq!(outcome.kind, SettlementKind::DateAdvanced);
        assert!(h.tables().periods_of(g).is_empty());
        assert_eq!(
            h.tables().group(g).unwrap().next_settlement_date,
            Some(Utc.with_ymd_and_hms(2024, 10, 31, 23, 59, 0).unwrap())
        );
    }

    #[test]
    fn test_expiration_settles_and_disables_recurrence() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", Some("ben@x.io"))], true);
        h.expense(g, p[1], dec!(12), &p);
        h.set_group(g, |g| g.expires_at = Some(now() - Duration::hours(1)));

        let outcome = h.manager.process_expiration(g).unwrap().applied().unwrap();
        assert_eq!(outcome.kind, SettlementKind::Expiration);
        assert_eq!(outcome.period_name.as_deref(), Some("Final Settlement - 2024-09-15"));

        let t = h.tables();
        let group = t.group(g).unwrap();
        assert!(!group.is_active);
        assert!(!group.is_recurring);
        assert!(group.next_settlement_date.is_none());
        let audit = t.audit_entry(outcome.audit_id).unwrap();
        assert_eq!(audit.action, AuditAction::GroupExpiredSettled);
        assert_eq!(audit.performed_by, AUTO_EXPIRATION_ACTOR);
        assert!(h.mailer.sent()[0].1.subject.starts_with("Group Expired: Final Settlement"));

        assert!(!h.manager.process_expiration(g).unwrap().is_applied());
    }

    #[test]
    fn test_expiration_without_expenses_still_closes() {
        let h = harness();
        let (g, _) = h.group(&[("Ana", None)], false);
        h.set_group(g, |g| g.expires_at = Some(now()));

        let outcome = h.manager.process_expiration(g).unwrap().applied().unwrap();
        assert_eq!(outcome.kind, SettlementKind::ExpirationWithoutExpenses);
        let t = h.tables();
        assert!(!t.group(g).unwrap().is_active);
        assert_eq!(t.audit_entry(outcome.audit_id).unwrap().action, AuditAction::GroupExpiredNoSettlement);
        assert!(t.periods_of(g).is_empty());
    }

    #[test]
    fn test_reopen_expired_group_drops_expiry() {
        let h = harness();
        let (g, _) = h.group(&[("Ana", None)], false);
        assert_eq!(
            h.manager.reopen(g, &Actor::Admin).unwrap(),
            Transition::unchanged("Group is already active")
        );

        h.set_group(g, |g| g.expires_at = Some(now() - Duration::days(2)));
        h.manager.process_expiration(g).unwrap();
        let outcome = h.manager.reopen(g, &Actor::Admin).unwrap().applied().unwrap();
        assert!(outcome.was_expired && outcome.expiration_removed);

        let t = h.tables();
        let group = t.group(g).unwrap();
        assert!(group.is_active && !group.is_settled);
        assert!(group.expires_at.is_none());
        assert_eq!(t.audit_of(g, 1)[0].action, AuditAction::GroupReopened);
    }

    #[test]
    fn test_delete_unsettled_group_notifies_then_cascades() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", Some("down@x.io"))], false);
        h.mailer.fail_for("down@x.io");
        h.expense(g, p[0], dec!(20), &p);

        let summary = h.manager.delete(g, &Actor::Admin).unwrap();
        assert_eq!(summary.notifications.sent, 1);
        assert_eq!(summary.notifications.failed.len(), 1);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.participants, 2);
        assert_eq!(summary.expenses, 1);
        assert_eq!(summary.expense_shares, 2);
        assert_eq!(summary.email_logs, 2);
        assert_eq!(summary.settlement_periods, 0);
        assert_eq!(h.mailer.sent()[0].1.subject, "Group Deleted: Final Balances - Flat");

        let t = h.tables();
        assert!(t.group(g).is_none());
        assert!(t.participants_of(g).is_empty());
        assert_eq!(t.email_logs().count(), 0);
    }

    #[test]
    fn test_delete_settled_group_sends_nothing() {
        let h = harness();
        let (g, p) = h.group(&[("Ana", Some("ana@x.io")), ("Ben", None)], false);
        h.expense(g, p[0], dec!(20), &p);
        h.manager.settle_final(g, &Actor::Admin).unwrap();
        let before = h.mailer.sent().len();

        let summary = h.manager.delete(g, &Actor::Admin).unwrap();
        assert_eq!(h.mailer.sent().len(), before);
        assert_eq!(summary.settlement_periods, 1);
        assert_eq!(summary.settlement_payments, 1);
    }

    #[test]
    fn test_force_settlement_date_requires_recurring() {
        let h = harness();
        let (g, _) = h.group(&[("Ana", None)], false);
        assert!(matches!(
            h.manager.force_settlement_date(g, now()),
            Err(Error::InvalidInput(_))
        ));
        h.manager.force_expiration_date(g, now()).unwrap();
        assert_eq!(h.tables().group(g).unwrap().expires_at, Some(now()));
    }

    #[test]
    fn test_unknown_group_is_not_found() {
        let h = harness();
        let result = h.manager.settle_final(GroupId::new(42), &Actor::Admin);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
