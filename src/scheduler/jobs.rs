//! The two scheduled passes. Both are stateless scans over committed
//! state, safe to re-run at any time.

use crate::core::ids::GroupId;
use crate::core::notification::NotificationKind;
use crate::fx::STALE_RATE_MAX_AGE_HOURS;
use crate::lifecycle::dates::start_of_day;
use crate::lifecycle::{SettlementKind, SettlementManager, Transition};
use crate::notify::report;
use crate::notify::{DeliverySummary, NotificationRequest};
use crate::optimization::BalanceEngine;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Days between a reminder and the settlement it announces.
pub const REMINDER_LEAD_DAYS: i64 = 3;

/// What one settlement-check pass did.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementCheckSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub expired_candidates: usize,
    pub recurring_candidates: usize,
    pub expired: Vec<GroupId>,
    pub settled: Vec<GroupId>,
    pub date_advanced: Vec<GroupId>,
    /// Candidates a concurrent caller had already handled.
    pub skipped: Vec<GroupId>,
    pub failures: Vec<(GroupId, String)>,
    pub emails_sent: usize,
    /// Cached exchange rates dropped for age.
    pub rates_purged: usize,
}

impl SettlementCheckSummary {
    pub fn processed(&self) -> usize {
        self.expired.len() + self.settled.len() + self.date_advanced.len()
    }
}

impl fmt::Display for SettlementCheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Settlement Check {} ===", self.run_id)?;
        writeln!(f, "Started:         {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(
            f,
            "Candidates:      {} expired, {} recurring",
            self.expired_candidates, self.recurring_candidates
        )?;
        writeln!(f, "Expired:         {}", self.expired.len())?;
        writeln!(f, "Settled:         {}", self.settled.len())?;
        writeln!(f, "Date advanced:   {}", self.date_advanced.len())?;
        writeln!(f, "Skipped:         {}", self.skipped.len())?;
        writeln!(f, "Emails sent:     {}", self.emails_sent)?;
        writeln!(f, "Rates purged:    {}", self.rates_purged)?;
        write!(f, "Failures:        {}", self.failures.len())?;
        for (group, reason) in &self.failures {
            write!(f, "\n  {group}: {reason}")?;
        }
        Ok(())
    }
}

/// What one reminder-check pass did.
#[derive(Debug, Clone, Serialize)]
pub struct ReminderSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub groups: Vec<GroupId>,
    pub delivery: DeliverySummary,
    pub failures: Vec<(GroupId, String)>,
}

impl fmt::Display for ReminderSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Reminder Check {} ===", self.run_id)?;
        writeln!(f, "Started:         {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Groups:          {}", self.groups.len())?;
        writeln!(f, "Sent:            {}", self.delivery.sent)?;
        writeln!(f, "Failed:          {}", self.delivery.failed.len())?;
        write!(f, "No email:        {}", self.delivery.no_email)
    }
}

/// Settle or close every group that is due.
///
/// Expired groups are handled first and never also go through recurring
/// settlement in the same pass. Each group runs in its own transaction;
/// one failing group is logged and the pass moves on. The pass ends by
/// pruning exchange rates older than [`STALE_RATE_MAX_AGE_HOURS`].
pub fn check_settlements(manager: &SettlementManager) -> SettlementCheckSummary {
    let ctx = manager.context();
    let now = ctx.now();
    let run_id = Uuid::new_v4();
    let tables = ctx.store.snapshot();

    let expired: Vec<GroupId> = tables
        .groups()
        .filter(|g| g.is_active && g.is_expired(now))
        .map(|g| g.id)
        .collect();
    let expired_set: BTreeSet<GroupId> = expired.iter().copied().collect();
    let recurring: Vec<GroupId> = tables
        .groups()
        .filter(|g| g.is_settlement_due(now) && !g.is_settled && !expired_set.contains(&g.id))
        .map(|g| g.id)
        .collect();
    drop(tables);

    info!(
        "[{}] settlement check at {}: {} expired, {} recurring due",
        run_id,
        now,
        expired.len(),
        recurring.len()
    );
    let mut summary = SettlementCheckSummary {
        run_id,
        started_at: now,
        expired_candidates: expired.len(),
        recurring_candidates: recurring.len(),
        expired: Vec::new(),
        settled: Vec::new(),
        date_advanced: Vec::new(),
        skipped: Vec::new(),
        failures: Vec::new(),
        emails_sent: 0,
        rates_purged: 0,
    };

    let due = expired
        .into_iter()
        .map(|id| (id, true))
        .chain(recurring.into_iter().map(|id| (id, false)));
    for (group_id, is_expiration) in due {
        let result = if is_expiration {
            manager.process_expiration(group_id)
        } else {
            manager.auto_settle(group_id)
        };
        match result {
            Ok(Transition::Applied(outcome)) => {
                summary.emails_sent += outcome.delivery.sent;
                match outcome.kind {
                    SettlementKind::DateAdvanced => summary.date_advanced.push(group_id),
                    SettlementKind::Expiration | SettlementKind::ExpirationWithoutExpenses => {
                        summary.expired.push(group_id)
                    }
                    _ => summary.settled.push(group_id),
                }
                info!("[{}] {}: {}", run_id, group_id, outcome.kind);
            }
            Ok(Transition::Unchanged(reason)) => {
                info!("[{}] {} skipped: {}", run_id, group_id, reason);
                summary.skipped.push(group_id);
            }
            Err(e) => {
                error!("[{}] {} failed: {}", run_id, group_id, e);
                summary.failures.push((group_id, e.to_string()));
            }
        }
    }

    summary.rates_purged = ctx
        .converter
        .purge_stale(Duration::hours(STALE_RATE_MAX_AGE_HOURS));

    info!(
        "[{}] settlement check done: {} processed, {} skipped, {} failed",
        run_id,
        summary.processed(),
        summary.skipped.len(),
        summary.failures.len()
    );
    summary
}

/// Remind participants of groups whose recurring settlement falls on the
/// day [`REMINDER_LEAD_DAYS`] from today.
pub fn check_reminders(manager: &SettlementManager) -> ReminderSummary {
    let ctx = manager.context();
    let now = ctx.now();
    let run_id = Uuid::new_v4();
    let window_start = start_of_day(now) + Duration::days(REMINDER_LEAD_DAYS);
    let window_end = window_start + Duration::days(1);
    let tables = ctx.store.snapshot();

    let mut summary = ReminderSummary {
        run_id,
        started_at: now,
        groups: Vec::new(),
        delivery: DeliverySummary::default(),
        failures: Vec::new(),
    };
    let mut requests = Vec::new();
    for group in tables.groups() {
        let settles_at = match group.next_settlement_date {
            Some(at) if group.is_active && group.is_recurring && at >= window_start && at < window_end => at,
            _ => continue,
        };
        let ledger = match BalanceEngine::compute(&tables, group.id, &group.currency, &ctx.converter) {
            Ok(ledger) => ledger,
            Err(e) => {
                error!("[{}] reminder balances for {} failed: {}", run_id, group.id, e);
                summary.failures.push((group.id, e.to_string()));
                continue;
            }
        };
        summary.groups.push(group.id);
        for participant in tables.participants_of(group.id) {
            let Some(email) = participant.email.as_deref().filter(|_| participant.has_email()) else {
                summary.delivery.skip_no_email();
                continue;
            };
            let link = ctx.links.participant(&group.share_token, &participant.access_token);
            requests.push(NotificationRequest {
                kind: NotificationKind::Reminder,
                recipient: email.to_string(),
                group_id: Some(group.id),
                participant_id: Some(participant.id),
                message: report::reminder(
                    &participant.name,
                    &group.name,
                    settles_at,
                    ledger.position(participant.id),
                    &group.currency,
                    &link,
                ),
            });
        }
    }
    drop(tables);

    info!(
        "[{}] reminder check at {}: {} groups settle between {} and {}",
        run_id,
        now,
        summary.groups.len(),
        window_start,
        window_end
    );
    for request in &requests {
        let outcome = ctx.dispatcher.send(request);
        if !outcome.success {
            warn!("[{}] reminder to {} not sent: {}", run_id, request.recipient, outcome.reason);
        }
        summary.delivery.record(&request.recipient, &outcome);
    }
    summary
}
