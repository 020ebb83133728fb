//! Plain-text export of a group's full history.

use crate::core::currency::format_amount_suffix;
use crate::core::group::Group;
use crate::core::ledger::{Ledger, NOISE_FLOOR};
use crate::optimization::SettlementPlan;
use crate::store::Tables;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt::Write;

const RULE: usize = 60;

/// Render the export. `ledger` and `plan` describe the current,
/// non-archived expenses in the group currency.
pub fn history_text(
    tables: &Tables,
    group: &Group,
    ledger: &Ledger,
    plan: &SettlementPlan,
    generated_at: DateTime<Utc>,
    activity_limit: usize,
) -> String {
    let mut out = String::new();
    let currency = &group.currency;
    let participants = tables.participants_of(group.id);
    let name_of = |id| {
        participants
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| id.to_string())
    };

    let _ = writeln!(out, "{}", "=".repeat(RULE));
    let _ = writeln!(out, "EXPENSE HISTORY: {}", group.name);
    let _ = writeln!(out, "{}", "=".repeat(RULE));
    let _ = writeln!(out, "Generated on: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Group created: {}", group.created_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Default currency: {currency}");
    if let Some(description) = &group.description {
        let _ = writeln!(out, "Description: {description}");
    }
    match (group.is_settled, group.settled_at) {
        (true, Some(at)) => {
            let _ = writeln!(out, "Status: SETTLED (on {})", at.format("%Y-%m-%d"));
        }
        _ if group.is_expired(generated_at) => {
            let _ = writeln!(out, "Status: EXPIRED");
        }
        _ if !group.is_active => {
            let _ = writeln!(out, "Status: CLOSED");
        }
        _ => {
            let _ = writeln!(out, "Status: ACTIVE");
        }
    }
    if group.is_recurring {
        let _ = writeln!(out, "Recurring: Yes (monthly)");
        if let Some(next) = group.next_settlement_date {
            let _ = writeln!(out, "Next settlement: {}", next.format("%Y-%m-%d"));
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "PARTICIPANTS");
    let _ = writeln!(out, "{}", "-".repeat(20));
    for (i, p) in participants.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, p.name);
        if let Some(email) = p.email.as_deref().filter(|_| p.has_email()) {
            let _ = writeln!(out, "   Email: {email}");
        }
        let _ = writeln!(out, "   Joined: {}", p.joined_at.format("%Y-%m-%d"));
        if p.is_admin {
            let _ = writeln!(out, "   Role: Admin");
        }
        let _ = writeln!(out);
    }

    let mut expenses = tables.expenses_of(group.id);
    expenses.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
    let current = expenses.iter().filter(|e| !e.is_archived).count();

    let _ = writeln!(out, "ALL EXPENSES");
    let _ = writeln!(out, "{}", "-".repeat(20));
    if expenses.is_empty() {
        let _ = writeln!(out, "No expenses recorded.");
        let _ = writeln!(out);
    } else {
        let total: Decimal = expenses.iter().map(|e| e.amount).sum();
        let _ = writeln!(out, "Total expenses: {}", expenses.len());
        let _ = writeln!(out, "Current expenses: {current}");
        let _ = writeln!(out, "Archived expenses: {}", expenses.len() - current);
        let _ = writeln!(out, "Total amount: {}", format_amount_suffix(total, currency));
        let _ = writeln!(out);

        for expense in &expenses {
            let _ = writeln!(out, "Date: {}", expense.date.format("%Y-%m-%d"));
            let _ = writeln!(out, "Title: {}", expense.title);
            let _ = writeln!(out, "Amount: {}", format_amount_suffix(expense.amount, currency));
            if &expense.currency != currency {
                let _ = writeln!(
                    out,
                    "Original: {} (rate {})",
                    format_amount_suffix(expense.original_amount, &expense.currency),
                    expense.exchange_rate.normalize()
                );
            }
            let _ = writeln!(out, "Paid by: {}", name_of(expense.paid_by));
            match (&expense.settlement_period, expense.is_archived) {
                (Some(period), true) => {
                    let _ = writeln!(out, "Status: ARCHIVED (settlement period: {period})");
                }
                _ => {
                    let _ = writeln!(out, "Status: CURRENT");
                }
            }
            let shares = tables.shares_of(expense.id);
            if !shares.is_empty() {
                let _ = writeln!(out, "Split between:");
                let portion = expense.amount / Decimal::from(shares.len());
                for share in shares {
                    let _ = writeln!(
                        out,
                        "  - {}: {}",
                        name_of(share.participant_id),
                        format_amount_suffix(portion, currency)
                    );
                }
            }
            let _ = writeln!(out);
        }
    }

    if current > 0 {
        let _ = writeln!(out, "CURRENT BALANCES");
        let _ = writeln!(out, "{}", "-".repeat(20));
        for p in &participants {
            let balance = ledger.position(p.id);
            if balance > NOISE_FLOOR {
                let _ = writeln!(out, "{}: +{} (owed to them)", p.name, format_amount_suffix(balance, currency));
            } else if balance < -NOISE_FLOOR {
                let _ = writeln!(out, "{}: -{} (they owe)", p.name, format_amount_suffix(-balance, currency));
            } else {
                let _ = writeln!(out, "{}: {} (settled)", p.name, format_amount_suffix(Decimal::ZERO, currency));
            }
        }
        let _ = writeln!(out);

        if !plan.is_empty() {
            let _ = writeln!(out, "SUGGESTED SETTLEMENTS");
            let _ = writeln!(out, "{}", "-".repeat(25));
            for t in plan.transfers() {
                let _ = writeln!(
                    out,
                    "{} → {}: {}",
                    name_of(t.from),
                    name_of(t.to),
                    format_amount_suffix(t.amount, currency)
                );
            }
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "ACTIVITY LOG");
    let _ = writeln!(out, "{}", "-".repeat(15));
    let entries = tables.audit_of(group.id, activity_limit);
    if entries.is_empty() {
        let _ = writeln!(out, "No activity recorded.");
    } else {
        for entry in entries {
            let _ = writeln!(out, "{} - {}", entry.created_at.format("%Y-%m-%d %H:%M"), entry.description);
            if !entry.performed_by.is_empty() {
                let _ = writeln!(out, "  By: {}", entry.performed_by);
            }
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "=".repeat(RULE));
    let _ = writeln!(out, "Generated by settlement-engine");
    let _ = write!(out, "{}", "=".repeat(RULE));
    out
}
