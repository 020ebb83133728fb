//! Plain-text rendering of outgoing notifications.

use crate::core::currency::{format_amount, CurrencyCode};
use crate::core::ids::ParticipantId;
use crate::core::ledger::{Ledger, NOISE_FLOOR};
use crate::optimization::netting::SettlementPlan;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// A rendered email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// Which settlement flow produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportVariant {
    Period,
    Final,
    Expiration,
    Deletion,
}

impl ReportVariant {
    pub fn subject(&self, group_name: &str) -> String {
        match self {
            ReportVariant::Period => format!("Settlement Report - {group_name}"),
            ReportVariant::Final => format!("Group Settled & Closed - {group_name}"),
            ReportVariant::Expiration => format!("Group Expired: Final Settlement - {group_name}"),
            ReportVariant::Deletion => format!("Group Deleted: Final Balances - {group_name}"),
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            ReportVariant::Period => "The current period has been settled. The group stays open for new expenses.",
            ReportVariant::Final => "The group has been settled and closed.",
            ReportVariant::Expiration => "The group reached its expiration date and has been settled and closed.",
            ReportVariant::Deletion => "The group has been deleted. These were the final balances.",
        }
    }
}

/// Everything a settlement report needs for one recipient.
pub struct SettlementReport<'a> {
    pub variant: ReportVariant,
    pub group_name: &'a str,
    pub period_name: Option<&'a str>,
    pub recipient: ParticipantId,
    pub names: &'a BTreeMap<ParticipantId, String>,
    pub ledger: &'a Ledger,
    pub plan: &'a SettlementPlan,
    pub link: Option<String>,
}

fn name_of(names: &BTreeMap<ParticipantId, String>, id: ParticipantId) -> String {
    names.get(&id).cloned().unwrap_or_else(|| id.to_string())
}

fn describe_balance(balance: Decimal, currency: &CurrencyCode) -> String {
    if balance > NOISE_FLOOR {
        format!("you are owed {}", format_amount(balance, currency))
    } else if balance < -NOISE_FLOOR {
        format!("you owe {}", format_amount(-balance, currency))
    } else {
        "you are settled up".to_string()
    }
}

pub fn settlement_report(report: &SettlementReport<'_>) -> Message {
    let currency = report.ledger.currency();
    let me = name_of(report.names, report.recipient);
    let mut body = String::new();

    let _ = writeln!(body, "Hi {me},\n");
    let _ = writeln!(body, "{}", report.variant.headline());
    if let Some(period) = report.period_name {
        let _ = writeln!(body, "Settlement period: {period}");
    }
    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "Your balance in {}: {}.",
        report.group_name,
        describe_balance(report.ledger.position(report.recipient), currency)
    );

    let mine: Vec<_> = report
        .plan
        .transfers()
        .iter()
        .filter(|t| t.from == report.recipient || t.to == report.recipient)
        .collect();
    if !mine.is_empty() {
        let _ = writeln!(body, "\nYour payments:");
        for t in mine {
            if t.from == report.recipient {
                let _ = writeln!(body, "  Pay {} {}", name_of(report.names, t.to), format_amount(t.amount, currency));
            } else {
                let _ = writeln!(body, "  Receive {} from {}", format_amount(t.amount, currency), name_of(report.names, t.from));
            }
        }
    }

    let _ = writeln!(body, "\nAll balances:");
    for (id, balance) in report.ledger.positions() {
        let _ = writeln!(body, "  {}: {}", name_of(report.names, *id), format_amount(*balance, currency));
    }
    if !report.plan.is_empty() {
        let _ = writeln!(body, "\nSuggested settlements:");
        for t in report.plan.transfers() {
            let _ = writeln!(
                body,
                "  {} -> {}: {}",
                name_of(report.names, t.from),
                name_of(report.names, t.to),
                format_amount(t.amount, currency)
            );
        }
    }
    if let Some(link) = &report.link {
        let _ = writeln!(body, "\nView the group: {link}");
    }

    Message {
        subject: report.variant.subject(report.group_name),
        body,
    }
}

pub fn reminder(
    participant_name: &str,
    group_name: &str,
    settlement_date: DateTime<Utc>,
    balance: Decimal,
    currency: &CurrencyCode,
    link: &str,
) -> Message {
    let when = settlement_date.format("%B %d, %Y");
    let body = format!(
        "Hi {participant_name},\n\n\
         {group_name} will be settled automatically on {when}.\n\
         Right now {}.\n\n\
         Add any missing expenses before then: {link}\n",
        describe_balance(balance, currency)
    );
    Message {
        subject: format!("Settlement Reminder - {group_name} ({when})"),
        body,
    }
}

pub fn invitation(group_name: &str, link: &str) -> Message {
    Message {
        subject: format!("You're invited to join {group_name}"),
        body: format!("You have been invited to share expenses in {group_name}.\n\nJoin here: {link}\n"),
    }
}

pub fn precreated_invitation(participant_name: &str, group_name: &str, link: &str) -> Message {
    Message {
        subject: format!("You've been added to {group_name}"),
        body: format!(
            "Hi {participant_name},\n\nYou have been added to {group_name}.\n\
             Your personal link: {link}\n\nKeep this link private; it identifies you in the group.\n"
        ),
    }
}

pub fn group_created(group_name: &str, share_link: &str, admin_link: &str) -> Message {
    Message {
        subject: format!("Your group {group_name} is ready"),
        body: format!(
            "Your group {group_name} has been created.\n\n\
             Share this link with participants: {share_link}\n\
             Admin link (keep it secret): {admin_link}\n"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::netting::NettingEngine;
    use rust_decimal_macros::dec;

    #[test]
    fn test_settlement_report_lists_own_payments() {
        let (a, b) = (ParticipantId::new(1), ParticipantId::new(2));
        let ledger = Ledger::from_positions(CurrencyCode::new("EUR"), [(a, dec!(15)), (b, dec!(-15))]);
        let plan = NettingEngine::settle(&ledger);
        let names = BTreeMap::from([(a, "Ana".to_string()), (b, "Ben".to_string())]);
        let msg = settlement_report(&SettlementReport {
            variant: ReportVariant::Period,
            group_name: "Flat",
            period_name: Some("2024-09"),
            recipient: b,
            names: &names,
            ledger: &ledger,
            plan: &plan,
            link: None,
        });
        assert_eq!(msg.subject, "Settlement Report - Flat");
        assert!(msg.body.contains("you owe €15.00"));
        assert!(msg.body.contains("Pay Ana €15.00"));
        assert!(msg.body.contains("Settlement period: 2024-09"));
    }

    #[test]
    fn test_variant_subjects() {
        assert_eq!(ReportVariant::Final.subject("G"), "Group Settled & Closed - G");
        assert_eq!(ReportVariant::Expiration.subject("G"), "Group Expired: Final Settlement - G");
        assert_eq!(ReportVariant::Deletion.subject("G"), "Group Deleted: Final Balances - G");
    }
}
