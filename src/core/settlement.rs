use crate::core::currency::CurrencyCode;
use crate::core::ids::{GroupId, ParticipantId, PaymentId, PeriodId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Label for an in-place periodic settlement: `2024-09`.
pub fn period_label(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Label for a manual final settlement: `2024-09-FINAL`.
pub fn final_period_label(at: DateTime<Utc>) -> String {
    format!("{}-FINAL", period_label(at))
}

/// Label for an expiration settlement: `Final Settlement - 2024-09-30`.
pub fn expiration_period_label(at: DateTime<Utc>) -> String {
    format!("Final Settlement - {}", at.format("%Y-%m-%d"))
}

/// Immutable record of one settlement event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub id: PeriodId,
    pub group_id: GroupId,
    pub period_name: String,
    pub settled_at: DateTime<Utc>,
    pub total_amount: Decimal,
    pub participant_count: usize,
}

/// A single netted transfer that can be confirmed as paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPayment {
    pub id: PaymentId,
    pub group_id: GroupId,
    pub period_id: Option<PeriodId>,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SettlementPayment {
    pub fn mark_paid(&mut self, confirmed_by: impl Into<String>, at: DateTime<Utc>) {
        self.is_paid = true;
        self.paid_at = Some(at);
        self.confirmed_by = Some(confirmed_by.into());
    }

    pub fn mark_unpaid(&mut self) {
        self.is_paid = false;
        self.paid_at = None;
        self.confirmed_by = None;
    }
}
