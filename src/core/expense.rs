use crate::core::currency::CurrencyCode;
use crate::core::ids::{ExpenseId, GroupId, ParticipantId, ShareId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How an expense is divided among its share holders.
///
/// Only `Equal` can be created today; the other variants exist so stored
/// data can describe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitType {
    #[default]
    Equal,
    Exact,
    Percentage,
}

/// A shared expense.
///
/// `amount` is in the group currency and equals
/// `original_amount * exchange_rate` rounded at creation time. The rate is
/// frozen; later rate changes never touch stored expenses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub group_id: GroupId,
    pub title: String,
    pub amount: Decimal,
    pub original_amount: Decimal,
    pub currency: CurrencyCode,
    pub exchange_rate: Decimal,
    pub paid_by: ParticipantId,
    pub date: NaiveDate,
    pub split_type: SplitType,
    pub is_archived: bool,
    pub settlement_period: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Expense {
    /// Mark as belonging to a settled period.
    pub fn archive(&mut self, period_name: &str) {
        self.is_archived = true;
        self.settlement_period = Some(period_name.to_string());
    }
}

/// One participant's portion of an expense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseShare {
    pub id: ShareId,
    pub expense_id: ExpenseId,
    pub participant_id: ParticipantId,
    pub amount: Decimal,
}
