use crate::core::currency::CurrencyCode;
use crate::core::ids::ParticipantId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Balances with a magnitude at or below this are treated as settled.
pub const NOISE_FLOOR: Decimal = dec!(0.01);

/// Net position of each participant of a group in one currency.
///
/// A positive balance means the participant is owed (net creditor).
/// A negative balance means the participant owes (net debtor).
///
/// Positions are keyed by id so iteration order is stable, which keeps
/// everything derived from a ledger reproducible.
///
/// # Examples
///
/// ```
/// use settlement_engine::core::currency::CurrencyCode;
/// use settlement_engine::core::ids::ParticipantId;
/// use settlement_engine::core::ledger::Ledger;
/// use rust_decimal_macros::dec;
///
/// let a = ParticipantId::new(1);
/// let b = ParticipantId::new(2);
/// let mut ledger = Ledger::new(CurrencyCode::new("USD"));
/// ledger.credit(a, dec!(30));
/// ledger.debit(a, dec!(15));
/// ledger.debit(b, dec!(15));
/// assert_eq!(ledger.position(a), dec!(15));
/// assert!(ledger.is_balanced(dec!(0)));
///
/// ledger.apply_transfer(b, a, dec!(15));
/// assert!(ledger.is_settled());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    currency: CurrencyCode,
    positions: BTreeMap<ParticipantId, Decimal>,
}

impl Ledger {
    pub fn new(currency: CurrencyCode) -> Self {
        Self {
            currency,
            positions: BTreeMap::new(),
        }
    }

    /// Build a ledger from explicit positions.
    pub fn from_positions(
        currency: CurrencyCode,
        positions: impl IntoIterator<Item = (ParticipantId, Decimal)>,
    ) -> Self {
        Self {
            currency,
            positions: positions.into_iter().collect(),
        }
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    /// Register a participant at zero if not already present.
    pub fn open(&mut self, participant: ParticipantId) {
        self.positions.entry(participant).or_insert(Decimal::ZERO);
    }

    pub fn credit(&mut self, participant: ParticipantId, amount: Decimal) {
        *self.positions.entry(participant).or_insert(Decimal::ZERO) += amount;
    }

    pub fn debit(&mut self, participant: ParticipantId, amount: Decimal) {
        *self.positions.entry(participant).or_insert(Decimal::ZERO) -= amount;
    }

    /// Record that `from` paid `to`: the debtor moves up, the creditor down.
    pub fn apply_transfer(&mut self, from: ParticipantId, to: ParticipantId, amount: Decimal) {
        self.credit(from, amount);
        self.debit(to, amount);
    }

    /// Net position of a participant; unknown participants are at zero.
    pub fn position(&self, participant: ParticipantId) -> Decimal {
        self.positions
            .get(&participant)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn positions(&self) -> &BTreeMap<ParticipantId, Decimal> {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Sum of all positions.
    pub fn total(&self) -> Decimal {
        self.positions.values().sum()
    }

    /// `true` when the positions sum to zero within `tolerance`.
    pub fn is_balanced(&self, tolerance: Decimal) -> bool {
        self.total().abs() <= tolerance
    }

    /// Positions whose magnitude exceeds the noise floor, in id order.
    pub fn unsettled(&self) -> impl Iterator<Item = (ParticipantId, Decimal)> + '_ {
        self.positions
            .iter()
            .filter(|(_, b)| b.abs() > NOISE_FLOOR)
            .map(|(p, b)| (*p, *b))
    }

    /// `true` when every position is within the noise floor.
    pub fn is_settled(&self) -> bool {
        self.unsettled().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    #[test]
    fn test_credit_and_debit() {
        let mut ledger = Ledger::new(CurrencyCode::new("USD"));
        ledger.credit(p(1), dec!(30));
        ledger.debit(p(2), dec!(10));
        ledger.debit(p(3), dec!(20));
        assert_eq!(ledger.position(p(1)), dec!(30));
        assert_eq!(ledger.position(p(2)), dec!(-10));
        assert_eq!(ledger.position(p(9)), Decimal::ZERO);
        assert!(ledger.is_balanced(Decimal::ZERO));
    }

    #[test]
    fn test_open_keeps_zero_positions() {
        let mut ledger = Ledger::new(CurrencyCode::new("USD"));
        ledger.open(p(4));
        ledger.credit(p(4), dec!(1));
        ledger.open(p(4));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.position(p(4)), dec!(1));
    }

    #[test]
    fn test_noise_floor_is_inclusive() {
        let ledger = Ledger::from_positions(
            CurrencyCode::new("USD"),
            [(p(1), dec!(0.01)), (p(2), dec!(-0.01))],
        );
        assert!(ledger.is_settled());

        let ledger = Ledger::from_positions(
            CurrencyCode::new("USD"),
            [(p(1), dec!(0.02)), (p(2), dec!(-0.02))],
        );
        assert_eq!(ledger.unsettled().count(), 2);
    }

    #[test]
    fn test_unbalanced_detection() {
        let mut ledger = Ledger::new(CurrencyCode::new("USD"));
        ledger.credit(p(1), dec!(100));
        ledger.debit(p(2), dec!(60));
        assert!(!ledger.is_balanced(dec!(0.02)));
    }
}
