use crate::core::currency::{round_half_up, CurrencyCode};
use crate::core::ids::ParticipantId;
use crate::core::ledger::{Ledger, NOISE_FLOOR};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One netted payment: `from` pays `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub amount: Decimal,
}

/// Ordered list of transfers that settles a ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementPlan {
    currency: CurrencyCode,
    transfers: Vec<Transfer>,
    /// Sum of positive positions before netting.
    outstanding: Decimal,
    /// Participants that were above the noise floor going in.
    unsettled_count: usize,
    /// Balances left over when the input did not sum to zero.
    residual: Vec<(ParticipantId, Decimal)>,
}

impl SettlementPlan {
    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    pub fn into_transfers(self) -> Vec<Transfer> {
        self.transfers
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Total moved by all transfers.
    pub fn total_transferred(&self) -> Decimal {
        self.transfers.iter().map(|t| t.amount).sum()
    }

    /// Sum of what creditors were owed before netting.
    pub fn outstanding(&self) -> Decimal {
        self.outstanding
    }

    pub fn unsettled_count(&self) -> usize {
        self.unsettled_count
    }

    pub fn residual(&self) -> &[(ParticipantId, Decimal)] {
        &self.residual
    }

    /// Transfers used relative to the `k - 1` bound, as a percentage.
    pub fn bound_utilization_percent(&self) -> f64 {
        if self.unsettled_count < 2 {
            return 0.0;
        }
        self.transfers.len() as f64 * 100.0 / (self.unsettled_count - 1) as f64
    }

    /// Apply every transfer to a copy of `ledger`.
    pub fn replay(&self, ledger: &Ledger) -> Ledger {
        let mut after = ledger.clone();
        for t in &self.transfers {
            after.apply_transfer(t.from, t.to, t.amount);
        }
        after
    }
}

/// Greedy debt-netting solver.
pub struct NettingEngine;

impl NettingEngine {
    /// Turn a balance ledger into a short list of transfers.
    ///
    /// # Algorithm
    ///
    /// 1. Drop every position whose magnitude is within the noise floor.
    /// 2. Pick the most negative position (debtor) and the most positive
    ///    (creditor). Equal extremes are broken by lowest participant id.
    /// 3. Transfer `min(|debt|, credit)`, rounded half-up to cents.
    /// 4. Update both positions and drop any that fall within the floor.
    /// 5. Repeat while a debtor and a creditor remain.
    ///
    /// Every round retires at least one participant, so `k` unsettled
    /// positions produce at most `k - 1` transfers.
    ///
    /// # Examples
    ///
    /// ```
    /// use settlement_engine::core::currency::CurrencyCode;
    /// use settlement_engine::core::ids::ParticipantId;
    /// use settlement_engine::core::ledger::Ledger;
    /// use settlement_engine::optimization::netting::NettingEngine;
    /// use rust_decimal_macros::dec;
    ///
    /// let (a, b, c) = (ParticipantId::new(1), ParticipantId::new(2), ParticipantId::new(3));
    /// let ledger = Ledger::from_positions(
    ///     CurrencyCode::new("USD"),
    ///     [(a, dec!(20)), (b, dec!(-10)), (c, dec!(-10))],
    /// );
    /// let plan = NettingEngine::settle(&ledger);
    /// assert_eq!(plan.len(), 2);
    /// assert_eq!(plan.transfers()[0].from, b);
    /// assert_eq!(plan.transfers()[0].amount, dec!(10.00));
    /// ```
    pub fn settle(ledger: &Ledger) -> SettlementPlan {
        let mut open: Vec<(ParticipantId, Decimal)> = ledger.unsettled().collect();
        let unsettled_count = open.len();
        let outstanding = open
            .iter()
            .filter(|(_, b)| *b > Decimal::ZERO)
            .map(|(_, b)| *b)
            .sum();
        let mut transfers = Vec::new();

        loop {
            let debtor = open
                .iter()
                .enumerate()
                .filter(|(_, (_, b))| *b < Decimal::ZERO)
                .min_by(|(_, x), (_, y)| x.1.cmp(&y.1).then(x.0.cmp(&y.0)))
                .map(|(i, _)| i);
            let creditor = open
                .iter()
                .enumerate()
                .filter(|(_, (_, b))| *b > Decimal::ZERO)
                .min_by(|(_, x), (_, y)| match y.1.cmp(&x.1) {
                    Ordering::Equal => x.0.cmp(&y.0),
                    other => other,
                })
                .map(|(i, _)| i);

            let (Some(d), Some(c)) = (debtor, creditor) else {
                break;
            };

            let amount = (-open[d].1).min(open[c].1);
            transfers.push(Transfer {
                from: open[d].0,
                to: open[c].0,
                amount: round_half_up(amount, 2),
            });
            open[d].1 += amount;
            open[c].1 -= amount;
            open.retain(|(_, b)| b.abs() > NOISE_FLOOR);
        }

        SettlementPlan {
            currency: ledger.currency().clone(),
            transfers,
            outstanding,
            unsettled_count,
            residual: open,
        }
    }
}

impl std::fmt::Display for SettlementPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Settlement Plan ({}) ===", self.currency)?;
        writeln!(f, "Outstanding:    {}", self.outstanding)?;
        writeln!(f, "Transfers:      {}", self.transfers.len())?;
        writeln!(f, "Moved:          {}", self.total_transferred())?;
        writeln!(f, "Bound used:     {:.1}%", self.bound_utilization_percent())?;
        for t in &self.transfers {
            writeln!(f, "  {} -> {}: {}", t.from, t.to, t.amount)?;
        }
        if !self.residual.is_empty() {
            writeln!(f, "Residual:       {} participant(s)", self.residual.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    fn p(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    fn ledger(positions: &[(u64, Decimal)]) -> Ledger {
        Ledger::from_positions(
            CurrencyCode::new("USD"),
            positions.iter().map(|(id, b)| (p(*id), *b)),
        )
    }

    #[test]
    fn test_equal_split_scenario() {
        let plan = NettingEngine::settle(&ledger(&[(1, dec!(20)), (2, dec!(-10)), (3, dec!(-10))]));
        assert_eq!(
            plan.transfers(),
            &[
                Transfer { from: p(2), to: p(1), amount: dec!(10.00) },
                Transfer { from: p(3), to: p(1), amount: dec!(10.00) },
            ]
        );
        assert_eq!(plan.outstanding(), dec!(20));
        assert!(plan.residual().is_empty());
    }

    #[test]
    fn test_tie_break_prefers_lowest_id() {
        // Two equal creditors and two equal debtors.
        let plan = NettingEngine::settle(&ledger(&[
            (4, dec!(-5)),
            (3, dec!(5)),
            (2, dec!(-5)),
            (1, dec!(5)),
        ]));
        assert_eq!(plan.transfers()[0], Transfer { from: p(2), to: p(1), amount: dec!(5.00) });
        assert_eq!(plan.transfers()[1], Transfer { from: p(4), to: p(3), amount: dec!(5.00) });
    }

    #[test]
    fn test_noise_floor_filtered() {
        let plan = NettingEngine::settle(&ledger(&[(1, dec!(0.01)), (2, dec!(-0.01))]));
        assert!(plan.is_empty());
        assert_eq!(plan.unsettled_count(), 0);
    }

    #[test]
    fn test_largest_amounts_matched_first() {
        let plan = NettingEngine::settle(&ledger(&[
            (1, dec!(70)),
            (2, dec!(30)),
            (3, dec!(-60)),
            (4, dec!(-40)),
        ]));
        // after 3 -> 1 (60) the largest creditor is 2, not 1
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.transfers()[0], Transfer { from: p(3), to: p(1), amount: dec!(60.00) });
        assert_eq!(plan.transfers()[1], Transfer { from: p(4), to: p(2), amount: dec!(30.00) });
        assert_eq!(plan.transfers()[2], Transfer { from: p(4), to: p(1), amount: dec!(10.00) });
        assert_relative_eq!(plan.bound_utilization_percent(), 100.0);
    }

    #[test]
    fn test_fractional_balances_round_half_up() {
        let third = dec!(10) / dec!(3);
        let plan = NettingEngine::settle(&ledger(&[(1, third * dec!(2)), (2, -third), (3, -third)]));
        assert_eq!(plan.len(), 2);
        assert!(plan.transfers().iter().all(|t| t.amount == dec!(3.33)));
        let after = plan.replay(&ledger(&[(1, third * dec!(2)), (2, -third), (3, -third)]));
        assert!(after.is_settled());
    }

    #[test]
    fn test_unbalanced_input_leaves_residual() {
        let plan = NettingEngine::settle(&ledger(&[(1, dec!(5)), (2, dec!(-3))]));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.residual(), &[(p(1), dec!(2))]);
    }

    #[test]
    fn test_no_self_transfers() {
        let plan = NettingEngine::settle(&ledger(&[
            (1, dec!(12.5)),
            (2, dec!(-7.25)),
            (3, dec!(3.75)),
            (4, dec!(-9)),
        ]));
        assert!(plan.transfers().iter().all(|t| t.from != t.to));
        assert!(plan.to_string().contains("=== Settlement Plan (USD) ==="));
    }
}
