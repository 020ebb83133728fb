use crate::core::currency::CurrencyCode;
use crate::core::expense::SplitType;
use crate::core::ids::GroupId;
use crate::core::ledger::Ledger;
use crate::fx::CurrencyConverter;
use crate::store::{StoreError, Tables};
use log::warn;
use rust_decimal::Decimal;

/// Computes per-participant net balances from a group's current expenses.
pub struct BalanceEngine;

impl BalanceEngine {
    /// Net balance of every participant of `group`, in `display`.
    ///
    /// Every participant starts at zero. For each non-archived expense the
    /// payer is credited the full amount and each share holder is debited
    /// their portion. Archived expenses are ignored.
    ///
    /// Equal splits are recomputed as `amount / share_count` from the
    /// converted amount, so currency conversion never makes shares drift
    /// from the total. Other split types debit the stored share amounts,
    /// converted individually.
    ///
    /// A failed conversion falls back to the unconverted amount and is
    /// logged. An expense with no shares left is skipped so the ledger
    /// keeps summing to zero.
    pub fn compute(
        tables: &Tables,
        group: GroupId,
        display: &CurrencyCode,
        converter: &CurrencyConverter,
    ) -> Result<Ledger, StoreError> {
        let base = &tables.require_group(group)?.currency;
        let mut ledger = Ledger::new(display.clone());
        for participant in tables.participants_of(group) {
            ledger.open(participant.id);
        }

        let convert = |amount: Decimal| match converter.convert(amount, base, display) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("balance conversion {} -> {} failed, using raw amount: {}", base, display, e);
                amount
            }
        };

        for expense in tables.active_expenses_of(group) {
            let shares = tables.shares_of(expense.id);
            if shares.is_empty() {
                warn!("{} has no shares; excluded from balances", expense.id);
                continue;
            }
            match expense.split_type {
                SplitType::Equal => {
                    let converted = convert(expense.amount);
                    ledger.credit(expense.paid_by, converted);
                    let per_share = converted / Decimal::from(shares.len());
                    for share in shares {
                        ledger.debit(share.participant_id, per_share);
                    }
                }
                SplitType::Exact | SplitType::Percentage => {
                    let mut owed = Decimal::ZERO;
                    for share in shares {
                        let portion = convert(share.amount);
                        owed += portion;
                        ledger.debit(share.participant_id, portion);
                    }
                    ledger.credit(expense.paid_by, owed);
                }
            }
        }
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::core::expense::{Expense, ExpenseShare};
    use crate::core::group::{Group, Participant};
    use crate::core::ids::ParticipantId;
    use crate::fx::StaticRateProvider;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        tables: Tables,
        group: GroupId,
        people: Vec<ParticipantId>,
    }

    fn fixture(n: usize) -> Fixture {
        let mut tables = Tables::new();
        let group = tables.next_group_id();
        tables
            .insert_group(Group {
                id: group,
                name: "Cabin".into(),
                description: None,
                currency: CurrencyCode::new("EUR"),
                share_token: "SHARE".into(),
                admin_token: "ADMIN".into(),
                is_active: true,
                is_settled: false,
                settled_at: None,
                expires_at: None,
                is_recurring: false,
                next_settlement_date: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        let mut people = Vec::new();
        for i in 0..n {
            let id = tables.next_participant_id();
            tables
                .insert_participant(Participant {
                    id,
                    group_id: group,
                    name: format!("P{i}"),
                    email: None,
                    color: "#3B82F6".into(),
                    is_admin: i == 0,
                    access_token: format!("TOKEN{i}"),
                    joined_at: Utc::now(),
                })
                .unwrap();
            people.push(id);
        }
        Fixture { tables, group, people }
    }

    fn add_expense(f: &mut Fixture, amount: Decimal, payer: usize, among: &[usize], split: SplitType) {
        let id = f.tables.next_expense_id();
        f.tables
            .insert_expense(Expense {
                id,
                group_id: f.group,
                title: "x".into(),
                amount,
                original_amount: amount,
                currency: CurrencyCode::new("EUR"),
                exchange_rate: Decimal::ONE,
                paid_by: f.people[payer],
                date: Utc::now().date_naive(),
                split_type: split,
                is_archived: false,
                settlement_period: None,
                created_at: Utc::now(),
            })
            .unwrap();
        let share_amount = amount / Decimal::from(among.len());
        for &i in among {
            let sid = f.tables.next_share_id();
            f.tables
                .insert_share(ExpenseShare {
                    id: sid,
                    expense_id: id,
                    participant_id: f.people[i],
                    amount: share_amount,
                })
                .unwrap();
        }
    }

    fn converter(provider: StaticRateProvider) -> CurrencyConverter {
        CurrencyConverter::new(Arc::new(provider), Arc::new(SystemClock))
    }

    #[test]
    fn test_equal_split_three_ways() {
        let mut f = fixture(3);
        add_expense(&mut f, dec!(30.00), 0, &[0, 1, 2], SplitType::Equal);
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("EUR"),
            &converter(StaticRateProvider::new()),
        )
        .unwrap();
        assert_eq!(ledger.position(f.people[0]), dec!(20));
        assert_eq!(ledger.position(f.people[1]), dec!(-10));
        assert_eq!(ledger.position(f.people[2]), dec!(-10));
    }

    #[test]
    fn test_participants_without_expenses_start_at_zero() {
        let f = fixture(2);
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("EUR"),
            &converter(StaticRateProvider::new()),
        )
        .unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.is_settled());
    }

    #[test]
    fn test_archived_expenses_ignored() {
        let mut f = fixture(2);
        add_expense(&mut f, dec!(50), 0, &[0, 1], SplitType::Equal);
        let ids = f.tables.active_expense_ids(f.group);
        f.tables.expense_mut(ids[0]).unwrap().archive("2024-05");
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("EUR"),
            &converter(StaticRateProvider::new()),
        )
        .unwrap();
        assert!(ledger.is_settled());
    }

    #[test]
    fn test_display_currency_conversion() {
        let mut f = fixture(2);
        add_expense(&mut f, dec!(10), 0, &[0, 1], SplitType::Equal);
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("USD"),
            &converter(StaticRateProvider::new().with_rate("EUR", "USD", dec!(2))),
        )
        .unwrap();
        assert_eq!(ledger.position(f.people[0]), dec!(10));
        assert_eq!(ledger.position(f.people[1]), dec!(-10));
        assert_eq!(ledger.currency().as_str(), "USD");
    }

    #[test]
    fn test_conversion_failure_falls_back_to_raw_amount() {
        let mut f = fixture(2);
        add_expense(&mut f, dec!(10), 0, &[0, 1], SplitType::Equal);
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("GBP"),
            &converter(StaticRateProvider::new()),
        )
        .unwrap();
        assert_eq!(ledger.position(f.people[0]), dec!(5));
    }

    #[test]
    fn test_exact_split_uses_stored_shares() {
        let mut f = fixture(2);
        add_expense(&mut f, dec!(9), 0, &[1], SplitType::Exact);
        let ledger = BalanceEngine::compute(
            &f.tables,
            f.group,
            &CurrencyCode::new("EUR"),
            &converter(StaticRateProvider::new()),
        )
        .unwrap();
        assert_eq!(ledger.position(f.people[0]), dec!(9));
        assert_eq!(ledger.position(f.people[1]), dec!(-9));
    }

    #[test]
    fn test_unknown_group() {
        let f = fixture(1);
        let result = BalanceEngine::compute(
            &f.tables,
            GroupId::new(99),
            &CurrencyCode::new("EUR"),
            &converter(StaticRateProvider::new()),
        );
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
