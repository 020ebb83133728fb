use chrono::{NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use settlement_engine::clock::ManualClock;
use settlement_engine::context::Context;
use settlement_engine::core::currency::CurrencyCode;
use settlement_engine::core::ids::ParticipantId;
use settlement_engine::core::ledger::{Ledger, NOISE_FLOOR};
use settlement_engine::fx::StaticRateProvider;
use settlement_engine::groups::GroupService;
use settlement_engine::optimization::netting::NettingEngine;
use settlement_engine::simulation::{ledger_for, populate_group, SimulatedExpense, WorkloadConfig};
use std::sync::Arc;

/// Random zero-sum positions in cents for 2..12 participants.
fn arb_ledger() -> impl Strategy<Value = Ledger> {
    prop::collection::vec(-500_000i64..500_000i64, 1..11).prop_map(|cents| {
        let balancing: i64 = -cents.iter().sum::<i64>();
        let positions = cents
            .into_iter()
            .chain(std::iter::once(balancing))
            .enumerate()
            .map(|(i, c)| (ParticipantId::new(i as u64 + 1), Decimal::new(c, 2)));
        Ledger::from_positions(CurrencyCode::new("EUR"), positions)
    })
}

/// A random expense over `n` participants.
fn arb_expense(n: usize) -> impl Strategy<Value = SimulatedExpense> {
    (
        0..n,
        1i64..1_000_000i64,
        prop::collection::btree_set(0..n, 1..=n),
    )
        .prop_map(|(paid_by, cents, holders)| SimulatedExpense {
            paid_by,
            amount: Decimal::new(cents, 2),
            split_between: holders.into_iter().collect(),
        })
}

fn arb_workload() -> impl Strategy<Value = (WorkloadConfig, Vec<SimulatedExpense>)> {
    (2usize..9).prop_flat_map(|n| {
        let config = WorkloadConfig {
            participant_count: n,
            expense_count: 0,
            ..Default::default()
        };
        (Just(config), prop::collection::vec(arb_expense(n), 0..30))
    })
}

fn service() -> GroupService {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap());
    let ctx = Context::builder(Arc::new(StaticRateProvider::new()))
        .clock(Arc::new(clock))
        .build();
    GroupService::new(Arc::new(ctx))
}

proptest! {
    // ===================================================================
    // INVARIANT 1: Balances of current expenses always sum to zero.
    //
    // Each expense credits the payer with the full amount and debits the
    // share holders with portions that add back up to it.
    // ===================================================================
    #[test]
    fn balances_always_sum_to_zero((config, expenses) in arb_workload()) {
        let ledger = ledger_for(&config, &expenses);
        let tolerance = NOISE_FLOOR * Decimal::from(config.participant_count);
        prop_assert!(
            ledger.is_balanced(tolerance),
            "balances sum to {} for {} participants",
            ledger.total(),
            config.participant_count
        );
    }

    // ===================================================================
    // INVARIANT 2: k unsettled balances need at most k - 1 transfers.
    // ===================================================================
    #[test]
    fn netting_uses_at_most_k_minus_one_transfers(ledger in arb_ledger()) {
        let k = ledger.unsettled().count();
        let plan = NettingEngine::settle(&ledger);
        prop_assert!(
            plan.len() <= k.saturating_sub(1),
            "{} transfers for {} unsettled participants",
            plan.len(),
            k
        );
    }

    // ===================================================================
    // INVARIANT 3: Replaying the plan settles everyone.
    //
    // Positions inside the noise floor are never paid out, so whoever ends
    // up absorbing them may be left with up to a cent per participant.
    // ===================================================================
    #[test]
    fn replaying_plan_settles_ledger(ledger in arb_ledger()) {
        let plan = NettingEngine::settle(&ledger);
        let after = plan.replay(&ledger);
        let tolerance = NOISE_FLOOR * Decimal::from(ledger.len());
        for (participant, balance) in after.positions() {
            prop_assert!(
                balance.abs() <= tolerance,
                "{} left with {} after replay",
                participant,
                balance
            );
        }
    }

    // ===================================================================
    // INVARIANT 4: Transfers go from debtors to creditors, in positive
    // cent amounts, and never to oneself.
    // ===================================================================
    #[test]
    fn transfers_flow_from_debtors_to_creditors(ledger in arb_ledger()) {
        let plan = NettingEngine::settle(&ledger);
        for t in plan.transfers() {
            prop_assert_ne!(t.from, t.to);
            prop_assert!(t.amount > Decimal::ZERO);
            prop_assert!(t.amount.scale() <= 2);
            prop_assert!(ledger.position(t.from) < Decimal::ZERO);
            prop_assert!(ledger.position(t.to) > Decimal::ZERO);
        }
    }

    // ===================================================================
    // INVARIANT 5: Netting is deterministic.
    // ===================================================================
    #[test]
    fn netting_is_deterministic(ledger in arb_ledger()) {
        let first = NettingEngine::settle(&ledger);
        let second = NettingEngine::settle(&ledger.clone());
        prop_assert_eq!(first.transfers(), second.transfers());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // ===================================================================
    // INVARIANT 6: The balance engine over a real store agrees with the
    // direct computation and stays conserved.
    // ===================================================================
    #[test]
    fn stored_balances_match_direct_computation((config, expenses) in arb_workload()) {
        let service = service();
        let date = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        let (group, participants) = populate_group(&service, &config, &expenses, date).unwrap();
        let stored = service.balances(group, None).unwrap();
        let direct = ledger_for(&config, &expenses);
        let tolerance = NOISE_FLOOR * Decimal::from(config.participant_count);

        prop_assert!(stored.is_balanced(tolerance));
        for (i, id) in participants.iter().enumerate() {
            let expected = direct.position(ParticipantId::new(i as u64 + 1));
            let diff = (stored.position(*id) - expected).abs();
            prop_assert!(diff <= NOISE_FLOOR, "{}: stored {} vs direct {}", id, stored.position(*id), expected);
        }
    }
}
