use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use settlement_engine::context::Context;
use settlement_engine::fx::StaticRateProvider;
use settlement_engine::groups::GroupService;
use settlement_engine::optimization::netting::NettingEngine;
use settlement_engine::simulation::{generate_expenses, generate_random_ledger, ledger_for, populate_group, WorkloadConfig};
use std::sync::Arc;

fn bench_netting_10_participants(c: &mut Criterion) {
    let config = WorkloadConfig {
        participant_count: 10,
        expense_count: 50,
        ..Default::default()
    };
    let ledger = generate_random_ledger(&config);

    c.bench_function("netting_10_participants", |b| {
        b.iter(|| NettingEngine::settle(black_box(&ledger)))
    });
}

fn bench_netting_100_participants(c: &mut Criterion) {
    let config = WorkloadConfig {
        participant_count: 100,
        expense_count: 1_000,
        ..Default::default()
    };
    let ledger = generate_random_ledger(&config);

    c.bench_function("netting_100_participants", |b| {
        b.iter(|| NettingEngine::settle(black_box(&ledger)))
    });
}

fn bench_netting_1000_participants(c: &mut Criterion) {
    let config = WorkloadConfig {
        participant_count: 1_000,
        expense_count: 10_000,
        ..Default::default()
    };
    let ledger = generate_random_ledger(&config);

    c.bench_function("netting_1000_participants", |b| {
        b.iter(|| NettingEngine::settle(black_box(&ledger)))
    });
}

fn bench_ledger_from_expenses(c: &mut Criterion) {
    let config = WorkloadConfig {
        participant_count: 100,
        expense_count: 1_000,
        ..Default::default()
    };
    let expenses = generate_expenses(&config);

    c.bench_function("ledger_100_participants_1000_expenses", |b| {
        b.iter(|| ledger_for(black_box(&config), black_box(&expenses)))
    });
}

fn bench_stored_balances(c: &mut Criterion) {
    let config = WorkloadConfig {
        participant_count: 25,
        expense_count: 500,
        ..Default::default()
    };
    let expenses = generate_expenses(&config);
    let service = GroupService::new(Arc::new(Context::builder(Arc::new(StaticRateProvider::new())).build()));
    let date = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
    let (group, _) = populate_group(&service, &config, &expenses, date).unwrap();

    c.bench_function("balances_25_participants_500_expenses", |b| {
        b.iter(|| service.balances(black_box(group), None).unwrap())
    });
}

criterion_group!(
    benches,
    bench_netting_10_participants,
    bench_netting_100_participants,
    bench_netting_1000_participants,
    bench_ledger_from_expenses,
    bench_stored_balances
);
criterion_main!(benches);
