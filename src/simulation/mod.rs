//! Synthetic workloads for benchmarks and tests.


pub use stress_test::{
    generate_expenses, generate_expenses_with, generate_random_ledger, ledger_for, populate_group, SimulatedExpense,
    WorkloadConfig,
};
