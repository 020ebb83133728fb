//! Numeric core: balance computation and debt netting.

pub mod balances;
pub mod netting;

pub use balances::BalanceEngine;
pub use netting::{NettingEngine, SettlementPlan, Transfer};
