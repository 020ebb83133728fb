//! # settlement-engine
//!
//! Core of a multi-tenant group expense splitter.
//!
//! Participants record shared expenses in any supported currency. The
//! engine converts them into the group currency, keeps per-participant net
//! balances, nets those balances into a short list of transfers, and runs
//! the settlement lifecycle (final, periodic, expiration) on demand or from
//! a background scheduler.
//!
//! ## Architecture
//!
//! - **core**: Domain types for groups, participants, expenses, ledger, audit
//! - **fx**: Exchange-rate providers and the caching converter
//! - **optimization**: Balance computation and greedy debt netting
//! - **store**: Transactional persistence with row locking
//! - **groups**: Group, participant and expense operations
//! - **lifecycle**: Settlement, expiration, reopen and deletion
//! - **notify**: Rate-limited notifications and real-time broadcasts
//! - **scheduler**: Daily settlement and reminder jobs
//! - **simulation**: Random workloads for benchmarks and tests

pub mod clock;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod fx;
pub mod groups;
pub mod lifecycle;
pub mod notify;
pub mod optimization;
pub mod scheduler;
pub mod simulation;
pub mod store;
pub mod tokens;

pub use error::{Error, Result};

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::core::actor::{Actor, Credential};
    pub use crate::core::currency::CurrencyCode;
    pub use crate::core::ids::{ExpenseId, GroupId, ParticipantId};
    pub use crate::core::ledger::Ledger;
    pub use crate::error::{Error, Result};
    pub use crate::groups::{ExpenseInput, GroupService, NewGroup};
    pub use crate::lifecycle::{SettlementManager, Transition};
    pub use crate::optimization::{BalanceEngine, NettingEngine, SettlementPlan};
    pub use crate::scheduler::{JobKind, Scheduler, SchedulerConfig};
}
