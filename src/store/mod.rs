//! Persistence collaborator.
//!
//! Services read committed state through [`Store::snapshot`] and change it
//! inside a [`Transaction`]. A transaction that is dropped without
//! [`Transaction::commit`] leaves no trace.

pub mod memory;
pub mod tables;

pub use memory::MemoryStore;
pub use tables::Tables;

use crate::core::group::Group;
use crate::core::ids::GroupId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("constraint violated: {0}")]
    Conflict(String),
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Transactional access to the persisted tables.
pub trait Store: Send + Sync {
    /// Latest committed state. Never blocks on writers.
    fn snapshot(&self) -> Arc<Tables>;

    /// Open a write transaction. Must not be called while the current
    /// thread already holds one.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;
}

/// A unit of work over [`Tables`].
pub trait Transaction {
    fn tables(&self) -> &Tables;

    fn tables_mut(&mut self) -> &mut Tables;

    /// Lock a group row for the rest of the transaction and return its
    /// latest committed version.
    fn lock_group(&mut self, id: GroupId) -> Result<Group, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
