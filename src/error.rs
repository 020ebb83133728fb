use crate::core::currency::CurrencyError;
use crate::core::ids::GroupId;
use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by the group, lifecycle and scheduler services.
///
/// Validation variants carry a user-facing reason and guarantee that no
/// state was changed. `Store` errors roll back the transaction that raised
/// them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("admin access required")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("group {0} is already settled")]
    AlreadySettled(GroupId),
    #[error("group {0} has expired")]
    GroupExpired(GroupId),
    #[error("group {0} is closed")]
    GroupClosed(GroupId),
    #[error("Cannot exit - you are the last participant in the group")]
    LastParticipant,
    #[error("Cannot exit - you are the only admin. Please promote another participant to admin first")]
    SoleAdmin,
    #[error("Cannot remove {name} - they have an outstanding balance of {amount}. Please settle their balance first")]
    OutstandingBalance { name: String, amount: String },
    #[error("split type {0} is not supported")]
    UnsupportedSplit(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("Unable to convert currency: {0}")]
    Currency(#[from] CurrencyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Like `From<StoreError>`, but a missing row becomes [`Error::NotFound`].
    pub fn lookup(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Error::NotFound(format!("{entity} {id}")),
            other => Error::Store(other),
        }
    }

    /// `true` for errors caused by the caller's request rather than the system.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Error::Store(_) | Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
