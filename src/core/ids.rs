//! Store-assigned identifiers.
//!
//! Every entity gets a `u64` id from a per-table sequence, so ids increase
//! in insertion order. Code that needs a stable tie-break between entities
//! (the netting solver, "first other participant" lookups) orders by id.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

entity_id!(
    /// Identifies a [`Group`](crate::core::group::Group).
    GroupId,
    "group"
);
entity_id!(
    /// Identifies a [`Participant`](crate::core::group::Participant).
    ///
    /// # Examples
    ///
    /// ```
    /// use settlement_engine::core::ids::ParticipantId;
    ///
    /// let a = ParticipantId::new(1);
    /// let b = ParticipantId::new(2);
    /// assert!(a < b);
    /// assert_eq!(a.to_string(), "participant#1");
    /// ```
    ParticipantId,
    "participant"
);
entity_id!(ExpenseId, "expense");
entity_id!(ShareId, "share");
entity_id!(PeriodId, "period");
entity_id!(PaymentId, "payment");
entity_id!(AuditId, "audit");
entity_id!(EmailLogId, "email");
