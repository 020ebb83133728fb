//! Who is performing an operation.
//!
//! Capability tokens are the only authentication: the group's admin token
//! grants [`Actor::Admin`], a participant's access token grants
//! [`Actor::Real`], and anyone holding the share link is a viewer. Only
//! `Real` carries an id that may be stored as a foreign key.

use crate::core::ids::ParticipantId;
use serde::{Deserialize, Serialize};

/// A credential presented by a caller, before it is checked against a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    AdminToken(String),
    ParticipantToken(String),
    Viewer(Option<String>),
}

/// The resolved identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Actor {
    Real(ParticipantId),
    Admin,
    Viewer(Option<String>),
    /// Background jobs. The label ends up in `performed_by`.
    System(String),
}

impl Actor {
    pub fn system(label: impl Into<String>) -> Self {
        Actor::System(label.into())
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin)
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        match self {
            Actor::Real(id) => Some(*id),
            _ => None,
        }
    }

    /// Audit label for this actor. `participant_name` is used for `Real`.
    pub fn label(&self, participant_name: Option<&str>) -> String {
        match self {
            Actor::Real(id) => participant_name
                .map(str::to_string)
                .unwrap_or_else(|| id.to_string()),
            Actor::Admin => "Admin".to_string(),
            Actor::Viewer(Some(email)) => format!("Viewer ({email})"),
            Actor::Viewer(None) => "Viewer".to_string(),
            Actor::System(label) => label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(Actor::Admin.label(None), "Admin");
        assert_eq!(Actor::Real(ParticipantId::new(3)).label(Some("Ana")), "Ana");
        assert_eq!(Actor::Real(ParticipantId::new(3)).label(None), "participant#3");
        assert_eq!(Actor::system("System (Auto-Expiration)").label(None), "System (Auto-Expiration)");
        assert!(Actor::Admin.is_admin());
        assert!(Actor::Viewer(None).participant_id().is_none());
    }
}
