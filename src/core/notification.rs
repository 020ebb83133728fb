use crate::core::ids::{EmailLogId, GroupId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of email the system sends. Each has its own daily cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Invitation,
    Settlement,
    Reminder,
    GroupCreated,
    PrecreatedInvitation,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 5] = [
        NotificationKind::Invitation,
        NotificationKind::Settlement,
        NotificationKind::Reminder,
        NotificationKind::GroupCreated,
        NotificationKind::PrecreatedInvitation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Invitation => "invitation",
            NotificationKind::Settlement => "settlement",
            NotificationKind::Reminder => "reminder",
            NotificationKind::GroupCreated => "group_created",
            NotificationKind::PrecreatedInvitation => "precreated_invitation",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: EmailLogId,
    pub recipient: String,
    pub kind: NotificationKind,
    pub group_id: Option<GroupId>,
    pub participant_id: Option<ParticipantId>,
    pub subject: String,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}
