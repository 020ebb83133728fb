use crate::core::currency::CurrencyCode;
use crate::core::ids::{GroupId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Colors handed out to participants in join order, wrapping around.
pub const PARTICIPANT_COLORS: &[&str] = &[
    "#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6", "#EC4899", "#06B6D4", "#84CC16",
    "#F97316", "#6B7280",
];

/// Color for the participant at position `index` (0-based join order).
pub fn participant_color(index: usize) -> &'static str {
    PARTICIPANT_COLORS[index % PARTICIPANT_COLORS.len()]
}

/// An expense-sharing context.
///
/// `is_settled` and `is_active` are independent axes: a final settlement
/// sets `is_settled`, expiration clears `is_active`. A periodic settlement
/// leaves both alone and only stamps `settled_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub currency: CurrencyCode,
    pub share_token: String,
    pub admin_token: String,
    pub is_active: bool,
    pub is_settled: bool,
    pub settled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub next_settlement_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a group sits in the settlement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Accepting expenses, never settled.
    Open,
    /// Settled in place at least once, still accepting expenses.
    PeriodSettled,
    /// Closed by a final settlement.
    FinalSettled,
    /// Past its expiry date, or closed by expiration processing.
    Expired,
}

impl Group {
    /// `true` once the expiry timestamp has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// `true` when a recurring settlement is due at `now`.
    pub fn is_settlement_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.is_recurring
            && self.next_settlement_date.map_or(false, |at| at <= now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> GroupState {
        if !self.is_active || self.is_expired(now) {
            GroupState::Expired
        } else if self.is_settled {
            GroupState::FinalSettled
        } else if self.settled_at.is_some() {
            GroupState::PeriodSettled
        } else {
            GroupState::Open
        }
    }

    /// Whether expenses and participants may still be changed.
    pub fn accepts_changes(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), GroupState::Open | GroupState::PeriodSettled)
    }

    /// Label shown by operational listings.
    pub fn status_label(&self, now: DateTime<Utc>) -> &'static str {
        if self.is_expired(now) {
            "EXPIRED"
        } else if self.is_settled {
            "SETTLED"
        } else if self.is_active {
            "ACTIVE"
        } else {
            "CLOSED"
        }
    }

    /// Broadcast room for this group.
    pub fn room(&self) -> String {
        format!("group_{}", self.share_token)
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GroupState::Open => "open",
            GroupState::PeriodSettled => "period-settled",
            GroupState::FinalSettled => "final-settled",
            GroupState::Expired => "expired",
        };
        f.write_str(label)
    }
}

/// A member of exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub group_id: GroupId,
    pub name: String,
    pub email: Option<String>,
    pub color: String,
    pub is_admin: bool,
    pub access_token: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn has_email(&self) -> bool {
        self.email.as_deref().map_or(false, |e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn group(now: DateTime<Utc>) -> Group {
        Group {
            id: GroupId::new(1),
            name: "Trip".into(),
            description: None,
            currency: CurrencyCode::new("EUR"),
            share_token: "ABCDEFGHJKLM".into(),
            admin_token: "A".repeat(32),
            is_active: true,
            is_settled: false,
            settled_at: None,
            expires_at: None,
            is_recurring: false,
            next_settlement_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_state_transitions_follow_flags() {
        let now = Utc.with_ymd_and_hms(2024, 9, 10, 12, 0, 0).unwrap();
        let mut g = group(now);
        assert_eq!(g.state(now), GroupState::Open);

        g.settled_at = Some(now);
        assert_eq!(g.state(now), GroupState::PeriodSettled);
        assert!(g.accepts_changes(now));

        g.is_settled = true;
        assert_eq!(g.state(now), GroupState::FinalSettled);
        assert!(!g.accepts_changes(now));

        g.is_active = false;
        assert_eq!(g.state(now), GroupState::Expired);
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2024, 9, 10, 12, 0, 0).unwrap();
        let mut g = group(now);
        g.expires_at = Some(now);
        assert!(g.is_expired(now));
        assert!(!g.is_expired(now - Duration::seconds(1)));
        assert_eq!(g.status_label(now), "EXPIRED");
    }

    #[test]
    fn test_colors_wrap() {
        assert_eq!(participant_color(0), "#3B82F6");
        assert_eq!(participant_color(10), "#3B82F6");
        assert_eq!(participant_color(11), "#EF4444");
    }
}
