use crate::core::ids::GroupId;
use crate::core::notification::NotificationKind;
use crate::store::Tables;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read access to past deliveries, as needed by [`RateLimitPolicy`].
pub trait SendHistory {
    /// Successful sends to `recipient` since `since`, optionally narrowed
    /// to one kind and one group.
    fn count_sent(
        &self,
        recipient: &str,
        kind: Option<NotificationKind>,
        group: Option<GroupId>,
        since: DateTime<Utc>,
    ) -> usize;
}

impl SendHistory for Tables {
    fn count_sent(
        &self,
        recipient: &str,
        kind: Option<NotificationKind>,
        group: Option<GroupId>,
        since: DateTime<Utc>,
    ) -> usize {
        Tables::count_sent(self, recipient, kind, group, since)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Rejected(String),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Daily email caps.
///
/// Each kind has a cap per recipient, counted within the group when the
/// notification belongs to one and across everything otherwise. A total
/// cap over all kinds applies with the same scoping. Kinds without a
/// configured cap are only subject to the total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub per_kind: HashMap<NotificationKind, usize>,
    pub total_daily: usize,
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

fn default_window_hours() -> i64 {
    24
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        let per_kind = HashMap::from([
            (NotificationKind::Reminder, 1),
            (NotificationKind::Settlement, 5),
            (NotificationKind::Invitation, 25),
            (NotificationKind::PrecreatedInvitation, 25),
            (NotificationKind::GroupCreated, 19),
        ]);
        Self {
            enabled: true,
            per_kind,
            total_daily: 50,
            window_hours: default_window_hours(),
        }
    }
}

impl RateLimitPolicy {
    /// A policy that allows everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn check(
        &self,
        history: &dyn SendHistory,
        recipient: &str,
        kind: NotificationKind,
        group: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed;
        }
        let since = now - Duration::hours(self.window_hours);
        let scope = if group.is_some() { "for this group" } else { "globally" };

        if let Some(&limit) = self.per_kind.get(&kind) {
            let count = history.count_sent(recipient, Some(kind), group, since);
            if count >= limit {
                return RateDecision::Rejected(format!(
                    "Daily {kind} email limit exceeded {scope} ({count}/{limit})"
                ));
            }
        }

        let total = history.count_sent(recipient, None, group, since);
        if total >= self.total_daily {
            return RateDecision::Rejected(format!(
                "Daily email limit exceeded {scope} ({total}/{})",
                self.total_daily
            ));
        }
        RateDecision::Allowed
    }
}
