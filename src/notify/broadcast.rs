//! Real-time push seam. Broadcasts are fire-and-forget.

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Events pushed to a group's room after balance-affecting changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEvent {
    ExpenseUpdate,
    ParticipantUpdate,
    BalanceUpdate,
}

impl BroadcastEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastEvent::ExpenseUpdate => "expense_update",
            BroadcastEvent::ParticipantUpdate => "participant_update",
            BroadcastEvent::BalanceUpdate => "balance_update",
        }
    }
}

pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, room: &str, event: BroadcastEvent, payload: Value);
}

/// Logs broadcasts at debug level.
#[derive(Debug, Default)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast(&self, room: &str, event: BroadcastEvent, payload: Value) {
        debug!("broadcast {} to {}: {}", event.as_str(), room, payload);
    }
}

/// Keeps broadcasts in memory.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<(String, BroadcastEvent, Value)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, BroadcastEvent, Value)> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<BroadcastEvent> {
        self.events.lock().iter().map(|(_, e, _)| *e).collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, room: &str, event: BroadcastEvent, payload: Value) {
        self.events.lock().push((room.to_string(), event, payload));
    }
}
