//! Email transport seam.

use crate::notify::report::Message;
use log::info;
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("delivery to {recipient} failed: {reason}")]
    Delivery { recipient: String, reason: String },
}

/// Hands a rendered message to the outside world.
pub trait Mailer: Send + Sync {
    fn deliver(&self, recipient: &str, message: &Message) -> Result<(), MailError>;
}

/// Writes every message to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn deliver(&self, recipient: &str, message: &Message) -> Result<(), MailError> {
        info!("mail to {}: {}", recipient, message.subject);
        Ok(())
    }
}

/// Keeps delivered messages in memory. Recipients can be marked as
/// failing to simulate transport errors.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, Message)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().insert(recipient.to_string());
    }

    pub fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Mailer for RecordingMailer {
    fn deliver(&self, recipient: &str, message: &Message) -> Result<(), MailError> {
        if self.failing.lock().contains(recipient) {
            return Err(MailError::Delivery {
                recipient: recipient.to_string(),
                reason: "mailbox unavailable".to_string(),
            });
        }
        self.sent.lock().push((recipient.to_string(), message.clone()));
        Ok(())
    }
}
