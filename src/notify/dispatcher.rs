use crate::clock::Clock;
use crate::core::ids::{EmailLogId, GroupId, ParticipantId};
use crate::core::notification::NotificationKind;
use crate::notify::mailer::Mailer;
use crate::notify::rate_limit::{RateDecision, RateLimitPolicy};
use crate::notify::report::Message;
use crate::store::Store;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;

/// One notification to deliver.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub recipient: String,
    pub group_id: Option<GroupId>,
    pub participant_id: Option<ParticipantId>,
    pub message: Message,
}

/// What happened to one request. `reason` is always filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub reason: String,
}

impl DeliveryOutcome {
    fn sent() -> Self {
        Self {
            success: true,
            reason: "Email sent successfully".to_string(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// Aggregate of a fan-out to several recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub sent: usize,
    pub failed: Vec<(String, String)>,
    pub no_email: usize,
}

impl DeliverySummary {
    pub fn record(&mut self, recipient: &str, outcome: &DeliveryOutcome) {
        if outcome.success {
            self.sent += 1;
        } else {
            self.failed.push((recipient.to_string(), outcome.reason.clone()));
        }
    }

    pub fn skip_no_email(&mut self) {
        self.no_email += 1;
    }

    pub fn attempted(&self) -> usize {
        self.sent + self.failed.len()
    }
}

/// Loose address check: `local@domain.tld`, no whitespace, no control
/// characters.
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    local_ok && host_ok && tld_ok
}

/// Sends notifications through a [`Mailer`], enforcing the rate-limit
/// policy and logging every attempt.
///
/// Each attempt is recorded in a transaction of its own, so callers must
/// not hold one while sending.
pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn Mailer>,
        policy: RateLimitPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            mailer,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Deliver one notification. Never fails; the outcome says what
    /// happened.
    pub fn send(&self, request: &NotificationRequest) -> DeliveryOutcome {
        if !is_valid_email(&request.recipient) {
            warn!("refusing to send {} to invalid address {:?}", request.kind, request.recipient);
            return DeliveryOutcome::failed("Invalid email address");
        }
        let now = self.clock.now();

        // The limit check and the log row share one transaction, so two
        // concurrent sends cannot both pass a cap. The row is reserved as a
        // success and downgraded if the mailer fails.
        let reservation = self.store.begin().and_then(|mut tx| {
            let decision = self.policy.check(
                tx.tables(),
                &request.recipient,
                request.kind,
                request.group_id,
                now,
            );
            let error = match &decision {
                RateDecision::Allowed => None,
                RateDecision::Rejected(reason) => Some(reason.clone()),
            };
            let id = tx.tables_mut().record_email(
                &request.recipient,
                request.kind,
                request.group_id,
                request.participant_id,
                &request.message.subject,
                error,
                now,
            );
            tx.commit().map(|()| (decision, id))
        });
        let log_id = match reservation {
            Ok((RateDecision::Allowed, id)) => id,
            Ok((RateDecision::Rejected(reason), _)) => {
                warn!("email rate limit exceeded for {}: {}", request.recipient, reason);
                return DeliveryOutcome::failed(format!("Rate limit exceeded: {reason}"));
            }
            Err(e) => {
                error!("failed to log email attempt to {}: {}", request.recipient, e);
                return DeliveryOutcome::failed("Email delivery failed");
            }
        };

        match self.mailer.deliver(&request.recipient, &request.message) {
            Ok(()) => {
                info!("sent {} email to {}", request.kind, request.recipient);
                DeliveryOutcome::sent()
            }
            Err(e) => {
                error!("{} email to {} failed: {}", request.kind, request.recipient, e);
                self.mark_failed(log_id, e.to_string());
                DeliveryOutcome::failed("Email delivery failed")
            }
        }
    }

    fn mark_failed(&self, id: EmailLogId, reason: String) {
        let result = self.store.begin().and_then(|mut tx| {
            tx.tables_mut().mark_email_failed(id, reason);
            tx.commit()
        });
        if let Err(e) = result {
            error!("failed to record delivery failure on {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::mailer::RecordingMailer;
    use crate::store::MemoryStore;
    use std::thread;

    fn request(kind: NotificationKind, to: &str) -> NotificationRequest {
        NotificationRequest {
            kind,
            recipient: to.to_string(),
            group_id: Some(GroupId::new(1)),
            participant_id: None,
            message: Message {
                subject: "Hello".into(),
                body: "Body".into(),
            },
        }
    }

    fn dispatcher(mailer: Arc<RecordingMailer>) -> (Arc<MemoryStore>, NotificationDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let d = NotificationDispatcher::new(
            store.clone(),
            mailer,
            RateLimitPolicy::default(),
            Arc::new(SystemClock),
        );
        (store, d)
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ana.b+tag@example.co"));
        assert!(!is_valid_email("ana@example"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ana example@x.com"));
        assert!(!is_valid_email("ana@ex.c0m"));
    }

    #[test]
    fn test_successful_send_is_logged() {
        let mailer = Arc::new(RecordingMailer::new());
        let (store, d) = dispatcher(mailer.clone());
        let outcome = d.send(&request(NotificationKind::Settlement, "a@x.io"));
        assert!(outcome.success);
        assert_eq!(mailer.sent().len(), 1);
        let logs: Vec<_> = store.snapshot().email_logs().cloned().collect();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
    }

    #[test]
    fn test_rate_limited_send_is_logged_as_failure() {
        let mailer = Arc::new(RecordingMailer::new());
        let (store, d) = dispatcher(mailer.clone());
        assert!(d.send(&request(NotificationKind::Reminder, "a@x.io")).success);
        let second = d.send(&request(NotificationKind::Reminder, "a@x.io"));
        assert!(!second.success);
        assert_eq!(
            second.reason,
            "Rate limit exceeded: Daily reminder email limit exceeded for this group (1/1)"
        );
        assert_eq!(mailer.sent().len(), 1);
        let failures = store.snapshot().email_logs().filter(|l| !l.success).count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_transport_failure_reported() {
        let mailer = Arc::new(RecordingMailer::new());
        mailer.fail_for("down@x.io");
        let (_, d) = dispatcher(mailer);
        let outcome = d.send(&request(NotificationKind::Settlement, "down@x.io"));
        assert_eq!(outcome, DeliveryOutcome::failed("Email delivery failed"));
    }

    #[test]
    fn test_failed_delivery_does_not_count_against_limit() {
        let mailer = Arc::new(RecordingMailer::new());
        mailer.fail_for("a@x.io");
        let (store, d) = dispatcher(mailer.clone());
        assert!(!d.send(&request(NotificationKind::Reminder, "a@x.io")).success);
        let logs: Vec<_> = store.snapshot().email_logs().cloned().collect();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert!(logs[0].error.is_some());
        let counted = store.snapshot().count_sent(
            "a@x.io",
            Some(NotificationKind::Reminder),
            None,
            logs[0].sent_at - chrono::Duration::hours(1),
        );
        assert_eq!(counted, 0);
    }

    #[test]
    fn test_concurrent_sends_respect_cap() {
        let mailer = Arc::new(RecordingMailer::new());
        let (store, d) = dispatcher(mailer.clone());
        let d = Arc::new(d);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = Arc::clone(&d);
                thread::spawn(move || d.send(&request(NotificationKind::Reminder, "a@x.io")).success)
            })
            .collect();
        let sent = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(sent, 1);
        assert_eq!(mailer.sent().len(), 1);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.email_logs().filter(|l| l.success).count(), 1);
        assert_eq!(snapshot.email_logs().filter(|l| !l.success).count(), 7);
    }

    #[test]
    fn test_summary_aggregates() {
        let mut summary = DeliverySummary::default();
        summary.record("a@x.io", &DeliveryOutcome::sent());
        summary.record("b@x.io", &DeliveryOutcome::failed("nope"));
        summary.skip_no_email();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.attempted(), 2);
        assert_eq!(summary.failed, vec![("b@x.io".to_string(), "nope".to_string())]);
        assert_eq!(summary.no_email, 1);
    }
}
