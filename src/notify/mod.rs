//! Outgoing notifications: rate limiting, rendering, delivery and
//! real-time broadcasts.

pub mod broadcast;
pub mod dispatcher;
pub mod mailer;
pub mod rate_limit;
pub mod report;

pub use broadcast::{BroadcastEvent, Broadcaster, LogBroadcaster, RecordingBroadcaster};
pub use dispatcher::{
    is_valid_email, DeliveryOutcome, DeliverySummary, NotificationDispatcher, NotificationRequest,
};
pub use mailer::{LogMailer, MailError, Mailer, RecordingMailer};
pub use rate_limit::{RateDecision, RateLimitPolicy, SendHistory};
pub use report::{Message, ReportVariant};
