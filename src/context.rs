//! Shared collaborators handed to every service.

use crate::clock::{Clock, SystemClock};
use crate::config::{Links, Settings};
use crate::fx::{CurrencyConverter, RateProvider};
use crate::notify::{Broadcaster, LogBroadcaster, LogMailer, Mailer, NotificationDispatcher, RateLimitPolicy};
use crate::store::{MemoryStore, Store};
use chrono::Duration;
use std::sync::Arc;

/// The wiring of one running application instance.
pub struct Context {
    pub store: Arc<dyn Store>,
    pub converter: Arc<CurrencyConverter>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub clock: Arc<dyn Clock>,
    pub links: Links,
    pub activity_log_limit: usize,
}

/// Builder for [`Context`]. Anything not supplied gets an in-memory or
/// logging default.
pub struct ContextBuilder {
    store: Option<Arc<dyn Store>>,
    provider: Arc<dyn RateProvider>,
    mailer: Arc<dyn Mailer>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
    links: Links,
    activity_log_limit: usize,
    rate_freshness: Duration,
}

impl Context {
    pub fn builder(provider: Arc<dyn RateProvider>) -> ContextBuilder {
        let defaults = Settings::default();
        ContextBuilder {
            store: None,
            provider,
            mailer: Arc::new(LogMailer),
            broadcaster: Arc::new(LogBroadcaster),
            clock: Arc::new(SystemClock),
            policy: defaults.rate_limit_policy(),
            links: defaults.links(),
            activity_log_limit: defaults.activity_log_limit,
            rate_freshness: Duration::seconds(defaults.rate_cache_seconds),
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

impl ContextBuilder {
    /// Apply limits, links and cache settings from `settings`.
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.policy = settings.rate_limit_policy();
        self.links = settings.links();
        self.activity_log_limit = settings.activity_log_limit;
        self.rate_freshness = Duration::seconds(settings.rate_cache_seconds);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rate_limits(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Context {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let converter = CurrencyConverter::new(self.provider, self.clock.clone())
            .with_freshness(self.rate_freshness)
            .with_store(store.clone());
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            self.mailer,
            self.policy,
            self.clock.clone(),
        );
        Context {
            store,
            converter: Arc::new(converter),
            dispatcher: Arc::new(dispatcher),
            broadcaster: self.broadcaster,
            clock: self.clock,
            links: self.links,
            activity_log_limit: self.activity_log_limit,
        }
    }
}
