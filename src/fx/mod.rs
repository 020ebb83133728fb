//! Exchange rates: provider clients and the caching converter.

pub mod converter;
pub mod provider;

pub use converter::{CachedRate, CurrencyConverter, DEFAULT_FRESHNESS_SECS, STALE_RATE_MAX_AGE_HOURS};
pub use provider::{HttpRateProvider, ProviderError, RateProvider, StaticRateProvider};
