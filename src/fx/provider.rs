//! External exchange-rate sources.

use crate::core::currency::CurrencyCode;
use log::{error, info};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate provider returned an error: {0}")]
    Api(String),
    #[error("rate provider has no rate for {from} -> {to}")]
    MissingRate { from: CurrencyCode, to: CurrencyCode },
    #[error("unparseable rate {0}")]
    Parse(String),
    #[error("rate provider unavailable")]
    Unavailable,
}

/// Source of live exchange rates: 1 unit of `from` = rate units of `to`.
pub trait RateProvider: Send + Sync {
    fn fetch_rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<Decimal, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct LatestRatesResponse {
    result: String,
    #[serde(default)]
    rates: HashMap<String, serde_json::Number>,
}

/// Client for an open.er-api.com compatible `/latest/{base}` endpoint.
pub struct HttpRateProvider {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpRateProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl RateProvider for HttpRateProvider {
    fn fetch_rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<Decimal, ProviderError> {
        let url = format!("{}/latest/{}", self.base_url, from);
        let body: LatestRatesResponse = self.client.get(&url).send()?.error_for_status()?.json()?;
        if body.result != "success" {
            error!("rate API returned result={} for {}", body.result, from);
            return Err(ProviderError::Api(body.result));
        }
        let raw = body
            .rates
            .get(to.as_str())
            .ok_or_else(|| ProviderError::MissingRate {
                from: from.clone(),
                to: to.clone(),
            })?
            .to_string();
        let rate = Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map_err(|_| ProviderError::Parse(raw))?;
        info!("fetched exchange rate {}/{}: {}", from, to, rate);
        Ok(rate)
    }
}

/// In-memory rate table.
///
/// Setting a rate also stores its inverse. The provider can be switched
/// offline to exercise the converter's fallback path, and counts lookups.
#[derive(Debug, Default)]
pub struct StaticRateProvider {
    rates: RwLock<HashMap<(CurrencyCode, CurrencyCode), Decimal>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl StaticRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`StaticRateProvider::set_rate`].
    pub fn with_rate(self, from: &str, to: &str, rate: Decimal) -> Self {
        self.set_rate(from, to, rate);
        self
    }

    pub fn set_rate(&self, from: &str, to: &str, rate: Decimal) {
        let (from, to) = (CurrencyCode::new(from), CurrencyCode::new(to));
        let mut rates = self.rates.write();
        if rate > Decimal::ZERO {
            rates.insert((to.clone(), from.clone()), Decimal::ONE / rate);
        }
        rates.insert((from, to), rate);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RateProvider for StaticRateProvider {
    fn fetch_rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<Decimal, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable);
        }
        self.rates
            .read()
            .get(&(from.clone(), to.clone()))
            .copied()
            .ok_or_else(|| ProviderError::MissingRate {
                from: from.clone(),
                to: to.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_static_provider_stores_inverse() {
        let provider = StaticRateProvider::new().with_rate("EUR", "USD", dec!(2));
        let inverse = provider
            .fetch_rate(&CurrencyCode::new("USD"), &CurrencyCode::new("EUR"))
            .unwrap();
        assert_eq!(inverse, dec!(0.5));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn test_offline_provider_fails() {
        let provider = StaticRateProvider::new().with_rate("EUR", "USD", dec!(1.1));
        provider.set_offline(true);
        assert!(matches!(
            provider.fetch_rate(&CurrencyCode::new("EUR"), &CurrencyCode::new("USD")),
            Err(ProviderError::Unavailable)
        ));
    }
}
