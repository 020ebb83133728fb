use crate::clock::Clock;
use crate::core::currency::{
    round_money, CurrencyCode, CurrencyError, CurrencyPair, ExchangeRate, SUPPORTED_CURRENCIES,
};
use crate::fx::provider::RateProvider;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Default freshness window for cached rates, in seconds.
pub const DEFAULT_FRESHNESS_SECS: i64 = 3600;

/// Age after which the settlement check prunes a cached rate.
pub const STALE_RATE_MAX_AGE_HOURS: i64 = 24;

/// A rate as last seen from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRate {
    pub rate: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Converts amounts between currencies through a shared rate cache.
///
/// Lookups serve a cached rate while it is fresh. A stale or missing entry
/// triggers a provider fetch; when the fetch fails the stale entry is
/// served anyway, and only a pair that was never fetched is unavailable.
///
/// With a store attached ([`CurrencyConverter::with_store`]) every
/// successful fetch is written through to the store's exchange-rate table,
/// and a pair missing from memory is loaded from there. The stale fallback
/// therefore survives a restart. Non-identity lookups then open their own
/// transaction, so they must not run while the calling thread holds one.
///
/// # Examples
///
/// ```
/// use settlement_engine::clock::SystemClock;
/// use settlement_engine::core::currency::CurrencyCode;
/// use settlement_engine::fx::{CurrencyConverter, StaticRateProvider};
/// use rust_decimal_macros::dec;
/// use std::sync::Arc;
///
/// let provider = StaticRateProvider::new().with_rate("EUR", "USD", dec!(1.1));
/// let converter = CurrencyConverter::new(Arc::new(provider), Arc::new(SystemClock));
///
/// let usd = converter
///     .convert(dec!(10), &CurrencyCode::new("EUR"), &CurrencyCode::new("USD"))
///     .unwrap();
/// assert_eq!(usd, dec!(11.00));
/// ```
pub struct CurrencyConverter {
    provider: Arc<dyn RateProvider>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    cache: RwLock<HashMap<CurrencyPair, CachedRate>>,
    store: Option<Arc<dyn Store>>,
}

impl CurrencyConverter {
    pub fn new(provider: Arc<dyn RateProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            clock,
            freshness: Duration::seconds(DEFAULT_FRESHNESS_SECS),
            cache: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Persist fetched rates in `store` and read them back on a cold cache.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current rate for `from -> to`.
    pub fn rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<Decimal, CurrencyError> {
        if from == to {
            return Ok(Decimal::ONE);
        }
        let pair = CurrencyPair::new(from.clone(), to.clone());
        let now = self.clock.now();
        let cached = self.cache.read().get(&pair).copied().or_else(|| self.load(&pair));

        if let Some(entry) = cached {
            if now - entry.updated_at < self.freshness {
                return Ok(entry.rate);
            }
        }

        match self.provider.fetch_rate(from, to) {
            Ok(rate) if rate > Decimal::ZERO => {
                let entry = CachedRate { rate, updated_at: now };
                self.cache.write().insert(pair.clone(), entry);
                self.persist(&pair, entry);
                return Ok(rate);
            }
            Ok(rate) => error!("provider returned non-positive rate {} for {}", rate, pair),
            Err(e) => error!("failed to fetch exchange rate {}: {}", pair, e),
        }

        match cached {
            Some(entry) => {
                warn!("using stale exchange rate for {} from {}", pair, entry.updated_at);
                Ok(entry.rate)
            }
            None => Err(CurrencyError::RateUnavailable {
                from: from.clone(),
                to: to.clone(),
            }),
        }
    }

    /// Convert `amount` and round half-up to the target currency.
    /// Identity conversions return the amount untouched.
    pub fn convert(
        &self,
        amount: Decimal,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<Decimal, CurrencyError> {
        if from == to {
            return Ok(amount);
        }
        let rate = self.rate(from, to)?;
        Ok(round_money(amount * rate, to))
    }

    /// Rates from `base` to every other supported currency that resolves.
    pub fn latest_rates(&self, base: &CurrencyCode) -> BTreeMap<CurrencyCode, Decimal> {
        SUPPORTED_CURRENCIES
            .iter()
            .map(|c| CurrencyCode::new(c.code))
            .filter(|c| c != base)
            .filter_map(|c| self.rate(base, &c).ok().map(|r| (c, r)))
            .collect()
    }

    /// Seed or overwrite a cache entry.
    pub fn prime(&self, from: &CurrencyCode, to: &CurrencyCode, rate: Decimal, updated_at: DateTime<Utc>) {
        self.cache.write().insert(
            CurrencyPair::new(from.clone(), to.clone()),
            CachedRate { rate, updated_at },
        );
    }

    pub fn cached(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<CachedRate> {
        self.cache
            .read()
            .get(&CurrencyPair::new(from.clone(), to.clone()))
            .copied()
    }

    /// Drop cache entries older than `max_age`, in memory and in the
    /// store. Returns how many pairs went.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let mut removed: HashSet<CurrencyPair> = {
            let mut cache = self.cache.write();
            let stale: Vec<CurrencyPair> = cache
                .iter()
                .filter(|(_, entry)| entry.updated_at < cutoff)
                .map(|(pair, _)| pair.clone())
                .collect();
            for pair in &stale {
                cache.remove(pair);
            }
            stale.into_iter().collect()
        };
        if let Some(store) = &self.store {
            let result = store.begin().and_then(|mut tx| {
                let pairs = tx.tables_mut().remove_exchange_rates_before(cutoff);
                tx.commit().map(|()| pairs)
            });
            match result {
                Ok(pairs) => removed.extend(pairs),
                Err(e) => error!("failed to purge stored exchange rates: {}", e),
            }
        }
        if !removed.is_empty() {
            info!("purged {} stale exchange rates", removed.len());
        }
        removed.len()
    }

    fn load(&self, pair: &CurrencyPair) -> Option<CachedRate> {
        let store = self.store.as_ref()?;
        let entry = store.snapshot().exchange_rate(pair).map(|r| CachedRate {
            rate: r.rate,
            updated_at: r.updated_at,
        })?;
        self.cache.write().insert(pair.clone(), entry);
        Some(entry)
    }

    fn persist(&self, pair: &CurrencyPair, entry: CachedRate) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store.begin().and_then(|mut tx| {
            tx.tables_mut().upsert_exchange_rate(ExchangeRate {
                from: pair.base.clone(),
                to: pair.quote.clone(),
                rate: entry.rate,
                updated_at: entry.updated_at,
            });
            tx.commit()
        });
        if let Err(e) = result {
            warn!("could not persist exchange rate {}: {}", pair, e);
        }
    }
}
