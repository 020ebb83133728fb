use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// ISO 4217 currency code.
///
/// Codes are normalized to upper case on construction. Whether a code is
/// one the application accepts for groups and expenses is a separate
/// question answered by [`CurrencyCode::supported`].
///
/// # Examples
///
/// ```
/// use settlement_engine::core::currency::CurrencyCode;
///
/// let usd = CurrencyCode::new("usd");
/// assert_eq!(usd.as_str(), "USD");
/// assert!(CurrencyCode::supported("EUR").is_ok());
/// assert!(CurrencyCode::supported("XXX").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_ascii_uppercase())
    }

    /// Build a code and check it against the supported currency table.
    pub fn supported(code: &str) -> Result<Self, CurrencyError> {
        let code = Self::new(code);
        if code.info().is_some() {
            Ok(code)
        } else {
            Err(CurrencyError::Unsupported(code))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table entry for this code, if the currency is supported.
    pub fn info(&self) -> Option<&'static CurrencyInfo> {
        SUPPORTED_CURRENCIES.iter().find(|c| c.code == self.0)
    }

    /// Number of decimal places amounts in this currency are rounded to.
    pub fn minor_units(&self) -> u32 {
        self.info().map(|c| c.minor_units).unwrap_or(2)
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CurrencyCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Errors arising from currency lookups and conversion.
#[derive(Debug, Error)]
pub enum CurrencyError {
    #[error("unsupported currency: {0}")]
    Unsupported(CurrencyCode),
    #[error("no exchange rate available for {from} -> {to}")]
    RateUnavailable { from: CurrencyCode, to: CurrencyCode },
}

/// A directed currency pair, used as the rate cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CurrencyPair {
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
}

impl CurrencyPair {
    pub fn new(base: CurrencyCode, quote: CurrencyCode) -> Self {
        Self { base, quote }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Last rate fetched for a pair, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub rate: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRate {
    pub fn pair(&self) -> CurrencyPair {
        CurrencyPair::new(self.from.clone(), self.to.clone())
    }
}

/// Static description of a supported currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyInfo {
    pub code: &'static str,
    pub symbol: &'static str,
    pub name: &'static str,
    pub minor_units: u32,
}

const fn info(code: &'static str, symbol: &'static str, name: &'static str, minor_units: u32) -> CurrencyInfo {
    CurrencyInfo {
        code,
        symbol,
        name,
        minor_units,
    }
}

/// Currencies accepted for groups and expenses.
pub const SUPPORTED_CURRENCIES: &[CurrencyInfo] = &[
    info("USD", "$", "US Dollar", 2),
    info("EUR", "€", "Euro", 2),
    info("GBP", "£", "British Pound", 2),
    info("JPY", "¥", "Japanese Yen", 0),
    info("CAD", "C$", "Canadian Dollar", 2),
    info("AUD", "A$", "Australian Dollar", 2),
    info("CHF", "CHF", "Swiss Franc", 2),
    info("CNY", "¥", "Chinese Yuan", 2),
    info("SEK", "kr", "Swedish Krona", 2),
    info("NOK", "kr", "Norwegian Krone", 2),
    info("DKK", "kr", "Danish Krone", 2),
    info("PLN", "zł", "Polish Zloty", 2),
    info("CZK", "Kč", "Czech Koruna", 2),
    info("HUF", "Ft", "Hungarian Forint", 2),
    info("RUB", "₽", "Russian Ruble", 2),
    info("BRL", "R$", "Brazilian Real", 2),
    info("MXN", "$", "Mexican Peso", 2),
    info("INR", "₹", "Indian Rupee", 2),
    info("KRW", "₩", "South Korean Won", 0),
    info("SGD", "S$", "Singapore Dollar", 2),
    info("HKD", "HK$", "Hong Kong Dollar", 2),
    info("NZD", "NZ$", "New Zealand Dollar", 2),
];

/// Round half-up (away from zero on a tie) to `dp` decimal places.
pub fn round_half_up(amount: Decimal, dp: u32) -> Decimal {
    amount.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Round an amount to the minor units of `currency`.
///
/// ```
/// use settlement_engine::core::currency::{round_money, CurrencyCode};
/// use rust_decimal_macros::dec;
///
/// assert_eq!(round_money(dec!(10.005), &CurrencyCode::new("EUR")), dec!(10.01));
/// assert_eq!(round_money(dec!(1234.5), &CurrencyCode::new("JPY")), dec!(1235));
/// ```
pub fn round_money(amount: Decimal, currency: &CurrencyCode) -> Decimal {
    round_half_up(amount, currency.minor_units())
}

/// Render an amount with the currency symbol in front, e.g. `€12.50`.
///
/// Unknown currencies fall back to `12.50 XYZ`.
pub fn format_amount(amount: Decimal, currency: &CurrencyCode) -> String {
    match currency.info() {
        Some(info) => {
            let rounded = round_money(amount, currency);
            format!("{}{:.*}", info.symbol, info.minor_units as usize, rounded)
        }
        None => format!("{:.2} {}", round_half_up(amount, 2), currency),
    }
}

/// Render an amount with the code after it, e.g. `12.50 EUR`.
pub fn format_amount_suffix(amount: Decimal, currency: &CurrencyCode) -> String {
    let dp = currency.minor_units();
    format!("{:.*} {}", dp as usize, round_half_up(amount, dp), currency)
}
