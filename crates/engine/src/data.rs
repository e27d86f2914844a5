//! Market data retrieval with basic retry semantics

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::Kline;

const DAY_MS: i64 = 86_400_000;

/// How much daily history to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HistoryPeriod {
    Days(u32),
    /// Everything the source has
    Max,
}

impl HistoryPeriod {
    /// Start timestamp (ms) for a window ending at `end_millis`
    pub fn start_millis(&self, end_millis: i64) -> i64 {
        match self {
            HistoryPeriod::Days(days) => (end_millis - i64::from(*days) * DAY_MS).max(0),
            HistoryPeriod::Max => 0,
        }
    }
}

impl Default for HistoryPeriod {
    fn default() -> Self {
        HistoryPeriod::Days(5 * 365)
    }
}

impl FromStr for HistoryPeriod {
    type Err = anyhow::Error;

    /// Accepts `Nd`, `Nm` (30-day months), `Ny` (365-day years) or `max`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "max" {
            return Ok(HistoryPeriod::Max);
        }
        let Some(unit) = s.chars().last() else {
            anyhow::bail!("Empty history period");
        };
        let count: u32 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid history period '{s}' (e.g. 90d, 6m, 5y, max)"))?;
        if count == 0 {
            anyhow::bail!("History period must be positive, got '{s}'");
        }
        let days_per_unit = match unit {
            'd' => 1,
            'm' => 30,
            'y' => 365,
            _ => anyhow::bail!("Invalid history period unit in '{s}' (use d, m or y)"),
        };
        let Some(days) = count.checked_mul(days_per_unit) else {
            anyhow::bail!("History period '{s}' is too long");
        };
        Ok(HistoryPeriod::Days(days))
    }
}

impl fmt::Display for HistoryPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryPeriod::Days(d) if d % 365 == 0 => write!(f, "{}y", d / 365),
            HistoryPeriod::Days(d) => write!(f, "{d}d"),
            HistoryPeriod::Max => write!(f, "max"),
        }
    }
}

impl TryFrom<String> for HistoryPeriod {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HistoryPeriod> for String {
    fn from(p: HistoryPeriod) -> Self {
        p.to_string()
    }
}

/// A provider of daily OHLCV history
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_daily(&self, symbol: &str, period: HistoryPeriod) -> Result<Vec<Kline>>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub retries: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            pause: Duration::from_millis(1500),
        }
    }
}

/// Fetch daily history, retrying on errors and on empty responses
pub async fn fetch_prices<S: PriceSource + ?Sized>(
    source: &S,
    symbol: &str,
    period: HistoryPeriod,
    policy: &RetryPolicy,
) -> Result<Vec<Kline>> {
    let attempts = policy.retries.max(1);
    let mut last_error = String::from("no data returned");

    for attempt in 1..=attempts {
        match source.fetch_daily(symbol, period).await {
            Ok(klines) if !klines.is_empty() => {
                info!(symbol, bars = klines.len(), attempt, "Fetched price history");
                return Ok(klines);
            }
            Ok(_) => {
                last_error = "no data returned".to_string();
                warn!(symbol, attempt, "Empty price history");
            }
            Err(e) => {
                warn!(symbol, attempt, error = %e, "Price fetch failed");
                last_error = format!("{e:#}");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.pause).await;
        }
    }

    anyhow::bail!("Failed to fetch data for {symbol} after {attempts} attempts: {last_error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then returns one kline
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
        empty_instead_of_error: bool,
    }

    #[async_trait]
    impl PriceSource for FlakySource {
        async fn fetch_daily(&self, _symbol: &str, _period: HistoryPeriod) -> Result<Vec<Kline>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.empty_instead_of_error {
                    return Ok(Vec::new());
                }
                anyhow::bail!("HTTP 503");
            }
            Ok(vec![Kline {
                open_time: 0,
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                close: Decimal::ONE,
                volume: Decimal::ONE,
                close_time: DAY_MS - 1,
            }])
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            pause: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let source = FlakySource {
            failures: 2,
            calls: AtomicU32::new(0),
            empty_instead_of_error: false,
        };
        let klines = fetch_prices(&source, "BTCUSDT", HistoryPeriod::Days(10), &quick())
            .await
            .unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let source = FlakySource {
            failures: 5,
            calls: AtomicU32::new(0),
            empty_instead_of_error: false,
        };
        let err = fetch_prices(&source, "ETHUSDT", HistoryPeriod::Days(10), &quick())
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("ETHUSDT"));
        assert!(err.contains("HTTP 503"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_history_counts_as_failure() {
        let source = FlakySource {
            failures: 10,
            calls: AtomicU32::new(0),
            empty_instead_of_error: true,
        };
        let err = fetch_prices(&source, "SOLUSDT", HistoryPeriod::Max, &quick())
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("no data returned"));
    }

    #[test]
    fn test_period_parsing() {
        assert_eq!("5y".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Days(1825));
        assert_eq!("6m".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Days(180));
        assert_eq!("90d".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Days(90));
        assert_eq!("MAX".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Max);
        assert!("".parse::<HistoryPeriod>().is_err());
        assert!("0y".parse::<HistoryPeriod>().is_err());
        assert!("5w".parse::<HistoryPeriod>().is_err());
        assert!("y".parse::<HistoryPeriod>().is_err());
    }

    #[test]
    fn test_period_overflow_is_an_error() {
        let err = "20000000y".parse::<HistoryPeriod>().unwrap_err().to_string();
        assert!(err.contains("too long"), "{err}");
        assert!("4294967295m".parse::<HistoryPeriod>().is_err());
        assert_eq!(
            "4294967295d".parse::<HistoryPeriod>().unwrap(),
            HistoryPeriod::Days(u32::MAX)
        );
    }

    #[test]
    fn test_period_display_and_serde() {
        assert_eq!(HistoryPeriod::Days(730).to_string(), "2y");
        assert_eq!(HistoryPeriod::Days(45).to_string(), "45d");
        let p: HistoryPeriod = serde_json::from_str("\"2y\"").unwrap();
        assert_eq!(p, HistoryPeriod::Days(730));
        assert_eq!(serde_json::to_string(&HistoryPeriod::Max).unwrap(), "\"max\"");
    }

    #[test]
    fn test_start_millis() {
        assert_eq!(HistoryPeriod::Days(2).start_millis(10 * DAY_MS), 8 * DAY_MS);
        assert_eq!(HistoryPeriod::Max.start_millis(10 * DAY_MS), 0);
        assert_eq!(HistoryPeriod::Days(u32::MAX).start_millis(10 * DAY_MS), 0);
    }
}
