//! Gamma REST client and mocked order placement
//!
//! Read-only market data with capped exponential backoff. Order placement is
//! a mock: dry-run orders return a stub receipt and live orders are refused.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Default Gamma API base URL
pub const GAMMA_BASE_URL: &str = "https://gamma-api.polymarket.com";

/// Doubling stops after this many steps
const MAX_BACKOFF_EXPONENT: u32 = 31;

/// Retry schedule for market-data requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled each time after
    pub base_delay: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(750),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based); saturates at `Duration::MAX`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

/// Statuses worth retrying
pub fn is_transient(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Error type for market operations
#[derive(Debug)]
pub enum MarketError {
    Request(reqwest::Error),
    Status(u16),
    InvalidSide(String),
    LiveTradingDisabled,
}

impl std::fmt::Display for MarketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketError::Request(e) => write!(f, "Request error: {}", e),
            MarketError::Status(code) => write!(f, "Gamma API returned status {}", code),
            MarketError::InvalidSide(side) => {
                write!(f, "side must be 'buy' or 'sell', got '{}'", side)
            }
            MarketError::LiveTradingDisabled => write!(
                f,
                "Live trading is disabled. Enable only after audit and confirmation."
            ),
        }
    }
}

impl std::error::Error for MarketError {}

impl From<reqwest::Error> for MarketError {
    fn from(e: reqwest::Error) -> Self {
        MarketError::Request(e)
    }
}

/// Client for the Gamma market-data API
#[derive(Clone)]
pub struct MarketClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl MarketClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            retry,
        }
    }

    /// GET with backoff on transport errors and transient statuses
    async fn get_with_backoff(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, MarketError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 1;
        loop {
            let result = self
                .client
                .get(&url)
                .query(query)
                .timeout(self.retry.request_timeout)
                .send()
                .await;

            let retryable = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let code = response.status().as_u16();
                    if !is_transient(code) {
                        return Err(MarketError::Status(code));
                    }
                    MarketError::Status(code)
                }
                Err(e) => MarketError::Request(e),
            };

            if attempt >= self.retry.max_attempts {
                return Err(retryable);
            }
            let delay = self.retry.delay_after(attempt);
            debug!(url = %url, attempt, error = %retryable, ?delay, "Retrying market request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// List markets, optionally filtered by `query`; `limit` is clamped to 1..=100
    pub async fn fetch_markets(&self, query: Option<&str>, limit: u32) -> Result<Value, MarketError> {
        let mut params = vec![("limit", limit.clamp(1, 100).to_string())];
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            params.push(("query", q.to_string()));
        }
        let response = self.get_with_backoff("/markets", &params).await?;
        Ok(response.json().await?)
    }

    /// Best-effort trade history
    ///
    /// Tries a few likely endpoints and returns the first JSON body. When none
    /// answers, returns `{"status": "unavailable", "message": ...}` instead of
    /// an error.
    pub async fn fetch_historical_data(&self, market_id: &str, limit: u32) -> Value {
        let candidates = [
            format!("/markets/{}/trades", market_id),
            format!("/markets/{}/history", market_id),
            format!("/markets/{}", market_id),
        ];
        let params = [("limit", limit.to_string())];
        let mut last_error: Option<String> = None;

        for path in &candidates {
            match self.get_with_backoff(path, &params).await {
                Ok(response) => {
                    let is_json = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.starts_with("application/json"))
                        .unwrap_or(false);
                    if !is_json {
                        continue;
                    }
                    match response.json::<Value>().await {
                        Ok(body) => return body,
                        Err(e) => last_error = Some(e.to_string()),
                    }
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "History endpoint unavailable");
                    last_error = Some(e.to_string());
                }
            }
        }

        json!({
            "status": "unavailable",
            "message": last_error.unwrap_or_else(|| "No endpoint available".to_string()),
        })
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::str::FromStr for OrderSide {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(MarketError::InvalidSide(other.to_string())),
        }
    }
}

/// Receipt of a simulated order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderReceipt {
    pub status: String,
    pub message: String,
    pub market_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub order_id: String,
}

/// Mocked order placement
///
/// Dry-run orders return a stub receipt with a `dry_<millis>` id; live
/// orders are always refused.
pub fn place_order(
    market_id: &str,
    side: &str,
    price: f64,
    size: f64,
    dry_run: bool,
) -> Result<OrderReceipt, MarketError> {
    let side: OrderSide = side.parse()?;
    if !dry_run {
        return Err(MarketError::LiveTradingDisabled);
    }
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Ok(OrderReceipt {
        status: "dry_run".to_string(),
        message: "Order simulated; no live trade executed.".to_string(),
        market_id: market_id.to_string(),
        side,
        price,
        size,
        order_id: format!("dry_{}", millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(750));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_millis(750));
        assert!(policy.delay_after(40) >= policy.delay_after(32));

        let huge = RetryPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            ..Default::default()
        };
        assert_eq!(huge.delay_after(10), Duration::MAX);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(429));
        assert!(is_transient(503));
        assert!(!is_transient(404));
        assert!(!is_transient(400));
    }

    #[test]
    fn test_place_order_dry_run() {
        let receipt = place_order("mkt-1", "buy", 0.42, 10.0, true).unwrap();
        assert_eq!(receipt.status, "dry_run");
        assert_eq!(receipt.side, OrderSide::Buy);
        assert!(receipt.order_id.starts_with("dry_"));

        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["side"], "buy");
    }

    #[test]
    fn test_place_order_rejects_bad_side_and_live_mode() {
        assert!(matches!(
            place_order("mkt-1", "hold", 0.5, 1.0, true),
            Err(MarketError::InvalidSide(_))
        ));
        assert!(matches!(
            place_order("mkt-1", "sell", 0.5, 1.0, false),
            Err(MarketError::LiveTradingDisabled)
        ));
    }
}
