//! Pure pricing and sizing helpers
//!
//! Prices are Polymarket-style probabilities in `[0, 1]`. None of these
//! functions touch the network.

use serde::Serialize;
use serde_json::Value;

/// Mid price of an order book snapshot with `best_bid` / `best_ask` fields.
///
/// Both sides must be present and strictly positive; numeric strings are
/// accepted. Returns `None` otherwise.
pub fn compute_mid_price(book: &Value) -> Option<f64> {
    let bid = price_field(book, "best_bid")?;
    let ask = price_field(book, "best_ask")?;
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    Some((bid + ask) / 2.0)
}

fn price_field(book: &Value, key: &str) -> Option<f64> {
    let value = book.get(key)?;
    let price = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))?;
    price.is_finite().then_some(price)
}

/// Price gap between two quotes of the same outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageSignal {
    /// Absolute difference
    pub spread: f64,
    /// Spread relative to the cheaper quote
    pub relative: f64,
    /// "buy_a_sell_b" or "buy_b_sell_a"
    pub direction: String,
}

/// Report a gap when the relative spread exceeds `max_rel_spread`
pub fn detect_simple_arbitrage(
    price_a: f64,
    price_b: f64,
    max_rel_spread: f64,
) -> Option<ArbitrageSignal> {
    if price_a <= 0.0 || price_b <= 0.0 {
        return None;
    }
    let spread = (price_a - price_b).abs();
    let relative = spread / price_a.min(price_b);
    if relative <= max_rel_spread {
        return None;
    }
    let direction = if price_a < price_b {
        "buy_a_sell_b"
    } else {
        "buy_b_sell_a"
    };
    Some(ArbitrageSignal {
        spread,
        relative,
        direction: direction.to_string(),
    })
}

/// Trailing average; the first `window - 1` slots are `None`
pub fn simple_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        if i + 1 >= window {
            out.push(Some(sum / window as f64));
        } else {
            out.push(None);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Venue {
    A,
    B,
}

/// YES-price comparison across two markets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    pub spread: f64,
    /// Spread exceeds the fee rate
    pub actionable: bool,
    pub buy_on: Venue,
    pub sell_on: Venue,
}

pub fn calculate_arbitrage_opportunity(
    yes_price_a: f64,
    yes_price_b: f64,
    fee_rate: f64,
) -> ArbitrageOpportunity {
    let spread = (yes_price_a - yes_price_b).abs();
    let (buy_on, sell_on) = if yes_price_a < yes_price_b {
        (Venue::A, Venue::B)
    } else {
        (Venue::B, Venue::A)
    };
    ArbitrageOpportunity {
        spread,
        actionable: spread > fee_rate,
        buy_on,
        sell_on,
    }
}

/// Units affordable with `risk_fraction` of the bankroll, rounded to 6 places
pub fn position_size_simple(bankroll_usdc: f64, risk_fraction: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let budget = bankroll_usdc * risk_fraction.clamp(0.0, 1.0);
    ((budget / price) * 1e6).round() / 1e6
}

/// True once the drawdown from `entry_price` reaches `threshold`
pub fn apply_stop_loss(current_price: f64, entry_price: f64, threshold: f64) -> bool {
    if entry_price <= 0.0 {
        return false;
    }
    let drawdown = (entry_price - current_price) / entry_price;
    drawdown >= threshold.max(0.0)
}
