//! Market-data helpers
//!
//! The sandbox lets generated programs import a helper module with this
//! surface. The Rust side is used by the REPL (`/markets`) and by tests.

pub mod client;
pub mod helpers;

pub use client::{place_order, MarketClient, MarketError, OrderReceipt, OrderSide, RetryPolicy, GAMMA_BASE_URL};
pub use helpers::{
    apply_stop_loss, calculate_arbitrage_opportunity, compute_mid_price, detect_simple_arbitrage,
    position_size_simple, simple_moving_average, ArbitrageOpportunity, ArbitrageSignal, Venue,
};
