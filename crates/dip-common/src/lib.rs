//! Shared types for the dip-arb trading bot.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{BookLevel, Market, MarketDuration, OutcomeSide, Side};
