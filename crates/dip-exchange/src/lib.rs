//! Exchange adapter surface for the dip-arb trading bot.
//!
//! The trading control plane consumes a narrow order-management contract:
//! limit/market order placement, cancellation, per-order status queries,
//! one-shot book snapshots, and resolved-market redemption. This crate
//! defines that contract (`ExchangeClient`), the wire types it speaks, a
//! REST client for book snapshots, and a no-op client for paper trading
//! where no real orders ever leave the process.

pub mod client;
pub mod noop;
pub mod rest;
pub mod types;

pub use client::ExchangeClient;
pub use noop::NoopExchange;
pub use rest::{RestBookClient, RestBookConfig};
pub use types::{
    BookSnapshot, ExchangeError, LimitAck, MarketAck, OrderState, OrderStatus, SettleOutcome,
    SettleStrategy,
};
