//! Dip-arb: automated two-leg arbitrage on 15-minute binary option markets.
//!
//! When the best asks of a market's two complementary outcome tokens sum
//! to less than $1.00, buying both sides locks in a payout greater than
//! total cost. This crate is the trading control plane around that edge:
//! a per-market state machine that consumes dip signals, enters the two
//! legs, manages order lifecycles with partial-fill and timeout handling,
//! places protective exit sells, liquidates leg 1 when no hedge arrives in
//! time, and survives market rotations without orphaning orders.
//!
//! ## Modules
//!
//! - `config`: TOML configuration with env and CLI overrides
//! - `events`: typed outgoing event bus
//! - `fees`: taker fee estimation and maker-vs-taker order kind selection
//! - `sizer`: balance-based share sizing with a consecutive-loss breaker
//! - `paper`: deterministic balance/position simulation for paper trading
//! - `journal`: append-only JSONL trade log
//! - `signal`: the contract surface of the external dip detector
//! - `strategy`: the arbitrage controller and price aggregator

pub mod config;
pub mod events;
pub mod fees;
pub mod journal;
pub mod paper;
pub mod signal;
pub mod sizer;
pub mod strategy;

pub use config::{ApiConfig, BotConfig, PaperConfig, RiskConfig, TradingConfig, TradingMode};
pub use events::{EventBus, PriceSnapshot, StrategyEvent, TradeFill};
pub use fees::OrderKind;
pub use paper::{PaperPosition, PaperSim, PaperSimConfig};
pub use signal::{
    signal_endpoint, DipSignal, ExecutionReport, Phase, RoundStatus, SignalControl, SignalEndpoint,
    SignalEvent, SignalHandle, SignalKind, SignalOrigin, SignalTuning, TopOfBook,
};
pub use sizer::{PositionSizer, SizerConfig};
pub use strategy::controller::{ArbController, ControllerConfig};
pub use strategy::prices::{PriceAggregator, PriceAggregatorConfig};
pub use strategy::{
    Cycle, CycleReport, CycleState, CycleStatus, Leg, OrderIntent, PendingOrder, StrategyError,
    StrategyStats,
};
