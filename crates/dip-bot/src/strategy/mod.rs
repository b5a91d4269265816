//! The arbitrage strategy: per-market state machine and price aggregation.
//!
//! ## Cycle lifecycle
//!
//! ```text
//! Watching -> Leg1Pending -> WaitingForHedge -> Leg2Pending -> Completed -> Watching
//!                                   \________________/
//!                                            v
//!                                      EmergencyExit -> Watching
//! ```
//!
//! One cycle per market by default; the attempt counter bars re-entry
//! until rotation. Finalization is idempotent and fill callbacks are
//! checked against the expected-order-id set, which together defend
//! against races between the polling loop and the detector's execution
//! events.

pub mod controller;
pub mod prices;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dip_common::{Market, OutcomeSide};
use dip_exchange::ExchangeError;

use crate::fees::OrderKind;

/// Errors that can occur in the strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("No active market found after {0} attempts")]
    NoMarket(u32),

    #[error("Signal stream closed")]
    SignalStreamClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Monotonic state of the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    /// No cycle in flight; leg-1 signals are admissible.
    Watching,
    /// Leg-1 maker limit resting, awaiting fill.
    Leg1Pending,
    /// Leg 1 filled, waiting for an acceptable hedge.
    WaitingForHedge,
    /// Leg-2 maker limit resting, awaiting fill.
    Leg2Pending,
    /// Both legs filled and the cycle finalized.
    Completed,
    /// Leg 1 liquidated before expiry without a hedge.
    EmergencyExit,
}

impl CycleState {
    /// States in which leg 1 is held and leg 2 is not yet confirmed.
    pub fn holds_unhedged_leg1(&self) -> bool {
        matches!(self, CycleState::WaitingForHedge | CycleState::Leg2Pending)
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleState::Watching => "watching",
            CycleState::Leg1Pending => "leg1_pending",
            CycleState::WaitingForHedge => "waiting_for_hedge",
            CycleState::Leg2Pending => "leg2_pending",
            CycleState::Completed => "completed",
            CycleState::EmergencyExit => "emergency_exit",
        };
        write!(f, "{}", s)
    }
}

/// A filled purchase on one side of the market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    /// Which outcome token was bought.
    pub side: OutcomeSide,
    /// Fill price, strictly in (0, 1).
    pub price: Decimal,
    /// Share quantity, > 0.
    pub qty: Decimal,
    /// Token that was bought.
    pub token_id: String,
    /// How the order was placed.
    pub order_kind: OrderKind,
    /// Best bid observed at fill, if known.
    pub best_bid: Option<Decimal>,
    /// Best ask observed at fill, if known.
    pub best_ask: Option<Decimal>,
    /// Exchange order ID, if one was assigned.
    pub order_id: Option<String>,
    /// When the fill was recorded.
    pub filled_at: DateTime<Utc>,
}

impl Leg {
    /// Total cost of the leg.
    #[inline]
    pub fn cost(&self) -> Decimal {
        self.price * self.qty
    }
}

/// Per-market unit of work. At most one cycle is non-terminal at a time.
#[derive(Debug, Clone)]
pub struct Cycle {
    /// The market this cycle trades. Immutable for the cycle's life.
    pub market: Market,
    /// Current state.
    pub state: CycleState,
    /// First leg, once filled.
    pub leg1: Option<Leg>,
    /// Hedge leg, once filled.
    pub leg2: Option<Leg>,
    /// Guards finalization; once set, repeat finalizations are no-ops.
    pub finalized: bool,
}

impl Cycle {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            state: CycleState::Watching,
            leg1: None,
            leg2: None,
            finalized: false,
        }
    }
}

/// Why a pending exchange order exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Leg1Buy,
    Leg2Buy,
    Leg1ExitSell,
    Leg2ExitSell,
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderIntent::Leg1Buy => "leg1_buy",
            OrderIntent::Leg2Buy => "leg2_buy",
            OrderIntent::Leg1ExitSell => "leg1_exit_sell",
            OrderIntent::Leg2ExitSell => "leg2_exit_sell",
        };
        write!(f, "{}", s)
    }
}

/// A live exchange order the controller is awaiting.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    /// Exchange order ID.
    pub order_id: String,
    /// What the order is for.
    pub intent: OrderIntent,
    /// Limit price the order rests at.
    pub limit_price: Decimal,
    /// Target share quantity.
    pub target_qty: Decimal,
    /// Outcome side being traded.
    pub side: OutcomeSide,
    /// Token the order trades.
    pub token_id: String,
    /// Best bid observed when the order was placed.
    pub best_bid: Option<Decimal>,
    /// Best ask observed when the order was placed.
    pub best_ask: Option<Decimal>,
    /// When polling started.
    pub started_at: DateTime<Utc>,
}

impl PendingOrder {
    /// Milliseconds since polling started.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_milliseconds().max(0)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    Abandoned,
    EmergencyExit,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Abandoned => "abandoned",
            CycleStatus::EmergencyExit => "emergency_exit",
        };
        write!(f, "{}", s)
    }
}

/// Final accounting for a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// Market the cycle ran on.
    pub market_id: String,
    /// How it ended.
    pub status: CycleStatus,
    /// Guaranteed payout: min(leg1.qty, leg2.qty), or the exit value on
    /// an emergency liquidation.
    pub payout: Decimal,
    /// Total cost across filled legs.
    pub total_cost: Decimal,
    /// payout - total_cost.
    pub profit: Decimal,
    /// profit / total_cost, zero when cost is zero.
    pub profit_pct: Decimal,
    /// When the cycle was finalized.
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn new(
        market_id: impl Into<String>,
        status: CycleStatus,
        payout: Decimal,
        total_cost: Decimal,
    ) -> Self {
        let profit = payout - total_cost;
        let profit_pct = if total_cost > Decimal::ZERO {
            profit / total_cost
        } else {
            Decimal::ZERO
        };
        Self {
            market_id: market_id.into(),
            status,
            payout,
            total_cost,
            profit,
            profit_pct,
            completed_at: Utc::now(),
        }
    }
}

/// Running strategy statistics. Mutated only by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    pub cycles_won: u64,
    pub total_profit: Decimal,
    pub emergency_exits: u64,
}

impl StrategyStats {
    /// Won cycles over all finished cycles.
    pub fn win_rate(&self) -> Decimal {
        let finished = self.cycles_completed + self.cycles_abandoned;
        if finished == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.cycles_won) / Decimal::from(finished)
    }
}
