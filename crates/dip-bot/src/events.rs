//! Typed outgoing event stream.
//!
//! The controller narrates its life through this bus: state changes, leg
//! fills, cycle results, price updates. Consumers are the paper
//! simulator's bookkeeping, the sizer's loss feedback, and any UI.
//! Delivery is best-effort fan-out over a broadcast channel; a slow
//! subscriber lags and drops, it never blocks the controller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use dip_common::{OutcomeSide, Side};

use crate::strategy::{CycleReport, CycleState, Leg};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// A fill applied by the paper simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    pub market_id: String,
    pub side: OutcomeSide,
    pub order_side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

/// Top-of-book snapshot for both sides of the current market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub up_bid: Option<Decimal>,
    pub up_bid_size: Option<Decimal>,
    pub up_ask: Option<Decimal>,
    pub up_ask_size: Option<Decimal>,
    pub down_bid: Option<Decimal>,
    pub down_bid_size: Option<Decimal>,
    pub down_ask: Option<Decimal>,
    pub down_ask_size: Option<Decimal>,
    /// up_ask + down_ask, when both are present.
    pub sum: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl PriceSnapshot {
    /// Best ask for a side.
    pub fn ask(&self, side: OutcomeSide) -> Option<Decimal> {
        match side {
            OutcomeSide::Up => self.up_ask,
            OutcomeSide::Down => self.down_ask,
        }
    }
}

/// Events published by the trading control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrategyEvent {
    /// Free-form operational note.
    Log { message: String },

    /// Cycle state transition.
    StateChange { from: CycleState, to: CycleState },

    /// Leg 1 filled.
    Leg1Executed { market_id: String, leg: Leg },

    /// Leg 2 filled.
    Leg2Executed { market_id: String, leg: Leg },

    /// Cycle finished, with final accounting.
    CycleComplete(CycleReport),

    /// Leg 1 was liquidated before expiry.
    EmergencyExit {
        market_id: String,
        side: OutcomeSide,
        qty: Decimal,
        exit_value: Decimal,
        profit: Decimal,
    },

    /// A new round became current.
    NewRound { round_id: String },

    /// Fresh top-of-book for the current market.
    PriceUpdate(PriceSnapshot),

    /// Simulated fill applied (paper mode).
    Trade(TradeFill),

    /// Paper positions settled for a resolved market.
    Settled {
        market_id: String,
        winning_side: OutcomeSide,
        payout: Decimal,
    },

    /// Something went wrong but the loop continues.
    Error { message: String },
}

/// Broadcast fan-out for strategy events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StrategyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// dropped.
    pub fn publish(&self, event: StrategyEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<StrategyEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
