//! Contract surface of the external dip detector.
//!
//! The detector watches order book asks and emits leg-1/leg-2 candidates;
//! this module defines the events it emits and the narrow control
//! interface it must expose. The controller and aggregator never reach
//! past `SignalControl` into detector internals: phase changes, book
//! injection, and cached-book reads all go through it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use dip_common::{BookLevel, Market, OutcomeSide};
use dip_exchange::BookSnapshot;

/// Which leg a signal proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Leg1,
    Leg2,
}

/// What pattern the detector classified.
///
/// Only `Dip` is tradeable: the drop-percent semantics of the other
/// classifications are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalOrigin {
    Dip,
    Surge,
    Mispricing,
}

impl std::fmt::Display for SignalOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalOrigin::Dip => "dip",
            SignalOrigin::Surge => "surge",
            SignalOrigin::Mispricing => "mispricing",
        };
        write!(f, "{}", s)
    }
}

/// An entry or hedge candidate from the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DipSignal {
    pub kind: SignalKind,
    pub origin: SignalOrigin,
    /// Side whose ask dipped.
    pub dip_side: OutcomeSide,
    /// Current best ask on the dip side.
    pub current_price: Decimal,
    /// Best ask on the opposite side.
    pub opposite_ask: Decimal,
    /// Magnitude of the drop that triggered the signal.
    pub drop_percent: Decimal,
    /// Token the signal proposes to buy.
    pub token_id: String,
    /// Detector's suggested limit price, if any.
    pub target_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub seconds_remaining: Option<i64>,
}

/// Fill notification sent by the detector, parallel to explicit polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub leg: SignalKind,
    pub success: bool,
    pub side: OutcomeSide,
    pub price: Decimal,
    pub shares: Decimal,
    pub token_id: String,
    pub order_id: Option<String>,
}

/// Round outcome as reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Completed,
    Abandoned,
}

/// Events emitted by the signal source.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// A new market is now current. Every rotation fires this.
    MarketStarted(Market),

    /// Optional sub-event during a market with a more specific round ID.
    NewRound {
        round_id: String,
        end_time: DateTime<Utc>,
        up_open: Option<Decimal>,
        down_open: Option<Decimal>,
    },

    /// Entry or hedge candidate.
    Signal(DipSignal),

    /// Fill notification.
    Execution(ExecutionReport),

    /// The round finished from the detector's perspective.
    RoundComplete {
        status: RoundStatus,
        profit: Option<Decimal>,
    },

    /// Detector-side error.
    Error(String),
}

/// Controller phase, mirrored into the detector so it knows which leg
/// signals to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Watching,
    Leg1Filled,
}

/// Detector tuning pushed down from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTuning {
    pub dip_threshold: Decimal,
    pub sum_target: Decimal,
    pub window_minutes: u32,
    pub dump_window_ms: u64,
}

/// Cached best bid/ask for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopOfBook {
    pub bid: Option<BookLevel>,
    pub ask: Option<BookLevel>,
    pub updated_at: DateTime<Utc>,
}

impl TopOfBook {
    pub fn from_snapshot(snap: &BookSnapshot) -> Self {
        Self {
            bid: snap.bids.first().copied(),
            ask: snap.asks.first().copied(),
            updated_at: snap.timestamp,
        }
    }
}

/// The narrow interface the signal source must expose to the core.
pub trait SignalControl: Send + Sync {
    /// Tell the detector which leg signals to emit.
    fn set_phase(&self, phase: Phase);

    /// Push a REST book snapshot into the detector's cache so dip
    /// detection continues through feed stalls.
    fn inject_orderbook(&self, token_id: &str, book: BookSnapshot);

    /// Read the cached top-of-book for one side of the current market.
    fn top_of_book(&self, side: OutcomeSide) -> Option<TopOfBook>;

    /// Push configuration down to the detector.
    fn apply_tuning(&self, tuning: SignalTuning);
}

struct EndpointInner {
    phase: RwLock<Phase>,
    tuning: RwLock<Option<SignalTuning>>,
    books: RwLock<HashMap<String, TopOfBook>>,
    tokens: RwLock<Option<(String, String)>>,
    events: mpsc::Sender<SignalEvent>,
}

/// Core-side endpoint of the signal contract.
///
/// Implements `SignalControl` over shared caches that the detector's
/// `SignalHandle` feeds.
#[derive(Clone)]
pub struct SignalEndpoint {
    inner: Arc<EndpointInner>,
}

/// Detector-side handle: pushes events and cached books to the core.
#[derive(Clone)]
pub struct SignalHandle {
    inner: Arc<EndpointInner>,
}

/// Build a connected endpoint/handle pair plus the event stream the
/// controller consumes.
pub fn signal_endpoint(
    event_capacity: usize,
) -> (SignalEndpoint, SignalHandle, mpsc::Receiver<SignalEvent>) {
    let (tx, rx) = mpsc::channel(event_capacity);
    let inner = Arc::new(EndpointInner {
        phase: RwLock::new(Phase::Watching),
        tuning: RwLock::new(None),
        books: RwLock::new(HashMap::new()),
        tokens: RwLock::new(None),
        events: tx,
    });
    (
        SignalEndpoint { inner: inner.clone() },
        SignalHandle { inner },
        rx,
    )
}

impl SignalControl for SignalEndpoint {
    fn set_phase(&self, phase: Phase) {
        *self.inner.phase.write().unwrap() = phase;
    }

    fn inject_orderbook(&self, token_id: &str, book: BookSnapshot) {
        let top = TopOfBook::from_snapshot(&book);
        self.inner
            .books
            .write()
            .unwrap()
            .insert(token_id.to_string(), top);
    }

    fn top_of_book(&self, side: OutcomeSide) -> Option<TopOfBook> {
        let tokens = self.inner.tokens.read().unwrap();
        let (up, down) = tokens.as_ref()?;
        let token_id = match side {
            OutcomeSide::Up => up,
            OutcomeSide::Down => down,
        };
        self.inner.books.read().unwrap().get(token_id).cloned()
    }

    fn apply_tuning(&self, tuning: SignalTuning) {
        *self.inner.tuning.write().unwrap() = Some(tuning);
    }
}

impl SignalHandle {
    /// Push an event to the core. `MarketStarted` also rebinds the token
    /// pair the cached books are keyed under.
    pub async fn push(&self, event: SignalEvent) {
        if let SignalEvent::MarketStarted(market) = &event {
            *self.inner.tokens.write().unwrap() =
                Some((market.up_token_id.clone(), market.down_token_id.clone()));
        }
        if self.inner.events.send(event).await.is_err() {
            warn!("Signal event dropped: controller stream closed");
        }
    }

    /// Update the cached top-of-book for a token.
    pub fn update_book(&self, token_id: &str, top: TopOfBook) {
        self.inner
            .books
            .write()
            .unwrap()
            .insert(token_id.to_string(), top);
    }

    /// Phase the controller last requested.
    pub fn phase(&self) -> Phase {
        *self.inner.phase.read().unwrap()
    }

    /// Tuning the controller last pushed, if any.
    pub fn tuning(&self) -> Option<SignalTuning> {
        self.inner.tuning.read().unwrap().clone()
    }
}
