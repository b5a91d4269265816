//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use dip_common::{Market, MarketDuration, OutcomeSide, Side};
use dip_exchange::{
    BookSnapshot, ExchangeClient, ExchangeError, LimitAck, MarketAck, OrderState, OrderStatus,
    SettleOutcome, SettleStrategy,
};

use dip_bot::config::TradingMode;
use dip_bot::events::EventBus;
use dip_bot::journal::TradeJournal;
use dip_bot::paper::{PaperSim, PaperSimConfig};
use dip_bot::signal::{signal_endpoint, DipSignal, SignalEndpoint, SignalKind, SignalOrigin};
use dip_bot::sizer::{PositionSizer, SizerConfig};
use dip_bot::strategy::controller::{ArbController, ControllerConfig};

pub const UP_TOKEN: &str = "tok-up";
pub const DOWN_TOKEN: &str = "tok-down";

/// A recorded limit order submission.
#[derive(Debug, Clone)]
pub struct PlacedLimit {
    pub order_id: String,
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// A recorded market order submission.
#[derive(Debug, Clone)]
pub struct PlacedMarket {
    pub order_id: Option<String>,
    pub token_id: String,
    pub side: Side,
    pub notional: Decimal,
}

#[derive(Default)]
struct MockInner {
    limit_acks: VecDeque<LimitAck>,
    market_acks: VecDeque<MarketAck>,
    order_states: HashMap<String, VecDeque<OrderState>>,
    limit_orders: Vec<PlacedLimit>,
    market_orders: Vec<PlacedMarket>,
    cancelled: Vec<String>,
    settle_calls: u32,
    balance: Decimal,
    next_order_id: u64,
}

/// Scripted exchange double.
///
/// Default behavior: every order is accepted with a deterministic
/// `mock-N` ID and polls as `open` with no fill. Tests override per-order
/// status sequences and per-call acks.
pub struct MockExchange {
    inner: Mutex<MockInner>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                balance: dec!(1000),
                next_order_id: 1,
                ..MockInner::default()
            }),
        }
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.inner.lock().unwrap().balance = balance;
    }

    /// Queue an ack for the next limit order (overrides auto-acks).
    pub fn push_limit_ack(&self, ack: LimitAck) {
        self.inner.lock().unwrap().limit_acks.push_back(ack);
    }

    /// Queue an ack for the next market order (overrides auto-acks).
    pub fn push_market_ack(&self, ack: MarketAck) {
        self.inner.lock().unwrap().market_acks.push_back(ack);
    }

    /// Script the status sequence returned by `get_order` for an order.
    /// The last state repeats once the sequence is exhausted.
    pub fn script_order(&self, order_id: &str, states: Vec<OrderState>) {
        self.inner
            .lock()
            .unwrap()
            .order_states
            .insert(order_id.to_string(), states.into());
    }

    pub fn limit_orders(&self) -> Vec<PlacedLimit> {
        self.inner.lock().unwrap().limit_orders.clone()
    }

    pub fn market_orders(&self) -> Vec<PlacedMarket> {
        self.inner.lock().unwrap().market_orders.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    pub fn settle_calls(&self) -> u32 {
        self.inner.lock().unwrap().settle_calls
    }

    fn next_id(inner: &mut MockInner) -> String {
        let id = format!("mock-{}", inner.next_order_id);
        inner.next_order_id += 1;
        id
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<LimitAck, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        let ack = match inner.limit_acks.pop_front() {
            Some(ack) => ack,
            None => LimitAck {
                order_id: Some(Self::next_id(&mut inner)),
            },
        };
        inner.limit_orders.push(PlacedLimit {
            order_id: ack.order_id.clone().unwrap_or_default(),
            token_id: token_id.to_string(),
            side,
            price,
            size,
        });
        Ok(ack)
    }

    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        notional: Decimal,
    ) -> Result<MarketAck, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        let ack = match inner.market_acks.pop_front() {
            Some(ack) => ack,
            None => MarketAck::ok(Self::next_id(&mut inner)),
        };
        inner.market_orders.push(PlacedMarket {
            order_id: ack.order_id.clone(),
            token_id: token_id.to_string(),
            side,
            notional,
        });
        Ok(ack)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.order_states.get_mut(order_id) {
            Some(states) if states.len() > 1 => Ok(states.pop_front().unwrap()),
            Some(states) => Ok(states
                .front()
                .cloned()
                .unwrap_or(OrderState::new(OrderStatus::NotFound, Decimal::ZERO))),
            None => Ok(OrderState::new(OrderStatus::Open, Decimal::ZERO)),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.inner.lock().unwrap().cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn get_orderbook(&self, _token_id: &str) -> Result<BookSnapshot, ExchangeError> {
        Ok(BookSnapshot::new(vec![], vec![]))
    }

    async fn settle_market(
        &self,
        _strategy: SettleStrategy,
    ) -> Result<SettleOutcome, ExchangeError> {
        self.inner.lock().unwrap().settle_calls += 1;
        Ok(SettleOutcome {
            success: false,
            amount_received: None,
        })
    }

    async fn collateral_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().unwrap().balance)
    }
}

/// A 15-minute market ending `secs_remaining` from now.
pub fn market(id: &str, secs_remaining: i64) -> Market {
    Market::new(
        id,
        MarketDuration::FifteenMin,
        UP_TOKEN,
        DOWN_TOKEN,
        Utc::now() + chrono::Duration::seconds(secs_remaining),
    )
}

/// A leg-1 dip signal.
pub fn leg1_dip(
    token_id: &str,
    dip_side: OutcomeSide,
    price: Decimal,
    opposite_ask: Decimal,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
) -> DipSignal {
    DipSignal {
        kind: SignalKind::Leg1,
        origin: SignalOrigin::Dip,
        dip_side,
        current_price: price,
        opposite_ask,
        drop_percent: dec!(0.20),
        token_id: token_id.to_string(),
        target_price: None,
        best_bid,
        best_ask,
        seconds_remaining: None,
    }
}

/// A leg-2 hedge signal.
pub fn leg2_hedge(
    token_id: &str,
    hedge_side: OutcomeSide,
    price: Decimal,
    opposite_ask: Decimal,
    best_ask: Option<Decimal>,
) -> DipSignal {
    DipSignal {
        kind: SignalKind::Leg2,
        origin: SignalOrigin::Dip,
        dip_side: hedge_side,
        current_price: price,
        opposite_ask,
        drop_percent: Decimal::ZERO,
        token_id: token_id.to_string(),
        target_price: None,
        best_bid: None,
        best_ask,
        seconds_remaining: None,
    }
}

/// Default sizer: 5% of balance, 5..=100 shares, 3-loss breaker.
pub fn sizer() -> PositionSizer {
    PositionSizer::new(SizerConfig::default())
}

/// Paper simulator with fees and slippage on, journal disabled.
pub fn paper_sim(bus: &EventBus) -> PaperSim {
    PaperSim::new(
        PaperSimConfig::default(),
        TradeJournal::disabled(),
        bus.clone(),
    )
}

/// Paper-mode controller wired to a no-op exchange.
pub fn paper_controller(cfg: ControllerConfig) -> (ArbController, EventBus, SignalEndpoint) {
    let bus = EventBus::default();
    let (endpoint, _handle, _events) = signal_endpoint(16);
    let controller = ArbController::new(
        cfg,
        TradingMode::Paper,
        Arc::new(dip_exchange::NoopExchange::disconnected()),
        Arc::new(endpoint.clone()),
        Some(paper_sim(&bus)),
        sizer(),
        bus.clone(),
    );
    (controller, bus, endpoint)
}

/// Collect everything currently buffered on an event subscription.
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<dip_bot::events::StrategyEvent>,
) -> Vec<dip_bot::events::StrategyEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Live-mode controller wired to the scripted mock.
pub fn live_controller(
    cfg: ControllerConfig,
    exchange: Arc<MockExchange>,
) -> (ArbController, EventBus, SignalEndpoint) {
    let bus = EventBus::default();
    let (endpoint, _handle, _events) = signal_endpoint(16);
    let controller = ArbController::new(
        cfg,
        TradingMode::Live,
        exchange,
        Arc::new(endpoint.clone()),
        None,
        sizer(),
        bus.clone(),
    );
    (controller, bus, endpoint)
}
