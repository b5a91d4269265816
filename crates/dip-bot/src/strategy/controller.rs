//! The arbitrage controller state machine.
//!
//! Owns the current cycle, pending orders, price history, and stats.
//! Consumes the detector's signal stream and the aggregator's price
//! snapshots, decides whether and how to enter the two legs, polls
//! order fills with timeout handling, places protective exit sells,
//! liquidates an unhedged leg 1 before expiry, and cleans up across
//! market rotations.
//!
//! All state lives in one task: the run loop multiplexes the signal
//! channel, price channel, fill-poll tick, and emergency tick through
//! `select!`, so no transition races another. Suspension only happens
//! at exchange calls, with every mutation completed before or after the
//! call.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dip_common::{Market, OutcomeSide, Side};
use dip_exchange::{ExchangeClient, OrderStatus, SettleStrategy};

use crate::config::{BotConfig, TradingMode};
use crate::events::{EventBus, PriceSnapshot, StrategyEvent};
use crate::fees::{decide_leg1_order_kind, decide_leg2_order_kind, OrderKind};
use crate::paper::PaperSim;
use crate::signal::{
    DipSignal, ExecutionReport, Phase, RoundStatus, SignalControl, SignalEvent, SignalKind,
    SignalOrigin, SignalTuning,
};
use crate::sizer::PositionSizer;
use crate::strategy::{
    Cycle, CycleReport, CycleState, CycleStatus, Leg, OrderIntent, PendingOrder, StrategyError,
    StrategyStats,
};

/// Protective exit sells rest one tick under the $1.00 payout.
const EXIT_SELL_PRICE: Decimal = dec!(0.99);

/// Rolling ask history window used for emergency-exit valuation.
const PRICE_HISTORY_WINDOW_SECS: i64 = 300;

/// Emergency timer cadence.
const EMERGENCY_TICK: Duration = Duration::from_secs(1);

/// Attempts to find a current market at startup.
const STARTUP_ATTEMPTS: u32 = 3;

/// Wait per startup attempt.
const STARTUP_WAIT: Duration = Duration::from_secs(30);

/// Controller tunables, extracted from the bot configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum accepted leg1 + leg2 price sum.
    pub sum_target: Decimal,
    /// Prefer maker limits for leg 1.
    pub use_maker_orders: bool,
    /// Taker fallback when the margin covers the fee.
    pub maker_fallback_to_taker: bool,
    /// Taker fee coefficient.
    pub taker_fee_rate: Decimal,
    /// Maximum tolerated spread as a fraction of the ask.
    pub max_spread_pct: Decimal,
    /// Resting-order fill timeout (ms).
    pub fill_timeout_ms: u64,
    /// Order-status poll interval (ms).
    pub poll_interval_ms: u64,
    /// Whether the emergency exit is armed.
    pub emergency_enabled: bool,
    /// Liquidate this many minutes before expiry when unhedged.
    pub exit_before_expiry_minutes: u64,
    /// Cycles allowed per market.
    pub max_cycles: u32,
    /// Detector tuning pushed at startup.
    pub dip_threshold: Decimal,
    /// Detector lookback window (minutes).
    pub window_minutes: u32,
    /// Detector dump window (ms).
    pub dump_window_ms: u64,
}

impl ControllerConfig {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            sum_target: config.trading.default_sum_target,
            use_maker_orders: config.trading.use_maker_orders,
            maker_fallback_to_taker: config.trading.maker_fallback_to_taker,
            taker_fee_rate: config.trading.taker_fee_rate,
            max_spread_pct: config.trading.max_spread_pct,
            fill_timeout_ms: config.trading.gtc_fill_timeout_ms,
            poll_interval_ms: config.trading.gtc_poll_interval_ms,
            emergency_enabled: config.risk.emergency_enabled,
            exit_before_expiry_minutes: config.risk.exit_before_expiry_minutes,
            max_cycles: config.trading.max_cycles,
            dip_threshold: config.trading.default_dip_threshold,
            window_minutes: config.trading.window_minutes,
            dump_window_ms: config.trading.dump_window_ms,
        }
    }

    fn exit_cutoff_secs(&self) -> i64 {
        (self.exit_before_expiry_minutes * 60) as i64
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

/// The per-market arbitrage state machine.
pub struct ArbController {
    cfg: ControllerConfig,
    mode: TradingMode,
    exchange: Arc<dyn ExchangeClient>,
    signal: Arc<dyn SignalControl>,
    sim: Option<PaperSim>,
    sizer: PositionSizer,
    bus: EventBus,
    stats: StrategyStats,

    market: Option<Market>,
    round_id: Option<String>,
    cycle: Option<Cycle>,
    /// Entries admitted on the current market; bars re-entry at max_cycles.
    entries_this_market: u32,
    /// Set when a cycle finalized on this market, so detector-reported
    /// round completions do not double-count stats.
    finalized_this_market: bool,

    /// Order IDs we are willing to accept fill callbacks for. The first
    /// terminal response for an ID wins; later ones are discarded here.
    expected_order_ids: HashSet<String>,
    pending_leg1: Option<PendingOrder>,
    pending_leg2: Option<PendingOrder>,
    leg1_exit_order_id: Option<String>,
    leg2_exit_order_id: Option<String>,

    up_asks: VecDeque<(Decimal, DateTime<Utc>)>,
    down_asks: VecDeque<(Decimal, DateTime<Utc>)>,

    market_tx: Option<watch::Sender<Option<Market>>>,
}

impl ArbController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ControllerConfig,
        mode: TradingMode,
        exchange: Arc<dyn ExchangeClient>,
        signal: Arc<dyn SignalControl>,
        sim: Option<PaperSim>,
        sizer: PositionSizer,
        bus: EventBus,
    ) -> Self {
        Self {
            cfg,
            mode,
            exchange,
            signal,
            sim,
            sizer,
            bus,
            stats: StrategyStats::default(),
            market: None,
            round_id: None,
            cycle: None,
            entries_this_market: 0,
            finalized_this_market: false,
            expected_order_ids: HashSet::new(),
            pending_leg1: None,
            pending_leg2: None,
            leg1_exit_order_id: None,
            leg2_exit_order_id: None,
            up_asks: VecDeque::new(),
            down_asks: VecDeque::new(),
            market_tx: None,
        }
    }

    /// Publish market rotations to a watch channel (consumed by the
    /// price aggregator).
    pub fn with_market_watch(mut self, tx: watch::Sender<Option<Market>>) -> Self {
        self.market_tx = Some(tx);
        self
    }

    /// Current cycle state (`Watching` when no cycle is in flight).
    pub fn state(&self) -> CycleState {
        self.cycle.as_ref().map(|c| c.state).unwrap_or(CycleState::Watching)
    }

    pub fn stats(&self) -> &StrategyStats {
        &self.stats
    }

    pub fn market(&self) -> Option<&Market> {
        self.market.as_ref()
    }

    /// Display identifier of the current round.
    pub fn round_id(&self) -> Option<&str> {
        self.round_id.as_deref()
    }

    pub fn sizer_mut(&mut self) -> &mut PositionSizer {
        &mut self.sizer
    }

    pub fn paper_sim(&self) -> Option<&PaperSim> {
        self.sim.as_ref()
    }

    /// Drive the controller until the signal stream closes or shutdown
    /// fires. Returns the final statistics.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SignalEvent>,
        mut prices: mpsc::Receiver<PriceSnapshot>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<StrategyStats, StrategyError> {
        if self.market.is_none() {
            self.wait_for_market(&mut events).await?;
        }

        self.signal.apply_tuning(SignalTuning {
            dip_threshold: self.cfg.dip_threshold,
            sum_target: self.cfg.sum_target,
            window_minutes: self.cfg.window_minutes,
            dump_window_ms: self.cfg.dump_window_ms,
        });

        let mut poll_tick = tokio::time::interval(Duration::from_millis(self.cfg.poll_interval_ms));
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut emergency_tick = tokio::time::interval(EMERGENCY_TICK);
        emergency_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Signal stream closed, stopping");
                        break;
                    }
                },
                maybe_snap = prices.recv() => {
                    if let Some(snap) = maybe_snap {
                        self.record_price_snapshot(snap);
                    }
                }
                _ = poll_tick.tick() => self.poll_pending_orders().await,
                _ = emergency_tick.tick() => self.check_emergency().await,
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        info!(
            cycles_completed = self.stats.cycles_completed,
            cycles_abandoned = self.stats.cycles_abandoned,
            cycles_won = self.stats.cycles_won,
            emergency_exits = self.stats.emergency_exits,
            total_profit = %self.stats.total_profit,
            win_rate = %self.stats.win_rate(),
            "Controller stopped"
        );
        Ok(self.stats)
    }

    /// Wait for the first `market_started`, three attempts 30 s apart.
    async fn wait_for_market(
        &mut self,
        events: &mut mpsc::Receiver<SignalEvent>,
    ) -> Result<(), StrategyError> {
        for attempt in 1..=STARTUP_ATTEMPTS {
            let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Ok(Some(event)) => {
                        self.handle_event(event).await;
                        if self.market.is_some() {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Err(StrategyError::SignalStreamClosed),
                    Err(_) => break,
                }
            }
            warn!(attempt, "No active market yet");
        }
        self.bus.publish(StrategyEvent::Error {
            message: "no active market found at startup".to_string(),
        });
        Err(StrategyError::NoMarket(STARTUP_ATTEMPTS))
    }

    /// Process one signal-source event.
    pub async fn handle_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::MarketStarted(market) => self.handle_market_started(market).await,
            SignalEvent::NewRound { round_id, end_time, .. } => {
                self.handle_new_round(round_id, end_time)
            }
            SignalEvent::Signal(sig) => match sig.kind {
                SignalKind::Leg1 => self.try_enter_leg1(sig).await,
                SignalKind::Leg2 => self.try_enter_leg2(sig).await,
            },
            SignalEvent::Execution(report) => self.handle_execution_report(report).await,
            SignalEvent::RoundComplete { status, profit } => {
                self.handle_round_complete(status, profit).await
            }
            SignalEvent::Error(message) => {
                warn!(%message, "Signal source error");
                self.bus.publish(StrategyEvent::Error { message });
            }
        }
    }

    // ========================================================================
    // Leg 1
    // ========================================================================

    async fn try_enter_leg1(&mut self, sig: DipSignal) {
        if self.state() != CycleState::Watching {
            debug!(state = %self.state(), "Leg1 signal ignored: cycle in flight");
            return;
        }
        let Some(market) = self.market.clone() else {
            debug!("Leg1 signal ignored: no current market");
            return;
        };
        if self.entries_this_market >= self.cfg.max_cycles {
            debug!(
                entries = self.entries_this_market,
                "Leg1 signal ignored: market already attempted"
            );
            return;
        }
        let remaining = market.seconds_remaining();
        if remaining <= self.cfg.exit_cutoff_secs() {
            debug!(remaining, "Leg1 signal ignored: too close to expiry");
            return;
        }
        if sig.origin != SignalOrigin::Dip {
            debug!(origin = %sig.origin, "Leg1 signal ignored: only dips are tradeable");
            return;
        }
        if self.sizer.is_trading_paused() {
            debug!("Leg1 signal ignored: sizer cooldown active");
            return;
        }
        let Some(balance) = self.trading_balance().await else {
            return;
        };
        let qty = self.sizer.calculate_shares(balance, sig.current_price);
        if qty <= Decimal::ZERO {
            debug!(%balance, price = %sig.current_price, "Leg1 signal ignored: sized to zero");
            return;
        }
        if !self.validate_leg1_signal(&market, &sig) {
            return;
        }

        // Admission passed: this consumes the market's entry budget even
        // if placement fails, so a failed order is not retried within the
        // same market.
        self.entries_this_market += 1;

        let kind = decide_leg1_order_kind(
            sig.current_price,
            sig.opposite_ask,
            self.cfg.sum_target,
            self.cfg.use_maker_orders,
            self.cfg.maker_fallback_to_taker,
            self.cfg.taker_fee_rate,
        );
        info!(
            market_id = %market.market_id,
            side = %sig.dip_side,
            price = %sig.current_price,
            opposite_ask = %sig.opposite_ask,
            drop_percent = %sig.drop_percent,
            %qty,
            kind = %kind,
            "Leg1 admitted"
        );

        match self.mode {
            TradingMode::Paper => self.execute_leg1_paper(market, sig, qty, kind),
            TradingMode::Live => match kind {
                OrderKind::TakerMarket => self.execute_leg1_taker(market, sig, qty).await,
                OrderKind::MakerLimit => self.execute_leg1_maker(market, sig, qty).await,
            },
        }
    }

    fn validate_leg1_signal(&self, market: &Market, sig: &DipSignal) -> bool {
        if !price_in_range(sig.current_price) || !price_in_range(sig.opposite_ask) {
            warn!(
                price = %sig.current_price,
                opposite_ask = %sig.opposite_ask,
                "Leg1 rejected: price out of range"
            );
            return false;
        }
        match market.side_for_token(&sig.token_id) {
            Some(side) if side == sig.dip_side => {}
            _ => {
                warn!(
                    token_id = %sig.token_id,
                    market_id = %market.market_id,
                    "Leg1 rejected: token does not match current market"
                );
                return false;
            }
        }
        if let (Some(bid), Some(ask)) = (sig.best_bid, sig.best_ask) {
            if ask > Decimal::ZERO && (ask - bid) / ask > self.cfg.max_spread_pct {
                warn!(%bid, %ask, "Leg1 rejected: spread too wide");
                return false;
            }
        }
        true
    }

    fn execute_leg1_paper(&mut self, market: Market, sig: DipSignal, qty: Decimal, kind: OrderKind) {
        let leg = Leg {
            side: sig.dip_side,
            price: sig.current_price,
            qty,
            token_id: sig.token_id,
            order_kind: kind,
            best_bid: sig.best_bid,
            best_ask: sig.best_ask,
            order_id: None,
            filled_at: Utc::now(),
        };

        let Some(sim) = self.sim.as_mut() else {
            warn!("Paper mode without a simulator; leg1 dropped");
            return;
        };
        if !sim.buy(&leg, &market.market_id) {
            return;
        }

        let market_id = market.market_id.clone();
        let mut cycle = Cycle::new(market);
        cycle.leg1 = Some(leg.clone());
        cycle.state = CycleState::WaitingForHedge;
        self.cycle = Some(cycle);
        self.emit_state_change(CycleState::Watching, CycleState::WaitingForHedge);
        self.signal.set_phase(Phase::Leg1Filled);
        self.bus.publish(StrategyEvent::Leg1Executed { market_id, leg });
        info!(price = %EXIT_SELL_PRICE, "Paper exit sell recorded for leg1");
    }

    async fn execute_leg1_taker(&mut self, market: Market, sig: DipSignal, qty: Decimal) {
        let notional = qty * sig.current_price;
        let ack = match self
            .exchange
            .create_market_order(&sig.token_id, Side::Buy, notional)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "Leg1 market order failed; staying in watching");
                return;
            }
        };
        if !ack.success {
            warn!(error = ?ack.error, "Leg1 market order not accepted; staying in watching");
            return;
        }

        // Record the fill at the observed ask rather than the signal's
        // dip price; a market order pays the touch.
        let fill_price = sig.best_ask.unwrap_or(sig.current_price);
        let leg = Leg {
            side: sig.dip_side,
            price: fill_price,
            qty,
            token_id: sig.token_id,
            order_kind: OrderKind::TakerMarket,
            best_bid: sig.best_bid,
            best_ask: sig.best_ask,
            order_id: ack.order_id,
            filled_at: Utc::now(),
        };

        let market_id = market.market_id.clone();
        let mut cycle = Cycle::new(market);
        cycle.leg1 = Some(leg.clone());
        cycle.state = CycleState::WaitingForHedge;
        self.cycle = Some(cycle);
        self.emit_state_change(CycleState::Watching, CycleState::WaitingForHedge);
        self.signal.set_phase(Phase::Leg1Filled);
        self.bus.publish(StrategyEvent::Leg1Executed {
            market_id,
            leg: leg.clone(),
        });
        self.place_exit_sell(OrderIntent::Leg1ExitSell, &leg).await;
    }

    async fn execute_leg1_maker(&mut self, market: Market, sig: DipSignal, qty: Decimal) {
        let limit_price = sig.best_ask.unwrap_or(sig.current_price);
        let ack = match self
            .exchange
            .create_limit_order(&sig.token_id, Side::Buy, limit_price, qty)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "Leg1 limit order failed; staying in watching");
                return;
            }
        };
        let Some(order_id) = ack.order_id else {
            warn!("Leg1 limit order returned no order id; staying in watching");
            return;
        };

        let mut cycle = Cycle::new(market);
        cycle.state = CycleState::Leg1Pending;
        self.cycle = Some(cycle);
        self.expected_order_ids.insert(order_id.clone());
        self.pending_leg1 = Some(PendingOrder {
            order_id: order_id.clone(),
            intent: OrderIntent::Leg1Buy,
            limit_price,
            target_qty: qty,
            side: sig.dip_side,
            token_id: sig.token_id,
            best_bid: sig.best_bid,
            best_ask: sig.best_ask,
            started_at: Utc::now(),
        });
        self.emit_state_change(CycleState::Watching, CycleState::Leg1Pending);
        info!(%order_id, price = %limit_price, %qty, "Leg1 limit order resting");
    }

    // ========================================================================
    // Leg 2
    // ========================================================================

    async fn try_enter_leg2(&mut self, sig: DipSignal) {
        if self.state() != CycleState::WaitingForHedge {
            debug!(state = %self.state(), "Leg2 signal ignored: not waiting for hedge");
            return;
        }
        let Some(cycle) = self.cycle.as_ref() else { return };
        let Some(leg1) = cycle.leg1.clone() else {
            warn!("Waiting for hedge without leg1; resetting");
            self.reset_cycle();
            self.emit_state_change(CycleState::WaitingForHedge, CycleState::Watching);
            return;
        };
        let market = cycle.market.clone();

        if leg1.price + sig.current_price > self.cfg.sum_target {
            debug!(
                leg1_price = %leg1.price,
                leg2_price = %sig.current_price,
                sum_target = %self.cfg.sum_target,
                "Leg2 signal rejected: sum above target"
            );
            return;
        }
        if !price_in_range(sig.current_price) {
            warn!(price = %sig.current_price, "Leg2 rejected: price out of range");
            return;
        }
        match market.side_for_token(&sig.token_id) {
            Some(side) if side == leg1.side.opposite() => {}
            _ => {
                warn!(
                    token_id = %sig.token_id,
                    "Leg2 rejected: token is not the hedge side of the current market"
                );
                return;
            }
        }

        let qty = leg1.qty;
        let kind = decide_leg2_order_kind();
        info!(
            market_id = %market.market_id,
            side = %leg1.side.opposite(),
            price = %sig.current_price,
            sum = %(leg1.price + sig.current_price),
            %qty,
            "Leg2 admitted"
        );

        match self.mode {
            TradingMode::Paper => {
                let leg = Leg {
                    side: leg1.side.opposite(),
                    price: sig.current_price,
                    qty,
                    token_id: sig.token_id,
                    order_kind: kind,
                    best_bid: sig.best_bid,
                    best_ask: sig.best_ask,
                    order_id: None,
                    filled_at: Utc::now(),
                };
                let Some(sim) = self.sim.as_mut() else { return };
                if !sim.buy(&leg, &market.market_id) {
                    return;
                }
                self.bus.publish(StrategyEvent::Leg2Executed {
                    market_id: market.market_id.clone(),
                    leg: leg.clone(),
                });
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.leg2 = Some(leg);
                }
                self.finalize_cycle().await;
            }
            TradingMode::Live => {
                let limit_price = sig.best_ask.unwrap_or(sig.current_price);
                let ack = match self
                    .exchange
                    .create_limit_order(&sig.token_id, Side::Buy, limit_price, qty)
                    .await
                {
                    Ok(ack) => ack,
                    Err(e) => {
                        // Keep waiting: another hedge signal may arrive and
                        // the emergency timer is the backstop.
                        warn!(error = %e, "Leg2 limit order failed; still waiting for hedge");
                        return;
                    }
                };
                let Some(order_id) = ack.order_id else {
                    warn!("Leg2 limit order returned no order id; still waiting for hedge");
                    return;
                };

                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.state = CycleState::Leg2Pending;
                }
                self.expected_order_ids.insert(order_id.clone());
                self.pending_leg2 = Some(PendingOrder {
                    order_id: order_id.clone(),
                    intent: OrderIntent::Leg2Buy,
                    limit_price,
                    target_qty: qty,
                    side: leg1.side.opposite(),
                    token_id: sig.token_id,
                    best_bid: sig.best_bid,
                    best_ask: sig.best_ask,
                    started_at: Utc::now(),
                });
                // The emergency timer keeps running through Leg2Pending;
                // only a confirmed fill clears it.
                self.emit_state_change(CycleState::WaitingForHedge, CycleState::Leg2Pending);
                info!(%order_id, price = %limit_price, %qty, "Leg2 limit order resting");
            }
        }
    }

    // ========================================================================
    // Fill polling
    // ========================================================================

    /// Poll pending buy orders. One poll per tick; overlapping ticks are
    /// skipped by the interval policy.
    pub async fn poll_pending_orders(&mut self) {
        self.poll_pending_orders_at(Utc::now()).await;
    }

    /// Poll relative to an explicit clock.
    pub async fn poll_pending_orders_at(&mut self, now: DateTime<Utc>) {
        if let Some(pending) = self.pending_leg1.clone() {
            self.poll_one(pending, now).await;
        }
        if let Some(pending) = self.pending_leg2.clone() {
            self.poll_one(pending, now).await;
        }
    }

    async fn poll_one(&mut self, pending: PendingOrder, now: DateTime<Utc>) {
        let state = match self.exchange.get_order(&pending.order_id).await {
            Ok(state) => state,
            Err(e) => {
                // Transient; the next tick retries.
                debug!(order_id = %pending.order_id, error = %e, "Order poll failed");
                return;
            }
        };

        match state.status {
            OrderStatus::Filled => {
                let qty = if state.filled_size > Decimal::ZERO {
                    state.filled_size
                } else {
                    pending.target_qty
                };
                self.apply_fill(&pending, qty, pending.limit_price).await;
            }
            OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected => {
                if state.filled_size > Decimal::ZERO {
                    self.apply_fill(&pending, state.filled_size, pending.limit_price).await;
                } else {
                    self.terminal_unfilled(&pending).await;
                }
            }
            OrderStatus::NotFound => self.terminal_unfilled(&pending).await,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled => {
                if pending.elapsed_ms(now) > self.cfg.fill_timeout_ms as i64 {
                    info!(
                        order_id = %pending.order_id,
                        intent = %pending.intent,
                        "Fill timeout, cancelling order"
                    );
                    if let Err(e) = self.exchange.cancel_order(&pending.order_id).await {
                        warn!(order_id = %pending.order_id, error = %e, "Cancel failed");
                    }
                    if state.filled_size > Decimal::ZERO {
                        self.apply_fill(&pending, state.filled_size, pending.limit_price).await;
                    } else {
                        self.terminal_unfilled(&pending).await;
                    }
                }
            }
        }
    }

    /// Record a confirmed fill for a pending buy. Stale order IDs (not in
    /// the expected set) are dropped.
    async fn apply_fill(&mut self, pending: &PendingOrder, qty: Decimal, price: Decimal) {
        if !self.expected_order_ids.remove(&pending.order_id) {
            debug!(order_id = %pending.order_id, "Fill for unexpected order discarded");
            return;
        }
        match pending.intent {
            OrderIntent::Leg1Buy => self.pending_leg1 = None,
            OrderIntent::Leg2Buy => self.pending_leg2 = None,
            _ => {}
        }

        let leg = Leg {
            side: pending.side,
            price,
            qty,
            token_id: pending.token_id.clone(),
            order_kind: OrderKind::MakerLimit,
            best_bid: pending.best_bid,
            best_ask: pending.best_ask,
            order_id: Some(pending.order_id.clone()),
            filled_at: Utc::now(),
        };

        match pending.intent {
            OrderIntent::Leg1Buy => self.on_leg1_filled(leg).await,
            OrderIntent::Leg2Buy => self.on_leg2_filled(leg).await,
            other => debug!(intent = %other, "Fill on non-leg order ignored"),
        }
    }

    async fn on_leg1_filled(&mut self, leg: Leg) {
        let Some(cycle) = self.cycle.as_mut() else { return };
        let market_id = cycle.market.market_id.clone();
        let from = cycle.state;
        cycle.leg1 = Some(leg.clone());
        cycle.state = CycleState::WaitingForHedge;
        self.emit_state_change(from, CycleState::WaitingForHedge);
        self.signal.set_phase(Phase::Leg1Filled);
        self.bus.publish(StrategyEvent::Leg1Executed {
            market_id,
            leg: leg.clone(),
        });
        if self.mode == TradingMode::Live {
            self.place_exit_sell(OrderIntent::Leg1ExitSell, &leg).await;
        }
    }

    async fn on_leg2_filled(&mut self, leg: Leg) {
        let Some(cycle) = self.cycle.as_mut() else { return };
        let market_id = cycle.market.market_id.clone();
        cycle.leg2 = Some(leg.clone());
        self.bus.publish(StrategyEvent::Leg2Executed { market_id, leg });
        self.finalize_cycle().await;
    }

    /// Terminal status with nothing filled: leg1 resets the cycle, leg2
    /// leaves an unhedged leg1 behind and forces the emergency exit.
    async fn terminal_unfilled(&mut self, pending: &PendingOrder) {
        self.expected_order_ids.remove(&pending.order_id);
        match pending.intent {
            OrderIntent::Leg1Buy => {
                self.pending_leg1 = None;
                info!(order_id = %pending.order_id, "Leg1 order died unfilled; back to watching");
                let from = self.state();
                self.reset_cycle();
                if from != CycleState::Watching {
                    self.emit_state_change(from, CycleState::Watching);
                }
            }
            OrderIntent::Leg2Buy => {
                self.pending_leg2 = None;
                warn!(order_id = %pending.order_id, "Leg2 order died unfilled; emergency exit");
                self.emergency_exit().await;
            }
            _ => {}
        }
    }

    /// Fill notification from the detector, parallel to polling. The
    /// expected-order-id set makes this race-safe: whichever path sees
    /// the fill first consumes the ID.
    async fn handle_execution_report(&mut self, report: ExecutionReport) {
        if !report.success {
            debug!(leg = ?report.leg, "Unsuccessful execution report ignored");
            return;
        }
        let Some(order_id) = report.order_id.clone() else {
            debug!("Execution report without order id ignored");
            return;
        };

        let pending = match report.leg {
            SignalKind::Leg1 => self.pending_leg1.clone(),
            SignalKind::Leg2 => self.pending_leg2.clone(),
        };
        let Some(pending) = pending.filter(|p| p.order_id == order_id) else {
            debug!(%order_id, "Execution report for unknown order discarded");
            return;
        };

        let qty = if report.shares > Decimal::ZERO {
            report.shares
        } else {
            pending.target_qty
        };
        let price = if price_in_range(report.price) {
            report.price
        } else {
            pending.limit_price
        };
        self.apply_fill(&pending, qty, price).await;
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Finalize the current cycle. Idempotent: the finalized flag makes
    /// repeat calls no-ops even if the polling loop and an execution
    /// event both report the leg-2 fill.
    async fn finalize_cycle(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else { return };
        if cycle.finalized {
            return;
        }
        let (Some(leg1), Some(leg2)) = (cycle.leg1.clone(), cycle.leg2.clone()) else {
            warn!("Finalize without both legs; resetting");
            self.reset_cycle();
            return;
        };
        cycle.finalized = true;
        let market_id = cycle.market.market_id.clone();
        let from = cycle.state;
        cycle.state = CycleState::Completed;

        // Partial-fill safe: only matched pairs are guaranteed $1.00.
        let payout = leg1.qty.min(leg2.qty);
        let total_cost = leg1.cost() + leg2.cost();
        let report = CycleReport::new(market_id, CycleStatus::Completed, payout, total_cost);

        self.emit_state_change(from, CycleState::Completed);
        self.stats.cycles_completed += 1;
        if report.profit > Decimal::ZERO {
            self.stats.cycles_won += 1;
        }
        self.stats.total_profit += report.profit;
        self.finalized_this_market = true;
        self.sizer.record_result(report.profit);

        info!(
            market_id = %report.market_id,
            payout = %report.payout,
            total_cost = %report.total_cost,
            profit = %report.profit,
            profit_pct = %report.profit_pct,
            "Cycle completed"
        );
        self.bus.publish(StrategyEvent::CycleComplete(report.clone()));

        match self.mode {
            TradingMode::Paper => {
                if let Some(sim) = self.sim.as_mut() {
                    sim.record_cycle(report);
                }
                info!(price = %EXIT_SELL_PRICE, "Paper exit sell recorded for leg2");
            }
            TradingMode::Live => {
                self.place_exit_sell(OrderIntent::Leg2ExitSell, &leg2).await;
            }
        }

        self.reset_cycle();
        self.emit_state_change(CycleState::Completed, CycleState::Watching);
    }

    /// Rest a protective sell at $0.99 for a filled leg (live mode).
    async fn place_exit_sell(&mut self, intent: OrderIntent, leg: &Leg) {
        match self
            .exchange
            .create_limit_order(&leg.token_id, Side::Sell, EXIT_SELL_PRICE, leg.qty)
            .await
        {
            Ok(ack) => match ack.order_id {
                Some(order_id) => {
                    info!(%order_id, intent = %intent, "Exit sell resting at 0.99");
                    match intent {
                        OrderIntent::Leg1ExitSell => self.leg1_exit_order_id = Some(order_id),
                        OrderIntent::Leg2ExitSell => self.leg2_exit_order_id = Some(order_id),
                        _ => {}
                    }
                }
                None => warn!(intent = %intent, "Exit sell returned no order id"),
            },
            Err(e) => warn!(intent = %intent, error = %e, "Exit sell failed"),
        }
    }

    // ========================================================================
    // Emergency exit
    // ========================================================================

    /// Emergency timer body: liquidate an unhedged leg1 once the time
    /// cutoff is crossed.
    pub async fn check_emergency(&mut self) {
        self.check_emergency_at(Utc::now()).await;
    }

    /// Emergency check relative to an explicit clock.
    pub async fn check_emergency_at(&mut self, now: DateTime<Utc>) {
        if !self.cfg.emergency_enabled {
            return;
        }
        let Some(cycle) = self.cycle.as_ref() else { return };
        if !cycle.state.holds_unhedged_leg1() || cycle.leg1.is_none() {
            return;
        }
        let remaining = cycle.market.seconds_remaining_at(now);
        if remaining <= self.cfg.exit_cutoff_secs() {
            info!(remaining, "Emergency cutoff crossed");
            self.emergency_exit().await;
        }
    }

    async fn emergency_exit(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else { return };
        if cycle.finalized {
            return;
        }
        let Some(leg1) = cycle.leg1.clone() else {
            self.reset_cycle();
            return;
        };
        cycle.finalized = true;
        let market_id = cycle.market.market_id.clone();
        let from = cycle.state;
        cycle.state = CycleState::EmergencyExit;

        self.emit_state_change(from, CycleState::EmergencyExit);
        self.stats.emergency_exits += 1;

        // Tear down anything still resting before dumping leg1.
        if let Some(pending) = self.pending_leg2.take() {
            self.expected_order_ids.remove(&pending.order_id);
            if self.mode == TradingMode::Live {
                if let Err(e) = self.exchange.cancel_order(&pending.order_id).await {
                    warn!(order_id = %pending.order_id, error = %e, "Leg2 cancel failed");
                }
            }
        }
        if let Some(order_id) = self.leg1_exit_order_id.take() {
            if self.mode == TradingMode::Live {
                if let Err(e) = self.exchange.cancel_order(&order_id).await {
                    warn!(%order_id, error = %e, "Exit sell cancel failed");
                }
            }
        }

        let last_price = self.last_ask(leg1.side);
        let exit_value = match last_price {
            Some(price) => {
                match self.mode {
                    TradingMode::Live => {
                        let notional = leg1.qty * price;
                        match self
                            .exchange
                            .create_market_order(&leg1.token_id, Side::Sell, notional)
                            .await
                        {
                            Ok(ack) if ack.success => {}
                            Ok(ack) => warn!(error = ?ack.error, "Emergency sell not accepted"),
                            Err(e) => warn!(error = %e, "Emergency sell failed"),
                        }
                    }
                    TradingMode::Paper => {
                        if let Some(sim) = self.sim.as_mut() {
                            sim.sell(&leg1.token_id, leg1.side, leg1.qty, price, &market_id);
                        }
                    }
                }
                leg1.qty * price
            }
            None => {
                warn!(side = %leg1.side, "No observed price for emergency exit");
                if self.mode == TradingMode::Paper {
                    if let Some(sim) = self.sim.as_mut() {
                        sim.abandon_round(&market_id);
                    }
                }
                Decimal::ZERO
            }
        };

        let report = CycleReport::new(
            market_id.clone(),
            CycleStatus::EmergencyExit,
            exit_value,
            leg1.cost(),
        );
        self.stats.cycles_abandoned += 1;
        self.stats.total_profit += report.profit;
        self.finalized_this_market = true;
        self.sizer.record_result(report.profit);

        warn!(
            market_id = %market_id,
            side = %leg1.side,
            qty = %leg1.qty,
            entry_cost = %leg1.cost(),
            exit_value = %exit_value,
            profit = %report.profit,
            "Emergency exit"
        );
        self.bus.publish(StrategyEvent::EmergencyExit {
            market_id,
            side: leg1.side,
            qty: leg1.qty,
            exit_value,
            profit: report.profit,
        });
        self.bus.publish(StrategyEvent::CycleComplete(report.clone()));
        if let Some(sim) = self.sim.as_mut() {
            sim.record_cycle(report);
        }

        self.reset_cycle();
        self.emit_state_change(CycleState::EmergencyExit, CycleState::Watching);
    }

    // ========================================================================
    // Rotation and round handling
    // ========================================================================

    async fn handle_market_started(&mut self, market: Market) {
        info!(
            market_id = %market.market_id,
            end_time = %market.end_time,
            duration = %market.duration,
            "Market rotation"
        );

        // Preempt anything still resting on the previous market.
        let stale_orders: Vec<String> = self
            .pending_leg1
            .take()
            .into_iter()
            .chain(self.pending_leg2.take())
            .map(|p| p.order_id)
            .chain(self.leg1_exit_order_id.take())
            .chain(self.leg2_exit_order_id.take())
            .collect();
        if self.mode == TradingMode::Live {
            for order_id in &stale_orders {
                if let Err(e) = self.exchange.cancel_order(order_id).await {
                    warn!(%order_id, error = %e, "Stale order cancel failed");
                }
            }
            match self.exchange.settle_market(SettleStrategy::Redeem).await {
                Ok(outcome) if outcome.success => {
                    info!(amount = ?outcome.amount_received, "Residual positions redeemed");
                }
                Ok(_) => debug!("Nothing to redeem"),
                Err(e) => warn!(error = %e, "Redemption failed"),
            }
        }

        self.expected_order_ids.clear();
        self.up_asks.clear();
        self.down_asks.clear();

        let prev_state = self.state();
        self.cycle = None;
        self.entries_this_market = 0;
        self.finalized_this_market = false;
        self.round_id = Some(market.market_id.clone());
        self.market = Some(market.clone());
        self.signal.set_phase(Phase::Watching);

        if prev_state != CycleState::Watching {
            self.emit_state_change(prev_state, CycleState::Watching);
        }
        self.bus.publish(StrategyEvent::NewRound {
            round_id: market.market_id.clone(),
        });
        if let Some(tx) = &self.market_tx {
            let _ = tx.send(Some(market));
        }
    }

    fn handle_new_round(&mut self, round_id: String, _end_time: DateTime<Utc>) {
        self.round_id = Some(round_id.clone());
        self.bus.publish(StrategyEvent::NewRound { round_id });
        if self.state() != CycleState::Watching {
            // Mid-cycle, only the identifier updates.
            return;
        }
        // Round events sometimes carry a shortened end time even when the
        // market runs its full window; the market's own end time stays
        // authoritative until the next rotation.
    }

    async fn handle_round_complete(&mut self, status: RoundStatus, profit: Option<Decimal>) {
        if self.finalized_this_market {
            debug!("Round completion already accounted");
        } else {
            let profit = profit.unwrap_or(Decimal::ZERO);
            match status {
                RoundStatus::Completed => {
                    self.stats.cycles_completed += 1;
                    if profit > Decimal::ZERO {
                        self.stats.cycles_won += 1;
                    }
                }
                RoundStatus::Abandoned => self.stats.cycles_abandoned += 1,
            }
            self.stats.total_profit += profit;
            self.finalized_this_market = true;
        }

        if self.mode == TradingMode::Live {
            if let Err(e) = self.exchange.settle_market(SettleStrategy::Redeem).await {
                warn!(error = %e, "Redemption after round completion failed");
            }
        }
    }

    // ========================================================================
    // Price history
    // ========================================================================

    /// Append a top-of-book snapshot to the rolling ask history.
    pub fn record_price_snapshot(&mut self, snap: PriceSnapshot) {
        let now = snap.timestamp;
        if let Some(ask) = snap.up_ask {
            self.up_asks.push_back((ask, now));
        }
        if let Some(ask) = snap.down_ask {
            self.down_asks.push_back((ask, now));
        }
        let cutoff = now - chrono::Duration::seconds(PRICE_HISTORY_WINDOW_SECS);
        while self.up_asks.front().is_some_and(|(_, t)| *t < cutoff) {
            self.up_asks.pop_front();
        }
        while self.down_asks.front().is_some_and(|(_, t)| *t < cutoff) {
            self.down_asks.pop_front();
        }
    }

    /// Most recently observed ask for a side.
    fn last_ask(&self, side: OutcomeSide) -> Option<Decimal> {
        let history = match side {
            OutcomeSide::Up => &self.up_asks,
            OutcomeSide::Down => &self.down_asks,
        };
        history.back().map(|(price, _)| *price)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn trading_balance(&mut self) -> Option<Decimal> {
        match self.mode {
            TradingMode::Paper => self.sim.as_ref().map(|s| s.balance()),
            TradingMode::Live => match self.exchange.collateral_balance().await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!(error = %e, "Balance query failed");
                    None
                }
            },
        }
    }

    /// Clear the cycle and any pending buys, and re-arm leg1 signals in
    /// the detector. Never touches the per-market entry counter.
    fn reset_cycle(&mut self) {
        if let Some(pending) = self.pending_leg1.take() {
            self.expected_order_ids.remove(&pending.order_id);
        }
        if let Some(pending) = self.pending_leg2.take() {
            self.expected_order_ids.remove(&pending.order_id);
        }
        self.cycle = None;
        // Every return to watching re-arms the detector; with more than
        // one cycle allowed per market it would otherwise stay stuck
        // emitting hedge signals until the next rotation.
        self.signal.set_phase(Phase::Watching);
    }

    fn emit_state_change(&self, from: CycleState, to: CycleState) {
        debug!(%from, %to, "State change");
        self.bus.publish(StrategyEvent::StateChange { from, to });
    }
}

#[inline]
fn price_in_range(price: Decimal) -> bool {
    price > Decimal::ZERO && price < Decimal::ONE
}
