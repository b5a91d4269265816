//! Deterministic paper-trading simulation.
//!
//! Tracks a simulated collateral balance, per-(market, side) positions
//! with volume-weighted average prices, and a history of completed
//! cycles. Fills are costed through configurable slippage and fee models
//! so paper results stay honest about execution quality. Every applied
//! fill goes to the JSONL trade journal and out on the event bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use dip_common::{OutcomeSide, Side};

use crate::config::{PaperConfig, TradingConfig};
use crate::events::{EventBus, StrategyEvent, TradeFill};
use crate::fees::OrderKind;
use crate::journal::TradeJournal;
use crate::strategy::{CycleReport, Leg};

/// Ask consumed per 50 shares drives the size-dependent slippage term.
const SLIPPAGE_SIZE_UNIT: Decimal = dec!(50);

/// Market orders never fill worse than 2% through the ask.
const SLIPPAGE_CAP_MULTIPLIER: Decimal = dec!(1.02);

/// Configuration for the paper simulator.
#[derive(Debug, Clone)]
pub struct PaperSimConfig {
    pub starting_balance: Decimal,
    pub simulate_fees: bool,
    pub simulate_slippage: bool,
    pub slippage_pct: Decimal,
    pub fee_rate: Decimal,
}

impl PaperSimConfig {
    pub fn from_config(paper: &PaperConfig, trading: &TradingConfig) -> Self {
        Self {
            starting_balance: paper.starting_balance,
            simulate_fees: paper.simulate_fees,
            simulate_slippage: paper.simulate_slippage,
            slippage_pct: paper.slippage_pct,
            fee_rate: trading.taker_fee_rate,
        }
    }
}

impl Default for PaperSimConfig {
    fn default() -> Self {
        Self::from_config(&PaperConfig::default(), &TradingConfig::default())
    }
}

/// Aggregate position on one side of one market.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    /// Shares held.
    pub qty: Decimal,
    /// Volume-weighted average fill price.
    pub avg_price: Decimal,
    /// When the position was opened.
    pub opened_at: DateTime<Utc>,
}

/// Paper trading simulator.
///
/// Exclusively owns the simulated balance, positions, and trade log;
/// everything else observes through events.
pub struct PaperSim {
    config: PaperSimConfig,
    balance: Decimal,
    positions: HashMap<(String, OutcomeSide), PaperPosition>,
    history: Vec<CycleReport>,
    journal: TradeJournal,
    bus: EventBus,
}

impl PaperSim {
    pub fn new(config: PaperSimConfig, journal: TradeJournal, bus: EventBus) -> Self {
        Self {
            balance: config.starting_balance,
            config,
            positions: HashMap::new(),
            history: Vec::new(),
            journal,
            bus,
        }
    }

    /// Current simulated balance.
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Position for a (market, side) pair.
    pub fn position(&self, market_id: &str, side: OutcomeSide) -> Option<&PaperPosition> {
        self.positions.get(&(market_id.to_string(), side))
    }

    /// Completed cycle history.
    pub fn history(&self) -> &[CycleReport] {
        &self.history
    }

    /// Apply a leg buy. Returns false (and changes nothing) when the
    /// balance cannot cover cost plus fee.
    pub fn buy(&mut self, leg: &Leg, market_id: &str) -> bool {
        let effective = self.effective_buy_price(leg);
        let fee = self.buy_fee(leg);
        let total = effective * leg.qty + fee;

        if self.balance < total {
            warn!(
                balance = %self.balance,
                required = %total,
                market_id = %market_id,
                "Paper buy refused: insufficient balance"
            );
            return false;
        }

        self.balance -= total;

        let key = (market_id.to_string(), leg.side);
        match self.positions.get_mut(&key) {
            Some(pos) => {
                // VWAP merge with the existing position.
                let new_qty = pos.qty + leg.qty;
                pos.avg_price = (pos.avg_price * pos.qty + effective * leg.qty) / new_qty;
                pos.qty = new_qty;
            }
            None => {
                self.positions.insert(
                    key,
                    PaperPosition {
                        qty: leg.qty,
                        avg_price: effective,
                        opened_at: Utc::now(),
                    },
                );
            }
        }

        self.journal.append(
            Side::Buy,
            leg.qty,
            effective,
            fee,
            leg.order_kind.as_str(),
            market_id,
            self.balance,
        );
        self.bus.publish(StrategyEvent::Trade(TradeFill {
            market_id: market_id.to_string(),
            side: leg.side,
            order_side: Side::Buy,
            qty: leg.qty,
            price: effective,
            fee,
        }));

        info!(
            market_id = %market_id,
            side = %leg.side,
            qty = %leg.qty,
            price = %effective,
            fee = %fee,
            balance = %self.balance,
            "Paper buy filled"
        );
        true
    }

    /// Apply an immediate sell and return the net proceeds. Sells always
    /// pay the taker fee.
    pub fn sell(
        &mut self,
        _token_id: &str,
        side: OutcomeSide,
        qty: Decimal,
        price: Decimal,
        market_id: &str,
    ) -> Decimal {
        let fee = self.taker_fee(qty, price);
        let net = price * qty - fee;
        self.balance += net;

        self.positions.remove(&(market_id.to_string(), side));

        self.journal.append(
            Side::Sell,
            qty,
            price,
            fee,
            OrderKind::TakerMarket.as_str(),
            market_id,
            self.balance,
        );
        self.bus.publish(StrategyEvent::Trade(TradeFill {
            market_id: market_id.to_string(),
            side,
            order_side: Side::Sell,
            qty,
            price,
            fee,
        }));

        info!(
            market_id = %market_id,
            side = %side,
            qty = %qty,
            price = %price,
            fee = %fee,
            net = %net,
            balance = %self.balance,
            "Paper sell filled"
        );
        net
    }

    /// Settle a resolved market: winning-side shares pay $1.00 each,
    /// losing-side shares pay nothing. All positions for the market are
    /// removed.
    pub fn settle_round(&mut self, market_id: &str, winning_side: OutcomeSide) -> Decimal {
        let mut payout = Decimal::ZERO;
        self.positions.retain(|(m, side), pos| {
            if m == market_id {
                if *side == winning_side {
                    payout += pos.qty;
                }
                false
            } else {
                true
            }
        });

        self.balance += payout;

        if payout > Decimal::ZERO {
            info!(
                market_id = %market_id,
                winning_side = %winning_side,
                payout = %payout,
                balance = %self.balance,
                "Round settled"
            );
        }
        self.bus.publish(StrategyEvent::Settled {
            market_id: market_id.to_string(),
            winning_side,
            payout,
        });

        payout
    }

    /// Drop all positions for a market without payout or refund.
    pub fn abandon_round(&mut self, market_id: &str) {
        let before = self.positions.len();
        self.positions.retain(|(m, _), _| m != market_id);
        let dropped = before - self.positions.len();
        if dropped > 0 {
            debug!(market_id = %market_id, positions = dropped, "Round abandoned");
        }
    }

    /// Record a completed cycle.
    pub fn record_cycle(&mut self, report: CycleReport) {
        self.history.push(report);
    }

    /// Fill price after the slippage model.
    ///
    /// Market orders with both quotes known fill through the ask plus a
    /// size-dependent penalty, capped at 2% past the ask. Maker limits
    /// fill at their limit price. Market orders without quotes get the
    /// flat slippage fraction.
    fn effective_buy_price(&self, leg: &Leg) -> Decimal {
        if !self.config.simulate_slippage {
            return leg.price;
        }

        match leg.order_kind {
            OrderKind::MakerLimit => leg.price,
            OrderKind::TakerMarket => match (leg.best_bid, leg.best_ask) {
                (Some(_bid), Some(ask)) => {
                    let effective = leg.price
                        + (ask - leg.price)
                        + leg.price * self.config.slippage_pct * (leg.qty / SLIPPAGE_SIZE_UNIT);
                    effective.min(ask * SLIPPAGE_CAP_MULTIPLIER)
                }
                _ => leg.price * (Decimal::ONE + self.config.slippage_pct),
            },
        }
    }

    /// Fee for a buy: zero for makers, quadratic taker fee otherwise.
    fn buy_fee(&self, leg: &Leg) -> Decimal {
        match leg.order_kind {
            OrderKind::MakerLimit => Decimal::ZERO,
            OrderKind::TakerMarket => self.taker_fee(leg.qty, leg.price),
        }
    }

    fn taker_fee(&self, qty: Decimal, price: Decimal) -> Decimal {
        if !self.config.simulate_fees {
            return Decimal::ZERO;
        }
        qty * price * (Decimal::ONE - price) * self.config.fee_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(config: PaperSimConfig) -> PaperSim {
        PaperSim::new(config, TradeJournal::disabled(), EventBus::default())
    }

    fn config() -> PaperSimConfig {
        PaperSimConfig {
            starting_balance: dec!(1000),
            simulate_fees: true,
            simulate_slippage: true,
            slippage_pct: dec!(0.02),
            fee_rate: dec!(0.0625),
        }
    }

    fn maker_leg(side: OutcomeSide, price: Decimal, qty: Decimal) -> Leg {
        Leg {
            side,
            price,
            qty,
            token_id: "tok".to_string(),
            order_kind: OrderKind::MakerLimit,
            best_bid: None,
            best_ask: None,
            order_id: None,
            filled_at: Utc::now(),
        }
    }

    fn taker_leg(
        side: OutcomeSide,
        price: Decimal,
        qty: Decimal,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
    ) -> Leg {
        Leg {
            order_kind: OrderKind::TakerMarket,
            best_bid,
            best_ask,
            ..maker_leg(side, price, qty)
        }
    }

    #[test]
    fn test_maker_buy_no_fee_no_slippage() {
        let mut sim = sim(config());
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100)), "m1"));
        assert_eq!(sim.balance(), dec!(960));

        let pos = sim.position("m1", OutcomeSide::Up).unwrap();
        assert_eq!(pos.qty, dec!(100));
        assert_eq!(pos.avg_price, dec!(0.40));
    }

    #[test]
    fn test_taker_buy_with_quotes() {
        let mut sim = sim(config());
        let leg = taker_leg(OutcomeSide::Up, dec!(0.40), dec!(50), Some(dec!(0.39)), Some(dec!(0.41)));
        assert!(sim.buy(&leg, "m1"));

        // effective = 0.40 + (0.41 - 0.40) + 0.40 * 0.02 * (50/50) = 0.418,
        // below the 0.41 * 1.02 cap.
        let pos = sim.position("m1", OutcomeSide::Up).unwrap();
        assert_eq!(pos.avg_price, dec!(0.418));

        // fee = 50 * 0.40 * 0.60 * 0.0625 = 0.75
        let expected_balance = dec!(1000) - dec!(0.418) * dec!(50) - dec!(0.75);
        assert_eq!(sim.balance(), expected_balance);
    }

    #[test]
    fn test_taker_buy_slippage_cap() {
        let mut cfg = config();
        cfg.starting_balance = dec!(10000);
        let mut sim = sim(cfg);

        // Huge size pushes the penalty past the cap.
        let leg = taker_leg(OutcomeSide::Up, dec!(0.40), dec!(5000), Some(dec!(0.39)), Some(dec!(0.41)));
        assert!(sim.buy(&leg, "m1"));

        let pos = sim.position("m1", OutcomeSide::Up).unwrap();
        assert_eq!(pos.avg_price, dec!(0.41) * dec!(1.02));
    }

    #[test]
    fn test_taker_buy_without_quotes_flat_slippage() {
        let mut sim = sim(config());
        let leg = taker_leg(OutcomeSide::Down, dec!(0.50), dec!(10), None, None);
        assert!(sim.buy(&leg, "m1"));

        let pos = sim.position("m1", OutcomeSide::Down).unwrap();
        assert_eq!(pos.avg_price, dec!(0.51)); // 0.50 * 1.02
    }

    #[test]
    fn test_slippage_disabled() {
        let mut cfg = config();
        cfg.simulate_slippage = false;
        let mut sim = sim(cfg);

        let leg = taker_leg(OutcomeSide::Up, dec!(0.40), dec!(50), Some(dec!(0.39)), Some(dec!(0.41)));
        assert!(sim.buy(&leg, "m1"));
        assert_eq!(sim.position("m1", OutcomeSide::Up).unwrap().avg_price, dec!(0.40));
    }

    #[test]
    fn test_fees_disabled() {
        let mut cfg = config();
        cfg.simulate_fees = false;
        cfg.simulate_slippage = false;
        let mut sim = sim(cfg);

        let leg = taker_leg(OutcomeSide::Up, dec!(0.40), dec!(100), None, None);
        assert!(sim.buy(&leg, "m1"));
        assert_eq!(sim.balance(), dec!(960));
    }

    #[test]
    fn test_insufficient_balance_refused() {
        let mut cfg = config();
        cfg.starting_balance = dec!(10);
        let mut sim = sim(cfg);

        let leg = maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100));
        assert!(!sim.buy(&leg, "m1"));
        assert_eq!(sim.balance(), dec!(10));
        assert!(sim.position("m1", OutcomeSide::Up).is_none());
    }

    #[test]
    fn test_vwap_merge() {
        let mut sim = sim(config());
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100)), "m1"));
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.50), dec!(100)), "m1"));

        let pos = sim.position("m1", OutcomeSide::Up).unwrap();
        assert_eq!(pos.qty, dec!(200));
        assert_eq!(pos.avg_price, dec!(0.45));
    }

    #[test]
    fn test_sell_charges_taker_fee_and_clears_position() {
        let mut sim = sim(config());
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100)), "m1"));

        let net = sim.sell("tok", OutcomeSide::Up, dec!(100), dec!(0.20), "m1");
        // fee = 100 * 0.20 * 0.80 * 0.0625 = 1
        assert_eq!(net, dec!(19));
        assert_eq!(sim.balance(), dec!(960) + dec!(19));
        assert!(sim.position("m1", OutcomeSide::Up).is_none());
    }

    #[test]
    fn test_settle_round_balance_law() {
        let mut sim = sim(config());
        // Two maker buys: no fees, no slippage.
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100)), "m1"));
        assert!(sim.buy(&maker_leg(OutcomeSide::Down, dec!(0.50), dec!(100)), "m1"));
        assert_eq!(sim.balance(), dec!(910));

        let payout = sim.settle_round("m1", OutcomeSide::Up);
        assert_eq!(payout, dec!(100));
        // balance_final = starting - sum(cost + fee) + winning_qty
        assert_eq!(sim.balance(), dec!(1000) - dec!(90) + dec!(100));
        assert!(sim.position("m1", OutcomeSide::Up).is_none());
        assert!(sim.position("m1", OutcomeSide::Down).is_none());
    }

    #[test]
    fn test_settle_round_only_touches_one_market() {
        let mut sim = sim(config());
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(10)), "m1"));
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(10)), "m2"));

        sim.settle_round("m1", OutcomeSide::Up);
        assert!(sim.position("m1", OutcomeSide::Up).is_none());
        assert!(sim.position("m2", OutcomeSide::Up).is_some());
    }

    #[test]
    fn test_abandon_round_no_refund() {
        let mut sim = sim(config());
        assert!(sim.buy(&maker_leg(OutcomeSide::Up, dec!(0.40), dec!(100)), "m1"));
        let balance = sim.balance();

        sim.abandon_round("m1");
        assert_eq!(sim.balance(), balance);
        assert!(sim.position("m1", OutcomeSide::Up).is_none());
    }

    #[test]
    fn test_record_cycle_history() {
        let mut sim = sim(config());
        sim.record_cycle(CycleReport::new(
            "m1",
            crate::strategy::CycleStatus::Completed,
            dec!(100),
            dec!(90),
        ));
        assert_eq!(sim.history().len(), 1);
        assert_eq!(sim.history()[0].profit, dec!(10));
    }
}
