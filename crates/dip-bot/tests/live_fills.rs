//! Live-mode order lifecycle: fill polling, partial fills, terminal
//! fallbacks, timeouts, rotation preemption, and the execution-event
//! race guard.

mod common;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use dip_bot::events::StrategyEvent;
use dip_bot::signal::{ExecutionReport, SignalEvent, SignalKind};
use dip_bot::strategy::controller::ControllerConfig;
use dip_bot::strategy::{CycleState, CycleStatus};
use dip_common::{OutcomeSide, Side};
use dip_exchange::{LimitAck, OrderState, OrderStatus};

use common::*;

fn taker_cfg() -> ControllerConfig {
    ControllerConfig {
        use_maker_orders: false,
        ..ControllerConfig::default()
    }
}

async fn enter_taker_leg1(ctl: &mut dip_bot::ArbController) {
    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::WaitingForHedge);
}

#[tokio::test]
async fn test_partial_fill_cycle() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, bus, _endpoint) = live_controller(taker_cfg(), exchange.clone());
    let mut rx = bus.subscribe();

    // Leg 1 goes out as a market order and is recorded at the observed
    // ask of 0.40 for 100 shares (5% of the $1000 collateral).
    enter_taker_leg1(&mut ctl).await;
    let markets = exchange.market_orders();
    assert_eq!(markets.len(), 1);
    assert_eq!(markets[0].token_id, UP_TOKEN);
    assert_eq!(markets[0].side, Side::Buy);
    assert_eq!(markets[0].notional, dec!(40));

    // A protective sell rests at 0.99 for the filled leg.
    let limits = exchange.limit_orders();
    assert_eq!(limits.len(), 1);
    assert_eq!(limits[0].side, Side::Sell);
    assert_eq!(limits[0].price, dec!(0.99));

    // Leg 2 rests at 0.50; the exchange later reports it cancelled with
    // only 60 of 100 shares filled.
    ctl.handle_event(SignalEvent::Signal(leg2_hedge(
        DOWN_TOKEN,
        OutcomeSide::Down,
        dec!(0.50),
        dec!(0.40),
        Some(dec!(0.50)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Leg2Pending);
    let leg2_order_id = exchange.limit_orders().last().unwrap().order_id.clone();
    exchange.script_order(
        &leg2_order_id,
        vec![OrderState::new(OrderStatus::Cancelled, dec!(60))],
    );

    ctl.poll_pending_orders().await;
    assert_eq!(ctl.state(), CycleState::Watching);

    // payout = min(100, 60) = 60, cost = 40 + 30 = 70, profit = -10.
    let report = drain_events(&mut rx)
        .iter()
        .find_map(|e| match e {
            StrategyEvent::CycleComplete(r) => Some(r.clone()),
            _ => None,
        })
        .expect("cycle completion event");
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.payout, dec!(60));
    assert_eq!(report.total_cost, dec!(70));
    assert_eq!(report.profit, dec!(-10));

    let stats = ctl.stats();
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.cycles_won, 0);
    assert_eq!(stats.total_profit, dec!(-10));
    assert_eq!(ctl.sizer_mut().consecutive_losses(), 1);

    // The leg-2 exit sell covers only the filled 60 shares.
    let exit = exchange.limit_orders().last().unwrap().clone();
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.price, dec!(0.99));
    assert_eq!(exit.size, dec!(60));
}

#[tokio::test]
async fn test_leg1_not_found_resets_cycle() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, _bus, _endpoint) = live_controller(ControllerConfig::default(), exchange.clone());

    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    // Zero margin keeps leg 1 on the maker path.
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Leg1Pending);

    let order_id = exchange.limit_orders()[0].order_id.clone();
    exchange.script_order(&order_id, vec![OrderState::new(OrderStatus::NotFound, Decimal::ZERO)]);

    ctl.poll_pending_orders().await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert_eq!(ctl.stats().cycles_completed, 0);
    assert_eq!(ctl.stats().emergency_exits, 0);

    // The entry budget was spent; another dip in this market is dropped.
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert_eq!(exchange.limit_orders().len(), 1);
}

#[tokio::test]
async fn test_leg2_terminal_unfilled_forces_emergency() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, _bus, _endpoint) = live_controller(taker_cfg(), exchange.clone());

    enter_taker_leg1(&mut ctl).await;
    let leg1_exit_id = exchange.limit_orders()[0].order_id.clone();

    ctl.handle_event(SignalEvent::Signal(leg2_hedge(
        DOWN_TOKEN,
        OutcomeSide::Down,
        dec!(0.50),
        dec!(0.40),
        Some(dec!(0.50)),
    )))
    .await;
    let leg2_order_id = exchange.limit_orders().last().unwrap().order_id.clone();
    exchange.script_order(
        &leg2_order_id,
        vec![OrderState::new(OrderStatus::Expired, Decimal::ZERO)],
    );

    ctl.poll_pending_orders().await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert_eq!(ctl.stats().emergency_exits, 1);
    assert_eq!(ctl.stats().cycles_abandoned, 1);
    // With no observed price the whole entry cost is the loss.
    assert_eq!(ctl.stats().total_profit, dec!(-40));

    // The resting leg-1 exit sell was cancelled during the teardown.
    assert!(exchange.cancelled().contains(&leg1_exit_id));
}

#[tokio::test]
async fn test_fill_timeout_cancels_and_resets() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, _bus, _endpoint) = live_controller(ControllerConfig::default(), exchange.clone());

    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Leg1Pending);
    let order_id = exchange.limit_orders()[0].order_id.clone();

    // Within the timeout the resting order is left alone.
    ctl.poll_pending_orders_at(Utc::now() + chrono::Duration::seconds(10)).await;
    assert_eq!(ctl.state(), CycleState::Leg1Pending);
    assert!(exchange.cancelled().is_empty());

    // Past the 30 s timeout it is cancelled and the cycle resets.
    ctl.poll_pending_orders_at(Utc::now() + chrono::Duration::seconds(31)).await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert!(exchange.cancelled().contains(&order_id));
}

#[tokio::test]
async fn test_rotation_preempts_pending_leg1() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, _bus, _endpoint) = live_controller(ControllerConfig::default(), exchange.clone());

    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Leg1Pending);
    let order_id = exchange.limit_orders()[0].order_id.clone();

    // Rotation while the leg-1 order is still resting.
    ctl.handle_event(SignalEvent::MarketStarted(market("m2", 600))).await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert_eq!(ctl.market().unwrap().market_id, "m2");
    assert!(exchange.cancelled().contains(&order_id));
    // Redemption is attempted on every rotation, including the first.
    assert_eq!(exchange.settle_calls(), 2);

    // A fresh dip on the new market is admitted.
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Leg1Pending);
    assert_eq!(exchange.limit_orders().len(), 2);
}

#[tokio::test]
async fn test_execution_event_and_poll_fill_once() {
    let exchange = Arc::new(MockExchange::new());
    let (mut ctl, bus, _endpoint) = live_controller(ControllerConfig::default(), exchange.clone());
    let mut rx = bus.subscribe();

    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    let order_id = exchange.limit_orders()[0].order_id.clone();

    // The detector reports the fill before the poll loop sees it.
    let report = ExecutionReport {
        leg: SignalKind::Leg1,
        success: true,
        side: OutcomeSide::Up,
        price: dec!(0.40),
        shares: dec!(100),
        token_id: UP_TOKEN.to_string(),
        order_id: Some(order_id.clone()),
    };
    ctl.handle_event(SignalEvent::Execution(report.clone())).await;
    assert_eq!(ctl.state(), CycleState::WaitingForHedge);

    // A duplicate execution event and a late poll response are both
    // discarded: the order ID was consumed by the first fill.
    ctl.handle_event(SignalEvent::Execution(report)).await;
    exchange.script_order(&order_id, vec![OrderState::new(OrderStatus::Filled, dec!(100))]);
    ctl.poll_pending_orders().await;
    assert_eq!(ctl.state(), CycleState::WaitingForHedge);

    let leg1_fills = drain_events(&mut rx)
        .iter()
        .filter(|e| matches!(e, StrategyEvent::Leg1Executed { .. }))
        .count();
    assert_eq!(leg1_fills, 1);
}

#[tokio::test]
async fn test_leg1_order_rejection_keeps_entry_spent() {
    let exchange = Arc::new(MockExchange::new());
    exchange.push_limit_ack(LimitAck { order_id: None });
    let (mut ctl, _bus, _endpoint) = live_controller(ControllerConfig::default(), exchange.clone());

    ctl.handle_event(SignalEvent::MarketStarted(market("m1", 600))).await;
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;

    // No order ID means no resting order and no cycle.
    assert_eq!(ctl.state(), CycleState::Watching);

    // The attempt still counts: no retry within the market.
    ctl.handle_event(SignalEvent::Signal(leg1_dip(
        UP_TOKEN,
        OutcomeSide::Up,
        dec!(0.40),
        dec!(0.55),
        Some(dec!(0.39)),
        Some(dec!(0.40)),
    )))
    .await;
    assert_eq!(ctl.state(), CycleState::Watching);
    assert_eq!(exchange.limit_orders().len(), 1);
}
