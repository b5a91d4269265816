//! Taker fee estimation and order kind selection.
//!
//! The exchange charges takers a quadratic per-share fee of
//! `price * (1 - price) * fee_rate` and nothing for makers. Expressed as a
//! fraction of cost per share that is `(1 - price) * fee_rate`, which is
//! what entry decisions compare against the arbitrage margin: a maker
//! limit is free but may never fill, a taker market order fills now and
//! pays up. Leg 2 is always a maker limit since the hedge price is the
//! whole trade.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use dip_common::Side;

/// Minimum price increment on the exchange.
pub const PRICE_TICK: Decimal = dec!(0.01);

/// How an order is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Resting GTC limit order, zero fee.
    MakerLimit,
    /// Immediate fill-or-kill market order, taker fee charged.
    TakerMarket,
}

impl OrderKind {
    /// Exchange order-type tag, as written to the trade journal.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::MakerLimit => "GTC",
            OrderKind::TakerMarket => "FOK",
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Estimated taker fee as a fraction of cost per share.
///
/// Returns `(1 - price) * fee_rate` for prices strictly inside (0, 1)
/// and zero otherwise. Cheaper tokens carry a higher fee percentage.
pub fn estimate_taker_fee(price: Decimal, fee_rate: Decimal) -> Decimal {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Decimal::ZERO;
    }
    (Decimal::ONE - price) * fee_rate
}

/// Decide how to place the leg-1 buy.
///
/// With maker orders disabled this is always a taker market order. With
/// the taker fallback enabled, a margin comfortably above the taker fee
/// (1.5x) buys certainty of fill instead of queue position.
pub fn decide_leg1_order_kind(
    leg1_price: Decimal,
    opposite_ask: Decimal,
    sum_target: Decimal,
    use_maker: bool,
    fallback_to_taker: bool,
    fee_rate: Decimal,
) -> OrderKind {
    if !use_maker {
        return OrderKind::TakerMarket;
    }

    if fallback_to_taker && sum_target > Decimal::ZERO {
        let margin = (sum_target - (leg1_price + opposite_ask)) / sum_target;
        let fee = estimate_taker_fee(leg1_price, fee_rate);
        if margin > fee * dec!(1.5) {
            return OrderKind::TakerMarket;
        }
    }

    OrderKind::MakerLimit
}

/// Decide how to place the leg-2 hedge buy. Always a maker limit.
pub fn decide_leg2_order_kind() -> OrderKind {
    OrderKind::MakerLimit
}

/// Price one tick inside the spread.
///
/// Buys are clamped so they never cross the ask; sells never cross the
/// bid. With a spread at or below one tick this returns the touch.
pub fn limit_price_inside_spread(best_bid: Decimal, best_ask: Decimal, side: Side) -> Decimal {
    match side {
        Side::Buy => (best_bid + PRICE_TICK).min(best_ask),
        Side::Sell => (best_ask - PRICE_TICK).max(best_bid),
    }
}
