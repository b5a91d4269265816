//! The order-management contract the trading control plane consumes.

use async_trait::async_trait;
use rust_decimal::Decimal;

use dip_common::Side;

use crate::types::{
    BookSnapshot, ExchangeError, LimitAck, MarketAck, OrderState, SettleOutcome, SettleStrategy,
};

/// Exchange adapter trait.
///
/// Implementations are stateless per call; the caller owns order IDs and
/// all lifecycle bookkeeping. An adapter may rate-limit internally, but
/// callers do not retry beyond their own polling loops.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place a resting GTC limit order.
    ///
    /// A returned ack without an `order_id` means the order was not
    /// accepted and nothing is resting.
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<LimitAck, ExchangeError>;

    /// Place an immediate fill-or-kill market order.
    ///
    /// `notional` is the collateral amount, not a share count; for SELL
    /// it equals shares times the current estimated price.
    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        notional: Decimal,
    ) -> Result<MarketAck, ExchangeError>;

    /// Query the status and filled size of an order.
    async fn get_order(&self, order_id: &str) -> Result<OrderState, ExchangeError>;

    /// Cancel an order. Cancelling an already-terminal order is not an
    /// error.
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Fetch a one-shot REST order book snapshot for a token.
    async fn get_orderbook(&self, token_id: &str) -> Result<BookSnapshot, ExchangeError>;

    /// Claim residual value from resolved markets. Idempotent.
    async fn settle_market(&self, strategy: SettleStrategy) -> Result<SettleOutcome, ExchangeError>;

    /// Current collateral balance (live trading only).
    async fn collateral_balance(&self) -> Result<Decimal, ExchangeError>;
}
