//! No-op exchange client for paper trading.
//!
//! Paper mode synthesizes fills internally and must never place a real
//! order. Every order-management call on this client fails loudly so a
//! wiring mistake cannot silently trade; book snapshots are delegated to
//! the REST client since they are read-only.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use dip_common::Side;

use crate::client::ExchangeClient;
use crate::rest::RestBookClient;
use crate::types::{
    BookSnapshot, ExchangeError, LimitAck, MarketAck, OrderState, SettleOutcome, SettleStrategy,
};

/// Exchange client that refuses all order management.
pub struct NoopExchange {
    books: Option<RestBookClient>,
}

impl NoopExchange {
    /// Create a no-op client with a REST book client for snapshots.
    pub fn new(books: RestBookClient) -> Self {
        Self { books: Some(books) }
    }

    /// Create a fully inert client (snapshots also fail).
    pub fn disconnected() -> Self {
        Self { books: None }
    }
}

#[async_trait]
impl ExchangeClient for NoopExchange {
    async fn create_limit_order(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<LimitAck, ExchangeError> {
        warn!(%token_id, %side, %price, %size, "limit order refused by no-op exchange client");
        Err(ExchangeError::Unsupported("create_limit_order"))
    }

    async fn create_market_order(
        &self,
        token_id: &str,
        side: Side,
        notional: Decimal,
    ) -> Result<MarketAck, ExchangeError> {
        warn!(%token_id, %side, %notional, "market order refused by no-op exchange client");
        Err(ExchangeError::Unsupported("create_market_order"))
    }

    async fn get_order(&self, _order_id: &str) -> Result<OrderState, ExchangeError> {
        Err(ExchangeError::Unsupported("get_order"))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn get_orderbook(&self, token_id: &str) -> Result<BookSnapshot, ExchangeError> {
        match &self.books {
            Some(client) => client.get_book(token_id).await,
            None => Err(ExchangeError::Unsupported("get_orderbook")),
        }
    }

    async fn settle_market(
        &self,
        _strategy: SettleStrategy,
    ) -> Result<SettleOutcome, ExchangeError> {
        Ok(SettleOutcome {
            success: false,
            amount_received: None,
        })
    }

    async fn collateral_balance(&self) -> Result<Decimal, ExchangeError> {
        Err(ExchangeError::Unsupported("collateral_balance"))
    }
}
