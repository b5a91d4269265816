//! Wire types for the exchange adapter contract.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dip_common::BookLevel;

/// Errors surfaced by an exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Request timeout")]
    Timeout,

    #[error("Not supported in this mode: {0}")]
    Unsupported(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Http(e.to_string())
        }
    }
}

/// Exchange-side status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted but not yet on the book.
    Pending,
    /// Resting on the book, unfilled.
    Open,
    /// Resting with a partial fill.
    PartiallyFilled,
    /// Fully filled.
    Filled,
    /// Cancelled by the owner.
    Cancelled,
    /// Expired on the exchange.
    Expired,
    /// Rejected by the matching engine.
    Rejected,
    /// Unknown to the exchange.
    NotFound,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::NotFound
        )
    }

    /// Statuses that may still fill.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Rejected => "rejected",
            OrderStatus::NotFound => "not_found",
        };
        write!(f, "{}", s)
    }
}

/// Result of a per-order status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub status: OrderStatus,
    /// Shares filled so far (meaningful for any status).
    pub filled_size: Decimal,
}

impl OrderState {
    pub fn new(status: OrderStatus, filled_size: Decimal) -> Self {
        Self { status, filled_size }
    }
}

/// Acknowledgement of a limit order submission.
///
/// A missing `order_id` is treated as a placement failure by callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitAck {
    pub order_id: Option<String>,
}

/// Acknowledgement of a market order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAck {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

impl MarketAck {
    pub fn ok(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

/// One-shot REST order book snapshot for a single token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Bid levels sorted by price descending (best bid first).
    pub bids: Vec<BookLevel>,
    /// Ask levels sorted by price ascending (best ask first).
    pub asks: Vec<BookLevel>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn new(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        let mut snap = Self {
            bids,
            asks,
            timestamp: Utc::now(),
        };
        snap.sort_levels();
        snap
    }

    /// Best bid price (None if no bids).
    #[inline]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price (None if no asks).
    #[inline]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    #[inline]
    pub fn best_bid_size(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.size)
    }

    #[inline]
    pub fn best_ask_size(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.size)
    }

    /// Check if the book has a valid BBO (both bid and ask present).
    pub fn is_valid(&self) -> bool {
        self.best_bid().is_some() && self.best_ask().is_some()
    }

    fn sort_levels(&mut self) {
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
    }
}

/// How to settle a resolved market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleStrategy {
    /// Redeem winning outcome tokens for collateral.
    Redeem,
}

/// Result of a settlement attempt. Idempotent on the exchange side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleOutcome {
    pub success: bool,
    pub amount_received: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::NotFound.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());

        assert!(OrderStatus::Pending.is_live());
        assert!(!OrderStatus::Filled.is_live());
    }

    #[test]
    fn test_book_snapshot_bbo() {
        let snap = BookSnapshot::new(
            vec![BookLevel::new(dec!(0.44), dec!(200)), BookLevel::new(dec!(0.45), dec!(100))],
            vec![BookLevel::new(dec!(0.56), dec!(250)), BookLevel::new(dec!(0.55), dec!(150))],
        );

        // Levels are sorted on construction.
        assert_eq!(snap.best_bid(), Some(dec!(0.45)));
        assert_eq!(snap.best_ask(), Some(dec!(0.55)));
        assert_eq!(snap.best_bid_size(), Some(dec!(100)));
        assert_eq!(snap.best_ask_size(), Some(dec!(150)));
        assert!(snap.is_valid());
    }

    #[test]
    fn test_book_snapshot_empty_side() {
        let snap = BookSnapshot::new(vec![], vec![BookLevel::new(dec!(0.55), dec!(10))]);
        assert!(snap.best_bid().is_none());
        assert!(!snap.is_valid());
    }

    #[test]
    fn test_market_ack_constructors() {
        let ack = MarketAck::ok("order-1");
        assert!(ack.success);
        assert_eq!(ack.order_id.as_deref(), Some("order-1"));

        let ack = MarketAck::failed("no liquidity");
        assert!(!ack.success);
        assert!(ack.order_id.is_none());
        assert_eq!(ack.error.as_deref(), Some("no liquidity"));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&OrderStatus::PartiallyFilled).unwrap();
        assert_eq!(json, "\"partially_filled\"");
        let parsed: OrderStatus = serde_json::from_str("\"not_found\"").unwrap();
        assert_eq!(parsed, OrderStatus::NotFound);
    }
}
