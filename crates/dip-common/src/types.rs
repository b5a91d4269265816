//! Primitive market types shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which outcome token of a binary market a value refers to.
///
/// Each market issues two complementary tokens; exactly one pays $1.00
/// at expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeSide {
    Up,
    Down,
}

impl OutcomeSide {
    pub fn opposite(&self) -> Self {
        match self {
            OutcomeSide::Up => OutcomeSide::Down,
            OutcomeSide::Down => OutcomeSide::Up,
        }
    }

    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSide::Up => "UP",
            OutcomeSide::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for OutcomeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Market window duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketDuration {
    /// 5-minute markets.
    FiveMin,
    /// 15-minute markets (primary target).
    #[default]
    FifteenMin,
}

impl MarketDuration {
    /// Returns the duration in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            MarketDuration::FiveMin => 5,
            MarketDuration::FifteenMin => 15,
        }
    }

    /// Returns the duration as chrono::Duration.
    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.minutes() as i64)
    }

    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketDuration::FiveMin => "5m",
            MarketDuration::FifteenMin => "15m",
        }
    }
}

impl std::fmt::Display for MarketDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MarketDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "5m" | "5min" | "5" | "fivemin" => Ok(MarketDuration::FiveMin),
            "15m" | "15min" | "15" | "fifteenmin" => Ok(MarketDuration::FifteenMin),
            _ => Err(format!("Unknown market duration: {}", s)),
        }
    }
}

/// A single level in an order book (price + quantity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price in collateral units (0.00 to 1.00).
    pub price: Decimal,
    /// Quantity available at this price.
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Total cost to fill this level.
    #[inline]
    pub fn cost(&self) -> Decimal {
        self.price * self.size
    }
}

/// One round of a binary option market.
///
/// Becomes current on rotation and is immutable thereafter; the next
/// rotation replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Market identifier (slug) from the exchange.
    pub market_id: String,
    /// Window duration for this round.
    pub duration: MarketDuration,
    /// Token ID for the UP outcome.
    pub up_token_id: String,
    /// Token ID for the DOWN outcome.
    pub down_token_id: String,
    /// Absolute end time of the round.
    pub end_time: DateTime<Utc>,
}

impl Market {
    pub fn new(
        market_id: impl Into<String>,
        duration: MarketDuration,
        up_token_id: impl Into<String>,
        down_token_id: impl Into<String>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            duration,
            up_token_id: up_token_id.into(),
            down_token_id: down_token_id.into(),
            end_time,
        }
    }

    /// Seconds remaining until expiry, floored at zero.
    pub fn seconds_remaining(&self) -> i64 {
        self.seconds_remaining_at(Utc::now())
    }

    /// Seconds remaining relative to an explicit clock.
    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }

    /// Returns true if the round has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.end_time
    }

    /// Which side a token ID belongs to, or None for a stale token.
    pub fn side_for_token(&self, token_id: &str) -> Option<OutcomeSide> {
        if token_id == self.up_token_id {
            Some(OutcomeSide::Up)
        } else if token_id == self.down_token_id {
            Some(OutcomeSide::Down)
        } else {
            None
        }
    }

    /// Token ID for an outcome side.
    pub fn token_for_side(&self, side: OutcomeSide) -> &str {
        match side {
            OutcomeSide::Up => &self.up_token_id,
            OutcomeSide::Down => &self.down_token_id,
        }
    }

    /// Check if a token ID belongs to this market.
    pub fn contains_token(&self, token_id: &str) -> bool {
        self.side_for_token(token_id).is_some()
    }
}
