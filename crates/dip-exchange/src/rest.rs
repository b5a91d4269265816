//! REST order book snapshot client.
//!
//! Used by the price aggregator as a fallback when the websocket-fed
//! cached book stops advancing: a one-shot `/book` fetch keeps dip
//! detection alive through feed stalls. Fetches are cheap but rate
//! limited, so callers serialize them.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use dip_common::BookLevel;

use crate::types::{BookSnapshot, ExchangeError};

/// Request timeout for snapshot fetches.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the REST book client.
#[derive(Debug, Clone)]
pub struct RestBookConfig {
    /// Base URL of the CLOB REST API.
    pub endpoint: String,
}

/// Client for one-shot order book snapshots.
pub struct RestBookClient {
    http: reqwest::Client,
    endpoint: String,
}

/// Raw level as returned by the API (decimals are string-encoded).
#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

/// Raw book response.
#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

impl RestBookClient {
    /// Create a new snapshot client.
    pub fn new(config: RestBookConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            endpoint: config.endpoint,
        }
    }

    /// Fetch a snapshot for a token.
    pub async fn get_book(&self, token_id: &str) -> Result<BookSnapshot, ExchangeError> {
        if token_id.is_empty() {
            return Err(ExchangeError::Parse("token ID cannot be empty".to_string()));
        }

        let url = format!("{}/book?token_id={}", self.endpoint, token_id);
        debug!(url = %url, "Fetching book snapshot");

        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(token_id = %token_id, status = status.as_u16(), "Book snapshot API error");
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let raw: RawBook = response
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(format!("Failed to parse book response: {}", e)))?;

        parse_book(raw)
    }
}

fn parse_book(raw: RawBook) -> Result<BookSnapshot, ExchangeError> {
    let bids = parse_levels(raw.bids)?;
    let asks = parse_levels(raw.asks)?;
    Ok(BookSnapshot::new(bids, asks))
}

fn parse_levels(raw: Vec<RawLevel>) -> Result<Vec<BookLevel>, ExchangeError> {
    raw.into_iter()
        .map(|l| {
            let price: Decimal = l
                .price
                .parse()
                .map_err(|e| ExchangeError::Parse(format!("bad price {:?}: {}", l.price, e)))?;
            let size: Decimal = l
                .size
                .parse()
                .map_err(|e| ExchangeError::Parse(format!("bad size {:?}: {}", l.size, e)))?;
            Ok(BookLevel::new(price, size))
        })
        .collect()
}
