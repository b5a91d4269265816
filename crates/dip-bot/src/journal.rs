//! Append-only JSONL trade journal.
//!
//! One JSON object per line, one line per paper trade. Write failures
//! are swallowed; the journal must never take the trading loop down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use dip_common::Side;

/// A single journal line.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub shares: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub order_type: String,
    pub market_slug: String,
    pub balance_after: Decimal,
}

/// Journal writer with monotonically increasing trade IDs.
pub struct TradeJournal {
    file: Option<File>,
    next_id: u64,
    write_failed: bool,
}

impl TradeJournal {
    /// Open (or create) the journal at `path`. A missing path produces a
    /// disabled journal that still hands out IDs.
    pub fn new(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            if let Some(parent) = p.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %p.display(), error = %e, "Failed to create journal directory");
                    return None;
                }
            }
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "Failed to open trade journal");
                    None
                }
            }
        });

        Self {
            file,
            next_id: 1,
            write_failed: false,
        }
    }

    /// Journal disabled entirely (no file configured).
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Append a trade line, returning the assigned trade ID.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        side: Side,
        shares: Decimal,
        price: Decimal,
        fee: Decimal,
        order_type: &str,
        market_slug: &str,
        balance_after: Decimal,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let record = TradeRecord {
            id,
            timestamp: Utc::now(),
            side,
            shares,
            price,
            fee,
            order_type: order_type.to_string(),
            market_slug: market_slug.to_string(),
            balance_after,
        };

        if let Some(file) = self.file.as_mut() {
            let result = serde_json::to_string(&record)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(file, "{}", line));
            if let Err(e) = result {
                if !self.write_failed {
                    warn!(error = %e, "Trade journal write failed; further failures suppressed");
                    self.write_failed = true;
                }
            }
        }

        id
    }
}
