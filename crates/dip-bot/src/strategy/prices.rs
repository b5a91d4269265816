//! Price aggregation for the current market.
//!
//! Polls the signal source's cached top-of-book at a fixed cadence and
//! forwards changed snapshots to the controller (which keeps the rolling
//! ask history) and to the event bus. When the cached book stops
//! advancing, a serialized REST fallback fetches fresh snapshots and
//! injects them back into the signal source so dip detection keeps
//! working through feed stalls. Optionally records snapshots to disk as
//! JSONL.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dip_common::{Market, OutcomeSide};
use dip_exchange::RestBookClient;

use crate::config::BotConfig;
use crate::events::{EventBus, PriceSnapshot, StrategyEvent};
use crate::signal::{SignalControl, TopOfBook};

/// Configuration for the price aggregator.
#[derive(Debug, Clone)]
pub struct PriceAggregatorConfig {
    /// Cached-book poll cadence.
    pub poll_interval: Duration,
    /// REST fallback cadence; also the staleness threshold.
    pub rest_fallback_interval: Duration,
    /// Record snapshots to disk.
    pub record_data: bool,
    /// Directory for recorded snapshots.
    pub data_dir: Option<PathBuf>,
    /// Minimum interval between recorded snapshots.
    pub record_interval: Duration,
}

impl PriceAggregatorConfig {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            rest_fallback_interval: Duration::from_secs(5),
            record_data: config.paper.record_data,
            data_dir: config.paper.data_dir.clone(),
            record_interval: Duration::from_millis(config.paper.record_interval_ms),
        }
    }
}

impl Default for PriceAggregatorConfig {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

/// Polls books, emits price updates, and runs the REST fallback.
pub struct PriceAggregator {
    config: PriceAggregatorConfig,
    signal: Arc<dyn SignalControl>,
    rest: RestBookClient,
    bus: EventBus,
    out: mpsc::Sender<PriceSnapshot>,
    market_rx: watch::Receiver<Option<Market>>,

    last_up: Option<TopOfBook>,
    last_down: Option<TopOfBook>,
    /// Last time the cached book changed; drives the staleness check.
    last_advance: Option<DateTime<Utc>>,
    last_record: Option<DateTime<Utc>>,
    recorder: Option<File>,
}

impl PriceAggregator {
    pub fn new(
        config: PriceAggregatorConfig,
        signal: Arc<dyn SignalControl>,
        rest: RestBookClient,
        bus: EventBus,
        out: mpsc::Sender<PriceSnapshot>,
        market_rx: watch::Receiver<Option<Market>>,
    ) -> Self {
        Self {
            config,
            signal,
            rest,
            bus,
            out,
            market_rx,
            last_up: None,
            last_down: None,
            last_advance: None,
            last_record: None,
            recorder: None,
        }
    }

    /// Drive the aggregator until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rest_tick = tokio::time::interval(self.config.rest_fallback_interval);
        rest_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            fallback_ms = self.config.rest_fallback_interval.as_millis() as u64,
            "Price aggregator started"
        );

        loop {
            tokio::select! {
                _ = poll_tick.tick() => self.poll_once().await,
                _ = rest_tick.tick() => self.rest_fallback().await,
                _ = shutdown.recv() => {
                    debug!("Price aggregator stopping");
                    break;
                }
            }
        }
    }

    /// Read the cached books once; forward a snapshot when they changed.
    async fn poll_once(&mut self) {
        let up = self.signal.top_of_book(OutcomeSide::Up);
        let down = self.signal.top_of_book(OutcomeSide::Down);

        if up == self.last_up && down == self.last_down {
            return;
        }
        self.last_up = up.clone();
        self.last_down = down.clone();
        self.last_advance = Some(Utc::now());

        let snap = build_snapshot(up.as_ref(), down.as_ref());
        self.bus.publish(StrategyEvent::PriceUpdate(snap.clone()));
        self.maybe_record(&snap);
        if self.out.send(snap).await.is_err() {
            debug!("Price snapshot dropped: controller stream closed");
        }
    }

    /// If the cached book has not advanced for a full fallback interval,
    /// fetch REST snapshots and inject them into the signal source.
    /// Awaiting each fetch inline keeps at most one in flight.
    async fn rest_fallback(&mut self) {
        let threshold = chrono::Duration::from_std(self.config.rest_fallback_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let advanced_recently = self
            .last_advance
            .is_some_and(|t| Utc::now() - t < threshold);
        if advanced_recently {
            return;
        }

        let Some(market) = self.market_rx.borrow().clone() else {
            return;
        };

        for token_id in [&market.up_token_id, &market.down_token_id] {
            match self.rest.get_book(token_id).await {
                Ok(book) => {
                    debug!(%token_id, "Injected REST book snapshot");
                    self.signal.inject_orderbook(token_id, book);
                }
                Err(e) => debug!(%token_id, error = %e, "REST book fetch failed"),
            }
        }
    }

    fn maybe_record(&mut self, snap: &PriceSnapshot) {
        if !self.config.record_data {
            return;
        }
        let due = self
            .last_record
            .map_or(true, |t| snap.timestamp - t >= chrono::Duration::milliseconds(
                self.config.record_interval.as_millis() as i64,
            ));
        if !due {
            return;
        }

        if self.recorder.is_none() {
            self.recorder = self.open_recorder();
            if self.recorder.is_none() {
                // Opening failed or no directory configured; disable quietly.
                self.config.record_data = false;
                return;
            }
        }
        if let Some(file) = self.recorder.as_mut() {
            let line = match serde_json::to_string(snap) {
                Ok(line) => line,
                Err(_) => return,
            };
            if writeln!(file, "{}", line).is_err() {
                warn!("Price recording failed; disabling recorder");
                self.config.record_data = false;
                self.recorder = None;
                return;
            }
            self.last_record = Some(snap.timestamp);
        }
    }

    fn open_recorder(&self) -> Option<File> {
        let dir = self.config.data_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to create data directory");
            return None;
        }
        let path = dir.join("prices.jsonl");
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open price recorder");
                None
            }
        }
    }
}

/// Combine both sides' cached books into one snapshot.
fn build_snapshot(up: Option<&TopOfBook>, down: Option<&TopOfBook>) -> PriceSnapshot {
    let up_bid = up.and_then(|t| t.bid);
    let up_ask = up.and_then(|t| t.ask);
    let down_bid = down.and_then(|t| t.bid);
    let down_ask = down.and_then(|t| t.ask);
    let sum = match (up_ask, down_ask) {
        (Some(u), Some(d)) => Some(u.price + d.price),
        _ => None,
    };
    PriceSnapshot {
        up_bid: up_bid.map(|l| l.price),
        up_bid_size: up_bid.map(|l| l.size),
        up_ask: up_ask.map(|l| l.price),
        up_ask_size: up_ask.map(|l| l.size),
        down_bid: down_bid.map(|l| l.price),
        down_bid_size: down_bid.map(|l| l.size),
        down_ask: down_ask.map(|l| l.price),
        down_ask_size: down_ask.map(|l| l.size),
        sum,
        timestamp: Utc::now(),
    }
}
