//! dip-bot: automated two-leg arbitrage on 15-minute binary markets.
//!
//! Usage:
//!   dip-bot [OPTIONS]
//!
//! Options:
//!   -m, --mode <MODE>      Trading mode: live, paper
//!   -c, --config <FILE>    Config file path (default: config/bot.toml)
//!   --assets <ASSETS>      Comma-separated assets (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dip_bot::config::{BotConfig, TradingMode};
use dip_bot::events::EventBus;
use dip_bot::journal::TradeJournal;
use dip_bot::paper::{PaperSim, PaperSimConfig};
use dip_bot::signal::signal_endpoint;
use dip_bot::sizer::{PositionSizer, SizerConfig};
use dip_bot::strategy::controller::{ArbController, ControllerConfig};
use dip_bot::strategy::prices::{PriceAggregator, PriceAggregatorConfig};
use dip_bot::StrategyEvent;
use dip_exchange::{ExchangeClient, NoopExchange, RestBookClient, RestBookConfig};

/// CLI arguments for dip-bot.
#[derive(Parser, Debug)]
#[command(name = "dip-bot")]
#[command(about = "Two-leg arbitrage bot for 15-minute binary markets")]
#[command(version)]
struct Args {
    /// Trading mode: live, paper
    #[arg(short, long)]
    mode: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Comma-separated assets to trade (e.g., "BTC,ETH")
    #[arg(long, value_delimiter = ',')]
    assets: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!("Config file not found at {:?}, using defaults", args.config);
        BotConfig::default()
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(args.mode, args.assets);

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting dip-bot");
    info!("Mode: {}", config.mode);
    info!("Assets: {:?}", config.trading.assets);
    info!("Duration: {}", config.trading.duration);

    config.validate().context("Configuration validation failed")?;

    let bus = EventBus::default();
    let (endpoint, detector_handle, events_rx) = signal_endpoint(256);

    let exchange: Arc<dyn ExchangeClient> = match config.mode {
        TradingMode::Paper => Arc::new(NoopExchange::new(RestBookClient::new(RestBookConfig {
            endpoint: config.api.clob_endpoint.clone(),
        }))),
        TradingMode::Live => {
            // The order-management adapter is deployment-specific and wired
            // by the embedding binary; this build only ships the paper
            // backend.
            bail!("live mode requires an exchange adapter; none is wired in this build")
        }
    };

    let sim = match config.mode {
        TradingMode::Paper => Some(PaperSim::new(
            PaperSimConfig::from_config(&config.paper, &config.trading),
            TradeJournal::new(config.paper.log_file.as_deref()),
            bus.clone(),
        )),
        TradingMode::Live => None,
    };

    let sizer = PositionSizer::new(SizerConfig::from_risk_config(&config.risk));
    let (market_tx, market_rx) = watch::channel(None);
    let (price_tx, price_rx) = mpsc::channel(64);

    let controller = ArbController::new(
        ControllerConfig::from_config(&config),
        config.mode,
        exchange,
        Arc::new(endpoint.clone()),
        sim,
        sizer,
        bus.clone(),
    )
    .with_market_watch(market_tx);

    let aggregator = PriceAggregator::new(
        PriceAggregatorConfig::from_config(&config),
        Arc::new(endpoint),
        RestBookClient::new(RestBookConfig {
            endpoint: config.api.clob_endpoint.clone(),
        }),
        bus.clone(),
        price_tx,
        market_rx,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Ctrl-C triggers a graceful stop of both tasks.
    let ctrlc_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = ctrlc_tx.send(());
        }
    });

    // Drain the event bus into the log so every state change is visible.
    let mut bus_rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(StrategyEvent::Error { message }) => warn!(%message, "strategy event"),
                Ok(event) => debug!(?event, "strategy event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(dropped = n, "event logger lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let aggregator_handle = tokio::spawn(aggregator.run(shutdown_tx.subscribe()));

    // The external dip detector attaches through this handle; it must
    // outlive the run loop or the controller sees a closed stream.
    let _detector_handle = detector_handle;

    let stats = controller
        .run(events_rx, price_rx, shutdown_tx.subscribe())
        .await
        .context("Trading loop failed")?;

    let _ = shutdown_tx.send(());
    let _ = aggregator_handle.await;

    info!(
        cycles_completed = stats.cycles_completed,
        cycles_won = stats.cycles_won,
        emergency_exits = stats.emergency_exits,
        total_profit = %stats.total_profit,
        win_rate = %stats.win_rate(),
        "dip-bot stopped"
    );
    Ok(())
}
