//! Configuration for dip-bot.
//!
//! Supports loading from a TOML file with environment variable overrides.
//! The wallet private key is only ever read from the environment, never
//! from the config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use dip_common::MarketDuration;

/// Environment variable holding the wallet private key for live trading.
pub const PRIVATE_KEY_ENV: &str = "DIP_PRIVATE_KEY";

/// Top-level configuration for dip-bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Trading mode: live or paper.
    pub mode: TradingMode,

    /// Logging level.
    pub log_level: String,

    /// Exchange API endpoints.
    pub api: ApiConfig,

    /// Trading parameters.
    pub trading: TradingConfig,

    /// Risk management parameters.
    pub risk: RiskConfig,

    /// Paper trading parameters.
    pub paper: PaperConfig,

    /// Wallet credentials (environment only).
    pub wallet: WalletConfig,
}

/// Trading mode determines the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    /// Real orders with real money.
    Live,
    /// Real data, simulated execution.
    Paper,
}

impl TradingMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "live" => Some(TradingMode::Live),
            "paper" => Some(TradingMode::Paper),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Exchange API endpoints and feed parameters.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// CLOB REST endpoint.
    pub clob_endpoint: String,

    /// Gamma (market metadata) endpoint.
    pub gamma_endpoint: String,

    /// Chain ID for on-chain settlement (Polygon mainnet).
    pub chain_id: u64,

    /// Whether the detector uses the Binance reference feed.
    pub use_binance: bool,

    /// Maximum age of a cached price before it is considered stale (seconds).
    pub max_price_age_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            clob_endpoint: "https://clob.polymarket.com".to_string(),
            gamma_endpoint: "https://gamma-api.polymarket.com".to_string(),
            chain_id: 137,
            use_binance: true,
            max_price_age_secs: 10,
        }
    }
}

/// Trading parameters for entry decisions and order handling.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Assets to trade.
    pub assets: Vec<String>,

    /// Market window duration.
    pub duration: MarketDuration,

    /// Default share count when sizing is unavailable.
    pub default_shares: u32,

    /// Maximum accepted leg1 + leg2 price sum.
    pub default_sum_target: Decimal,

    /// Dip threshold forwarded to the detector.
    pub default_dip_threshold: Decimal,

    /// Detector lookback window (minutes).
    pub window_minutes: u32,

    /// Maximum cycles entered per market.
    pub max_cycles: u32,

    /// Dump detection window forwarded to the detector (milliseconds).
    pub dump_window_ms: u64,

    /// Prefer maker limit orders for leg 1.
    pub use_maker_orders: bool,

    /// Fall back to a taker market order when the margin covers the fee.
    pub maker_fallback_to_taker: bool,

    /// Exchange taker fee rate (quadratic formula coefficient).
    pub taker_fee_rate: Decimal,

    /// Maximum tolerated bid/ask spread as a fraction of the ask.
    pub max_spread_pct: Decimal,

    /// Timeout for a resting GTC order before it is cancelled (ms).
    pub gtc_fill_timeout_ms: u64,

    /// Interval between order-status polls (ms).
    pub gtc_poll_interval_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            assets: vec!["BTC".to_string()],
            duration: MarketDuration::FifteenMin,
            default_shares: 20,
            default_sum_target: Decimal::new(95, 2),    // 0.95
            default_dip_threshold: Decimal::new(20, 2), // 0.20
            window_minutes: 5,
            max_cycles: 1,
            dump_window_ms: 3000,
            use_maker_orders: true,
            maker_fallback_to_taker: true,
            taker_fee_rate: Decimal::new(625, 4), // 0.0625
            max_spread_pct: Decimal::new(10, 2),  // 0.10
            gtc_fill_timeout_ms: 30_000,
            gtc_poll_interval_ms: 1_000,
        }
    }
}

/// Risk management parameters.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Maximum fraction of balance risked per trade.
    pub max_balance_pct_per_trade: Decimal,

    /// Minimum viable share count (below this, no trade).
    pub min_shares: u32,

    /// Maximum share count per leg.
    pub max_shares: u32,

    /// Consecutive losing cycles before the cooldown trips.
    pub consecutive_loss_limit: u32,

    /// Cooldown after the loss limit trips (minutes).
    pub cooldown_minutes: u64,

    /// Whether the time-based emergency exit is armed.
    pub emergency_enabled: bool,

    /// Liquidate leg 1 this many minutes before expiry if unhedged.
    pub exit_before_expiry_minutes: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_balance_pct_per_trade: Decimal::new(5, 2), // 0.05
            min_shares: 5,
            max_shares: 100,
            consecutive_loss_limit: 3,
            cooldown_minutes: 360,
            emergency_enabled: true,
            exit_before_expiry_minutes: 3,
        }
    }
}

/// Paper trading parameters.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Whether paper mode is the default execution backend.
    pub enabled: bool,

    /// Starting simulated balance (collateral units).
    pub starting_balance: Decimal,

    /// Charge simulated taker fees.
    pub simulate_fees: bool,

    /// Apply the slippage model to simulated fills.
    pub simulate_slippage: bool,

    /// Base slippage fraction.
    pub slippage_pct: Decimal,

    /// JSONL trade journal path.
    pub log_file: Option<PathBuf>,

    /// Record price snapshots to disk.
    pub record_data: bool,

    /// Directory for recorded snapshots.
    pub data_dir: Option<PathBuf>,

    /// Snapshot recording interval (ms).
    pub record_interval_ms: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            starting_balance: Decimal::new(1000, 0),
            simulate_fees: true,
            simulate_slippage: true,
            slippage_pct: Decimal::new(2, 2), // 0.02
            log_file: None,
            record_data: true,
            data_dir: None,
            record_interval_ms: 1000,
        }
    }
}

/// Wallet credentials for live trading. Environment only.
#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    /// Private key, loaded from `DIP_PRIVATE_KEY`. Never in the config file.
    pub private_key: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            log_level: "info".to_string(),
            api: ApiConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            paper: PaperConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

// ============================================================================
// TOML file representation
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    general: TomlGeneral,
    #[serde(default)]
    api: TomlApi,
    #[serde(default)]
    trading: TomlTrading,
    #[serde(default)]
    risk: TomlRisk,
    #[serde(default)]
    paper: TomlPaper,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlGeneral {
    mode: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlApi {
    clob_endpoint: Option<String>,
    gamma_endpoint: Option<String>,
    chain_id: Option<u64>,
    use_binance: Option<bool>,
    max_price_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlTrading {
    assets: Option<Vec<String>>,
    duration: Option<String>,
    default_shares: Option<u32>,
    default_sum_target: Option<f64>,
    default_dip_threshold: Option<f64>,
    window_minutes: Option<u32>,
    max_cycles: Option<u32>,
    dump_window_ms: Option<u64>,
    use_maker_orders: Option<bool>,
    maker_fallback_to_taker: Option<bool>,
    taker_fee_rate: Option<f64>,
    max_spread_pct: Option<f64>,
    gtc_fill_timeout_ms: Option<u64>,
    gtc_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlRisk {
    max_balance_pct_per_trade: Option<f64>,
    min_shares: Option<u32>,
    max_shares: Option<u32>,
    consecutive_loss_limit: Option<u32>,
    cooldown_minutes: Option<u64>,
    emergency_enabled: Option<bool>,
    exit_before_expiry_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TomlPaper {
    enabled: Option<bool>,
    starting_balance: Option<f64>,
    simulate_fees: Option<bool>,
    simulate_slippage: Option<bool>,
    slippage_pct: Option<f64>,
    log_file: Option<PathBuf>,
    record_data: Option<bool>,
    data_dir: Option<PathBuf>,
    record_interval_ms: Option<u64>,
}

/// Convert a TOML float to Decimal, keeping the fallback on conversion loss.
fn dec_or(value: Option<f64>, fallback: Decimal) -> Decimal {
    value.and_then(Decimal::from_f64).unwrap_or(fallback)
}

impl From<TomlConfig> for BotConfig {
    fn from(file: TomlConfig) -> Self {
        let defaults = BotConfig::default();
        let t = defaults.trading;
        let r = defaults.risk;
        let p = defaults.paper;

        let paper_enabled = file.paper.enabled.unwrap_or(p.enabled);
        let mode = file
            .general
            .mode
            .as_deref()
            .and_then(TradingMode::from_str)
            .unwrap_or(if paper_enabled { TradingMode::Paper } else { TradingMode::Live });

        Self {
            mode,
            log_level: file.general.log_level.unwrap_or(defaults.log_level),
            api: ApiConfig {
                clob_endpoint: file.api.clob_endpoint.unwrap_or(defaults.api.clob_endpoint),
                gamma_endpoint: file.api.gamma_endpoint.unwrap_or(defaults.api.gamma_endpoint),
                chain_id: file.api.chain_id.unwrap_or(defaults.api.chain_id),
                use_binance: file.api.use_binance.unwrap_or(defaults.api.use_binance),
                max_price_age_secs: file
                    .api
                    .max_price_age_secs
                    .unwrap_or(defaults.api.max_price_age_secs),
            },
            trading: TradingConfig {
                assets: file.trading.assets.unwrap_or(t.assets),
                duration: file
                    .trading
                    .duration
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(t.duration),
                default_shares: file.trading.default_shares.unwrap_or(t.default_shares),
                default_sum_target: dec_or(file.trading.default_sum_target, t.default_sum_target),
                default_dip_threshold: dec_or(
                    file.trading.default_dip_threshold,
                    t.default_dip_threshold,
                ),
                window_minutes: file.trading.window_minutes.unwrap_or(t.window_minutes),
                max_cycles: file.trading.max_cycles.unwrap_or(t.max_cycles),
                dump_window_ms: file.trading.dump_window_ms.unwrap_or(t.dump_window_ms),
                use_maker_orders: file.trading.use_maker_orders.unwrap_or(t.use_maker_orders),
                maker_fallback_to_taker: file
                    .trading
                    .maker_fallback_to_taker
                    .unwrap_or(t.maker_fallback_to_taker),
                taker_fee_rate: dec_or(file.trading.taker_fee_rate, t.taker_fee_rate),
                max_spread_pct: dec_or(file.trading.max_spread_pct, t.max_spread_pct),
                gtc_fill_timeout_ms: file
                    .trading
                    .gtc_fill_timeout_ms
                    .unwrap_or(t.gtc_fill_timeout_ms),
                gtc_poll_interval_ms: file
                    .trading
                    .gtc_poll_interval_ms
                    .unwrap_or(t.gtc_poll_interval_ms),
            },
            risk: RiskConfig {
                max_balance_pct_per_trade: dec_or(
                    file.risk.max_balance_pct_per_trade,
                    r.max_balance_pct_per_trade,
                ),
                min_shares: file.risk.min_shares.unwrap_or(r.min_shares),
                max_shares: file.risk.max_shares.unwrap_or(r.max_shares),
                consecutive_loss_limit: file
                    .risk
                    .consecutive_loss_limit
                    .unwrap_or(r.consecutive_loss_limit),
                cooldown_minutes: file.risk.cooldown_minutes.unwrap_or(r.cooldown_minutes),
                emergency_enabled: file.risk.emergency_enabled.unwrap_or(r.emergency_enabled),
                exit_before_expiry_minutes: file
                    .risk
                    .exit_before_expiry_minutes
                    .unwrap_or(r.exit_before_expiry_minutes),
            },
            paper: PaperConfig {
                enabled: paper_enabled,
                starting_balance: dec_or(file.paper.starting_balance, p.starting_balance),
                simulate_fees: file.paper.simulate_fees.unwrap_or(p.simulate_fees),
                simulate_slippage: file.paper.simulate_slippage.unwrap_or(p.simulate_slippage),
                slippage_pct: dec_or(file.paper.slippage_pct, p.slippage_pct),
                log_file: file.paper.log_file,
                record_data: file.paper.record_data.unwrap_or(p.record_data),
                data_dir: file.paper.data_dir,
                record_interval_ms: file
                    .paper
                    .record_interval_ms
                    .unwrap_or(p.record_interval_ms),
            },
            wallet: WalletConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for sensitive values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(PRIVATE_KEY_ENV) {
            if !key.is_empty() {
                self.wallet.private_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("DIP_CLOB_ENDPOINT") {
            self.api.clob_endpoint = url;
        }
        if let Ok(url) = std::env::var("DIP_GAMMA_ENDPOINT") {
            self.api.gamma_endpoint = url;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(&mut self, mode: Option<String>, assets: Option<Vec<String>>) {
        if let Some(mode_str) = mode {
            if let Some(m) = TradingMode::from_str(&mode_str) {
                self.mode = m;
            }
        }
        if let Some(asset_list) = assets {
            if !asset_list.is_empty() {
                self.trading.assets = asset_list;
            }
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.mode == TradingMode::Live && self.wallet.private_key.is_none() {
            bail!("Live mode requires the {} environment variable", PRIVATE_KEY_ENV);
        }

        if self.trading.default_sum_target <= Decimal::ZERO
            || self.trading.default_sum_target >= Decimal::ONE
        {
            bail!("default_sum_target must be in (0, 1)");
        }
        if self.trading.taker_fee_rate < Decimal::ZERO {
            bail!("taker_fee_rate must be non-negative");
        }
        if self.trading.max_cycles == 0 {
            bail!("max_cycles must be at least 1");
        }
        if self.trading.gtc_poll_interval_ms == 0 {
            bail!("gtc_poll_interval_ms must be positive");
        }

        if self.risk.max_balance_pct_per_trade <= Decimal::ZERO
            || self.risk.max_balance_pct_per_trade > Decimal::ONE
        {
            bail!("max_balance_pct_per_trade must be in (0, 1]");
        }
        if self.risk.min_shares == 0 {
            bail!("min_shares must be at least 1");
        }
        if self.risk.min_shares > self.risk.max_shares {
            bail!("min_shares cannot exceed max_shares");
        }
        if self.risk.consecutive_loss_limit == 0 {
            bail!("consecutive_loss_limit must be at least 1");
        }

        if self.paper.starting_balance <= Decimal::ZERO {
            bail!("starting_balance must be positive");
        }
        if self.paper.slippage_pct < Decimal::ZERO {
            bail!("slippage_pct must be non-negative");
        }

        if self.trading.assets.is_empty() {
            bail!("At least one asset must be configured");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = BotConfig::default();
        assert_eq!(config.mode, TradingMode::Paper);
        assert_eq!(config.api.chain_id, 137);
        assert!(config.api.use_binance);
        assert_eq!(config.api.max_price_age_secs, 10);
        assert_eq!(config.trading.assets, vec!["BTC".to_string()]);
        assert_eq!(config.trading.duration, MarketDuration::FifteenMin);
        assert_eq!(config.trading.default_shares, 20);
        assert_eq!(config.trading.default_sum_target, dec!(0.95));
        assert_eq!(config.trading.default_dip_threshold, dec!(0.20));
        assert_eq!(config.trading.max_cycles, 1);
        assert_eq!(config.trading.taker_fee_rate, dec!(0.0625));
        assert_eq!(config.trading.gtc_fill_timeout_ms, 30_000);
        assert_eq!(config.trading.gtc_poll_interval_ms, 1_000);
        assert_eq!(config.risk.max_balance_pct_per_trade, dec!(0.05));
        assert_eq!(config.risk.min_shares, 5);
        assert_eq!(config.risk.max_shares, 100);
        assert_eq!(config.risk.consecutive_loss_limit, 3);
        assert_eq!(config.risk.cooldown_minutes, 360);
        assert!(config.risk.emergency_enabled);
        assert_eq!(config.risk.exit_before_expiry_minutes, 3);
        assert_eq!(config.paper.starting_balance, dec!(1000));
        assert_eq!(config.paper.slippage_pct, dec!(0.02));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str() {
        let config = BotConfig::from_toml_str(
            r#"
            [general]
            mode = "paper"
            log_level = "debug"

            [trading]
            assets = ["BTC", "ETH"]
            default_sum_target = 0.93
            use_maker_orders = false

            [risk]
            min_shares = 10
            max_shares = 50

            [paper]
            starting_balance = 2500.0
            simulate_slippage = false
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, TradingMode::Paper);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.trading.assets.len(), 2);
        assert_eq!(config.trading.default_sum_target, dec!(0.93));
        assert!(!config.trading.use_maker_orders);
        assert_eq!(config.risk.min_shares, 10);
        assert_eq!(config.risk.max_shares, 50);
        assert_eq!(config.paper.starting_balance, dec!(2500));
        assert!(!config.paper.simulate_slippage);
        // Untouched groups keep defaults.
        assert_eq!(config.trading.gtc_fill_timeout_ms, 30_000);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = BotConfig::from_toml_str(
            r#"
            [trading]
            no_such_option = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_paper_disabled_selects_live() {
        let config = BotConfig::from_toml_str(
            r#"
            [paper]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, TradingMode::Live);
    }

    #[test]
    fn test_validate_live_requires_private_key() {
        let mut config = BotConfig::default();
        config.mode = TradingMode::Live;
        assert!(config.validate().is_err());

        config.wallet.private_key = Some("0xdeadbeef".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_shares() {
        let mut config = BotConfig::default();
        config.risk.min_shares = 200;
        config.risk.max_shares = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sum_target() {
        let mut config = BotConfig::default();
        config.trading.default_sum_target = dec!(1.05);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = BotConfig::default();
        config.apply_cli_overrides(Some("live".to_string()), Some(vec!["ETH".to_string()]));
        assert_eq!(config.mode, TradingMode::Live);
        assert_eq!(config.trading.assets, vec!["ETH".to_string()]);

        // Empty asset list is ignored.
        config.apply_cli_overrides(None, Some(vec![]));
        assert_eq!(config.trading.assets, vec!["ETH".to_string()]);
    }
}
