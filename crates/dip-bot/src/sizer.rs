//! Position sizing with a consecutive-loss circuit breaker.
//!
//! Sizing is balance-proportional with hard share bounds and a 95%
//! safety rail on total cost. The breaker counts consecutive losing
//! cycles; at the configured limit trading pauses for a cooldown, after
//! which the streak resets and trading resumes.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;

/// Never spend more than this fraction of balance on a single leg.
const BALANCE_SAFETY_RAIL: Decimal = dec!(0.95);

/// Configuration for the position sizer.
#[derive(Debug, Clone)]
pub struct SizerConfig {
    /// Maximum fraction of balance risked per trade.
    pub max_balance_pct: Decimal,

    /// Minimum viable share count; smaller results become zero.
    pub min_shares: u32,

    /// Maximum share count per leg.
    pub max_shares: u32,

    /// Consecutive losing cycles before trading pauses.
    pub consecutive_loss_limit: u32,

    /// Pause duration after the limit trips (minutes).
    pub cooldown_minutes: u64,
}

impl SizerConfig {
    pub fn from_risk_config(risk: &RiskConfig) -> Self {
        Self {
            max_balance_pct: risk.max_balance_pct_per_trade,
            min_shares: risk.min_shares,
            max_shares: risk.max_shares,
            consecutive_loss_limit: risk.consecutive_loss_limit,
            cooldown_minutes: risk.cooldown_minutes,
        }
    }
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self::from_risk_config(&RiskConfig::default())
    }
}

/// Balance-proportional position sizer.
///
/// Owns the consecutive-loss counter and the cooldown deadline; nothing
/// else mutates them.
#[derive(Debug)]
pub struct PositionSizer {
    config: SizerConfig,
    consecutive_losses: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl PositionSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self {
            config,
            consecutive_losses: 0,
            cooldown_until: None,
        }
    }

    /// Current consecutive losing streak.
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    /// Share count for a leg-1 buy, or zero for no trade.
    ///
    /// Result is either zero or within [min_shares, max_shares] with
    /// total cost at most 95% of balance.
    pub fn calculate_shares(&mut self, balance: Decimal, leg1_price: Decimal) -> Decimal {
        self.calculate_shares_at(balance, leg1_price, Utc::now())
    }

    /// Share count relative to an explicit clock.
    pub fn calculate_shares_at(
        &mut self,
        balance: Decimal,
        leg1_price: Decimal,
        now: DateTime<Utc>,
    ) -> Decimal {
        if self.is_trading_paused_at(now) {
            debug!("Sizer paused, no shares");
            return Decimal::ZERO;
        }
        if leg1_price <= Decimal::ZERO || balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let max_risk = balance * self.config.max_balance_pct;
        let mut qty = (max_risk / leg1_price).floor();

        qty = qty.min(Decimal::from(self.config.max_shares));

        let rail = balance * BALANCE_SAFETY_RAIL;
        if qty * leg1_price > rail {
            qty = (rail / leg1_price).floor();
        }

        if qty < Decimal::from(self.config.min_shares) {
            debug!(%qty, min_shares = self.config.min_shares, "Below minimum share count, no trade");
            return Decimal::ZERO;
        }

        qty
    }

    /// Feed a completed cycle's profit into the breaker.
    pub fn record_result(&mut self, profit: Decimal) {
        self.record_result_at(profit, Utc::now());
    }

    /// Feed a result relative to an explicit clock.
    pub fn record_result_at(&mut self, profit: Decimal, now: DateTime<Utc>) {
        if profit < Decimal::ZERO {
            self.consecutive_losses += 1;
            debug!(
                losses = self.consecutive_losses,
                limit = self.config.consecutive_loss_limit,
                "Losing cycle recorded"
            );
            if self.consecutive_losses >= self.config.consecutive_loss_limit {
                let until = now + Duration::minutes(self.config.cooldown_minutes as i64);
                self.cooldown_until = Some(until);
                warn!(
                    losses = self.consecutive_losses,
                    cooldown_minutes = self.config.cooldown_minutes,
                    until = %until,
                    "Loss limit hit, trading paused"
                );
            }
        } else {
            self.consecutive_losses = 0;
        }
    }

    /// True only while the cooldown deadline is in the future.
    ///
    /// An elapsed cooldown resets the sizer to unpaused and clears the
    /// loss streak.
    pub fn is_trading_paused(&mut self) -> bool {
        self.is_trading_paused_at(Utc::now())
    }

    /// Pause check relative to an explicit clock.
    pub fn is_trading_paused_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Cooldown elapsed, trading resumed");
                self.cooldown_until = None;
                self.consecutive_losses = 0;
                false
            }
            None => false,
        }
    }

    /// Remaining cooldown, if paused.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.cooldown_until?;
        let remaining = until - Utc::now();
        (remaining > Duration::zero()).then_some(remaining)
    }
}
