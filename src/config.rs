//! Configuration loading and validation
//!
//! Every numeric threshold in the exit engine is a tunable policy value,
//! not a proven-optimal constant. Defaults reflect what survived live
//! trading on fresh pools; override per deployment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub take_profit: TakeProfitConfig,
    #[serde(default)]
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub smart_exit: SmartExitConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// One rung of the take-profit ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Price multiple over entry that arms this level
    pub multiplier: f64,
    /// Percentage of remaining tokens to sell when it fires
    pub sell_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TakeProfitConfig {
    /// Ladder sorted ascending by multiplier
    #[serde(default = "default_ladder")]
    pub ladder: Vec<TakeProfitLevel>,
    /// Minimum seconds between take-profit sells on one position
    #[serde(default = "default_tp_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Extra cooldown added per consecutive rate-limited TP attempt
    #[serde(default = "default_tp_rate_limit_step_secs")]
    pub rate_limit_step_secs: u64,
    /// Percentage of tokens kept as a moon bag after the final level
    #[serde(default = "default_moon_bag_pct")]
    pub moon_bag_pct: f64,
}

fn default_ladder() -> Vec<TakeProfitLevel> {
    vec![
        TakeProfitLevel { multiplier: 1.5, sell_pct: 50.0 },
        TakeProfitLevel { multiplier: 2.0, sell_pct: 25.0 },
        TakeProfitLevel { multiplier: 3.0, sell_pct: 15.0 },
    ]
}
fn default_tp_cooldown_secs() -> u64 { 20 }
fn default_tp_rate_limit_step_secs() -> u64 { 15 }
fn default_moon_bag_pct() -> f64 { 10.0 }

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            cooldown_secs: default_tp_cooldown_secs(),
            rate_limit_step_secs: default_tp_rate_limit_step_secs(),
            moon_bag_pct: default_moon_bag_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopLossConfig {
    /// Hard stop as PnL percentage (negative)
    #[serde(default = "default_hard_stop_pct")]
    pub hard_stop_pct: f64,
    /// Peak must reach entry * this before the trailing stop arms
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation_multiplier: f64,
    /// Drop-from-peak percentage that triggers the trailing stop
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,
    /// Tighter trail used immediately after the first take-profit
    #[serde(default = "default_post_tp_trailing_pct")]
    pub post_tp_trailing_pct: f64,
    /// Lower activation once only a moon bag remains
    #[serde(default = "default_moon_bag_activation")]
    pub moon_bag_activation_multiplier: f64,
    /// Wider trail for a moon bag (let the residual run)
    #[serde(default = "default_moon_bag_trailing_pct")]
    pub moon_bag_trailing_pct: f64,
    /// Base position timeout in minutes
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Bonus minutes earned per take-profit level hit
    #[serde(default = "default_timeout_bonus_minutes")]
    pub timeout_bonus_minutes_per_level: u64,
    /// Pre-first-level: exit if still below entry after this long
    #[serde(default = "default_no_momentum_below_entry_secs")]
    pub no_momentum_below_entry_secs: u64,
    /// Pre-first-level: exit if still below the stagnant multiplier after this long
    #[serde(default = "default_no_momentum_stagnant_secs")]
    pub no_momentum_stagnant_secs: u64,
    /// Multiplier defining a stagnant grind
    #[serde(default = "default_no_momentum_stagnant_multiplier")]
    pub no_momentum_stagnant_multiplier: f64,
    /// Early-window micro-trailing: window length after open (seconds)
    #[serde(default = "default_micro_trailing_window_secs")]
    pub micro_trailing_window_secs: u64,
    /// Early-window micro-trailing: drop-from-peak that triggers it
    #[serde(default = "default_micro_trailing_drop_pct")]
    pub micro_trailing_drop_pct: f64,
}

fn default_hard_stop_pct() -> f64 { -35.0 }
fn default_trailing_activation() -> f64 { 1.3 }
fn default_trailing_pct() -> f64 { 20.0 }
fn default_post_tp_trailing_pct() -> f64 { 12.0 }
fn default_moon_bag_activation() -> f64 { 1.15 }
fn default_moon_bag_trailing_pct() -> f64 { 30.0 }
fn default_timeout_minutes() -> u64 { 30 }
fn default_timeout_bonus_minutes() -> u64 { 10 }
fn default_no_momentum_below_entry_secs() -> u64 { 180 }
fn default_no_momentum_stagnant_secs() -> u64 { 300 }
fn default_no_momentum_stagnant_multiplier() -> f64 { 1.1 }
fn default_micro_trailing_window_secs() -> u64 { 90 }
fn default_micro_trailing_drop_pct() -> f64 { 35.0 }

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            hard_stop_pct: default_hard_stop_pct(),
            trailing_activation_multiplier: default_trailing_activation(),
            trailing_pct: default_trailing_pct(),
            post_tp_trailing_pct: default_post_tp_trailing_pct(),
            moon_bag_activation_multiplier: default_moon_bag_activation(),
            moon_bag_trailing_pct: default_moon_bag_trailing_pct(),
            timeout_minutes: default_timeout_minutes(),
            timeout_bonus_minutes_per_level: default_timeout_bonus_minutes(),
            no_momentum_below_entry_secs: default_no_momentum_below_entry_secs(),
            no_momentum_stagnant_secs: default_no_momentum_stagnant_secs(),
            no_momentum_stagnant_multiplier: default_no_momentum_stagnant_multiplier(),
            micro_trailing_window_secs: default_micro_trailing_window_secs(),
            micro_trailing_drop_pct: default_micro_trailing_drop_pct(),
        }
    }
}

/// Smart partial exit: at the first take-profit, sell less than the ladder
/// default when enough independent health signals agree.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartExitConfig {
    /// How many of the four confidence signals must pass
    #[serde(default = "default_min_signals")]
    pub min_signals: u32,
    /// Signal 1: reserve grew at least this much since entry (%)
    #[serde(default = "default_reserve_growth_pct")]
    pub reserve_growth_pct: f64,
    /// Signal 2: sell-to-buy ratio in the trailing window at or below this
    #[serde(default = "default_max_sell_buy_ratio")]
    pub max_sell_buy_ratio: f64,
    /// Signal 3: reached the first target within this many seconds
    #[serde(default = "default_max_secs_to_first_target")]
    pub max_secs_to_first_target: u64,
    /// Signal 4: cumulative sells against the pool at or below this
    #[serde(default = "default_max_cumulative_sells")]
    pub max_cumulative_sells: u64,
    /// Hard override: below this position value, always sell the default
    #[serde(default = "default_min_position_value_sol")]
    pub min_position_value_sol: f64,
    /// Sell percentage used when confidence passes
    #[serde(default = "default_reduced_sell_pct")]
    pub reduced_sell_pct: f64,
}

fn default_min_signals() -> u32 { 3 }
fn default_reserve_growth_pct() -> f64 { 10.0 }
fn default_max_sell_buy_ratio() -> f64 { 1.2 }
fn default_max_secs_to_first_target() -> u64 { 120 }
fn default_max_cumulative_sells() -> u64 { 30 }
fn default_min_position_value_sol() -> f64 { 0.05 }
fn default_reduced_sell_pct() -> f64 { 25.0 }

impl Default for SmartExitConfig {
    fn default() -> Self {
        Self {
            min_signals: default_min_signals(),
            reserve_growth_pct: default_reserve_growth_pct(),
            max_sell_buy_ratio: default_max_sell_buy_ratio(),
            max_secs_to_first_target: default_max_secs_to_first_target(),
            max_cumulative_sells: default_max_cumulative_sells(),
            min_position_value_sol: default_min_position_value_sol(),
            reduced_sell_pct: default_reduced_sell_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Base poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Hard bound on any single reserve read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Fast-poll frequency multiplier while a token is under suspicion
    #[serde(default = "default_fast_poll_multiplier")]
    pub fast_poll_multiplier: u32,
    /// How long fast-poll mode lasts before reverting
    #[serde(default = "default_fast_poll_duration_secs")]
    pub fast_poll_duration_secs: u64,
    /// Cumulative drop from entry that switches on fast-poll (%)
    #[serde(default = "default_fast_poll_trigger_drop_pct")]
    pub fast_poll_trigger_drop_pct: f64,
    /// Cumulative drop from entry that fires a rug signal (%)
    #[serde(default = "default_rug_drop_pct")]
    pub rug_drop_pct: f64,
    /// Single-tick drop that fires an instant rug signal (%)
    #[serde(default = "default_instant_drop_pct")]
    pub instant_drop_pct: f64,
    /// Constant-product (K) drop that fires a rug signal (%)
    #[serde(default = "default_k_drop_pct")]
    pub k_drop_pct: f64,
    /// Readings with either reserve below this are rejected as failures
    #[serde(default = "default_min_reserve_units")]
    pub min_reserve_units: u64,
    /// Reject a price more than this multiple of the previous tick
    #[serde(default = "default_max_price_jump")]
    pub max_price_jump: f64,
    /// Reject a price less than this fraction of the previous tick
    #[serde(default = "default_min_price_jump")]
    pub min_price_jump: f64,
    /// Re-check mint/freeze authority every Nth tick
    #[serde(default = "default_authority_recheck_ticks")]
    pub authority_recheck_ticks: u32,
}

fn default_poll_interval_ms() -> u64 { 3000 }
fn default_read_timeout_ms() -> u64 { 5_000 }
fn default_fast_poll_multiplier() -> u32 { 4 }
fn default_fast_poll_duration_secs() -> u64 { 30 }
fn default_fast_poll_trigger_drop_pct() -> f64 { 5.0 }
fn default_rug_drop_pct() -> f64 { 20.0 }
fn default_instant_drop_pct() -> f64 { 50.0 }
fn default_k_drop_pct() -> f64 { 3.0 }
fn default_min_reserve_units() -> u64 { 1_000 }
fn default_max_price_jump() -> f64 { 50.0 }
fn default_min_price_jump() -> f64 { 0.02 }
fn default_authority_recheck_ticks() -> u32 { 20 }

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            fast_poll_multiplier: default_fast_poll_multiplier(),
            fast_poll_duration_secs: default_fast_poll_duration_secs(),
            fast_poll_trigger_drop_pct: default_fast_poll_trigger_drop_pct(),
            rug_drop_pct: default_rug_drop_pct(),
            instant_drop_pct: default_instant_drop_pct(),
            k_drop_pct: default_k_drop_pct(),
            min_reserve_units: default_min_reserve_units(),
            max_price_jump: default_max_price_jump(),
            min_price_jump: default_min_price_jump(),
            authority_recheck_ticks: default_authority_recheck_ticks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Rolling window for sell counting (seconds)
    #[serde(default = "default_sell_burst_window_secs")]
    pub sell_burst_window_secs: u64,
    /// Sells within the window that count as a burst
    #[serde(default = "default_sell_burst_threshold")]
    pub sell_burst_threshold: usize,
    /// Cool-down after a burst alarm before re-alarming (seconds)
    #[serde(default = "default_burst_cooldown_secs")]
    pub burst_cooldown_secs: u64,
    /// Rolling window for buy counting / buy-sell ratio (seconds)
    #[serde(default = "default_buy_window_secs")]
    pub buy_window_secs: u64,
}

fn default_sell_burst_window_secs() -> u64 { 15 }
fn default_sell_burst_threshold() -> usize { 8 }
fn default_burst_cooldown_secs() -> u64 { 30 }
fn default_buy_window_secs() -> u64 { 30 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sell_burst_window_secs: default_sell_burst_window_secs(),
            sell_burst_threshold: default_sell_burst_threshold(),
            burst_cooldown_secs: default_burst_cooldown_secs(),
            buy_window_secs: default_buy_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Price/reserve data is not trusted for a position younger than this
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Consecutive failed/zero readings before a stale emergency exit
    #[serde(default = "default_stale_miss_threshold")]
    pub stale_miss_threshold: u32,
    /// Extra misses credited when an in-grace confirmation fetch fails
    #[serde(default = "default_stale_accel_misses")]
    pub stale_accel_misses: u32,
    /// Below this estimated value, close as dust instead of selling
    #[serde(default = "default_dust_threshold_sol")]
    pub dust_threshold_sol: f64,
    /// Sell-to-buy ratio that forces a momentum exit
    #[serde(default = "default_momentum_sell_buy_ratio")]
    pub momentum_sell_buy_ratio: f64,
    /// Minimum windowed sells before the momentum ratio is meaningful
    #[serde(default = "default_momentum_min_sells")]
    pub momentum_min_sells: usize,
    /// Buy drought: no buys for this long while sells keep printing
    #[serde(default = "default_drought_window_secs")]
    pub drought_window_secs: u64,
    /// Buy drought: minimum windowed sells to count as one-sided
    #[serde(default = "default_drought_min_sells")]
    pub drought_min_sells: usize,
    /// Tightened trail applied under a buy drought (%)
    #[serde(default = "default_drought_trailing_pct")]
    pub drought_trailing_pct: f64,
}

fn default_grace_period_secs() -> u64 { 60 }
fn default_stale_miss_threshold() -> u32 { 4 }
fn default_stale_accel_misses() -> u32 { 2 }
fn default_dust_threshold_sol() -> f64 { 0.001 }
fn default_momentum_sell_buy_ratio() -> f64 { 3.0 }
fn default_momentum_min_sells() -> usize { 10 }
fn default_drought_window_secs() -> u64 { 45 }
fn default_drought_min_sells() -> usize { 5 }
fn default_drought_trailing_pct() -> f64 { 8.0 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            stale_miss_threshold: default_stale_miss_threshold(),
            stale_accel_misses: default_stale_accel_misses(),
            dust_threshold_sol: default_dust_threshold_sol(),
            momentum_sell_buy_ratio: default_momentum_sell_buy_ratio(),
            momentum_min_sells: default_momentum_min_sells(),
            drought_window_secs: default_drought_window_secs(),
            drought_min_sells: default_drought_min_sells(),
            drought_trailing_pct: default_drought_trailing_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Absolute attempt cap per position, independent of failure reason
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Higher ceiling for rate-limited attempts (recoverable)
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Fixed cooldown after a rate-limit failure
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Fast retries allowed on a pool-drained failure before giving up
    #[serde(default = "default_pool_drained_retries")]
    pub pool_drained_retries: u32,
    #[serde(default = "default_pool_drained_delay_ms")]
    pub pool_drained_delay_ms: u64,
    /// Flat delay between emergency sell retries
    #[serde(default = "default_emergency_retry_delay_ms")]
    pub emergency_retry_delay_ms: u64,
    /// Exponential backoff base for everything else
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-operation sell timeout
    #[serde(default = "default_sell_timeout_secs")]
    pub sell_timeout_secs: u64,
    /// Bounded wait when racing two execution legs
    #[serde(default = "default_race_timeout_secs")]
    pub race_timeout_secs: u64,
    /// Stranded recovery: fixed retry interval
    #[serde(default = "default_stranded_retry_interval_secs")]
    pub stranded_retry_interval_secs: u64,
    /// Stranded recovery: total bound before force-close
    #[serde(default = "default_stranded_max_duration_secs")]
    pub stranded_max_duration_secs: u64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_max_rate_limit_retries() -> u32 { 15 }
fn default_rate_limit_cooldown_secs() -> u64 { 30 }
fn default_pool_drained_retries() -> u32 { 2 }
fn default_pool_drained_delay_ms() -> u64 { 500 }
fn default_emergency_retry_delay_ms() -> u64 { 2_000 }
fn default_backoff_base_ms() -> u64 { 1_000 }
fn default_backoff_cap_ms() -> u64 { 30_000 }
fn default_sell_timeout_secs() -> u64 { 30 }
fn default_race_timeout_secs() -> u64 { 15 }
fn default_stranded_retry_interval_secs() -> u64 { 45 }
fn default_stranded_max_duration_secs() -> u64 { 300 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            pool_drained_retries: default_pool_drained_retries(),
            pool_drained_delay_ms: default_pool_drained_delay_ms(),
            emergency_retry_delay_ms: default_emergency_retry_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            sell_timeout_secs: default_sell_timeout_secs(),
            race_timeout_secs: default_race_timeout_secs(),
            stranded_retry_interval_secs: default_stranded_retry_interval_secs(),
            stranded_max_duration_secs: default_stranded_max_duration_secs(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix EXITGUARD_)
            .add_source(
                config::Environment::with_prefix("EXITGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.take_profit.ladder.is_empty() {
            anyhow::bail!("Take-profit ladder must have at least one level");
        }
        let mut prev = 1.0;
        for level in &self.take_profit.ladder {
            if level.multiplier <= prev {
                anyhow::bail!(
                    "Take-profit ladder must be sorted ascending above 1.0, got {}",
                    level.multiplier
                );
            }
            if level.sell_pct <= 0.0 || level.sell_pct > 100.0 {
                anyhow::bail!("Take-profit sell_pct must be in (0, 100], got {}", level.sell_pct);
            }
            prev = level.multiplier;
        }
        if self.stop_loss.hard_stop_pct >= 0.0 {
            anyhow::bail!(
                "hard_stop_pct must be negative (a loss), got {}",
                self.stop_loss.hard_stop_pct
            );
        }
        if self.feed.rug_drop_pct <= self.feed.fast_poll_trigger_drop_pct {
            anyhow::bail!("rug_drop_pct must exceed fast_poll_trigger_drop_pct");
        }
        if !(0.0..=100.0).contains(&self.take_profit.moon_bag_pct) {
            anyhow::bail!("moon_bag_pct must be in [0, 100]");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.feed.fast_poll_multiplier == 0 {
            anyhow::bail!("fast_poll_multiplier must be at least 1");
        }
        if self.feed.read_timeout_ms == 0 {
            anyhow::bail!("read_timeout_ms must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.take_profit.ladder.len(), 3);
        assert_eq!(config.feed.rug_drop_pct, 20.0);
        assert_eq!(config.monitor.sell_burst_threshold, 8);
    }

    #[test]
    fn test_unsorted_ladder_rejected() {
        let mut config = Config::default();
        config.take_profit.ladder = vec![
            TakeProfitLevel { multiplier: 2.0, sell_pct: 50.0 },
            TakeProfitLevel { multiplier: 1.5, sell_pct: 25.0 },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_positive_hard_stop_rejected() {
        let mut config = Config::default();
        config.stop_loss.hard_stop_pct = 35.0;
        assert!(config.validate().is_err());
    }
}
