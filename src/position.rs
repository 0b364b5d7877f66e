//! Position data model
//!
//! A `Position` is owned exclusively by the lifecycle engine while open and
//! mutated only inside its per-position critical section. The serialized
//! shape is the external checkpoint contract; unknown or missing fields
//! must deserialize to safe defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Venue the position was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    #[default]
    PumpFun,
    PumpSwap,
    Raydium,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Venue::PumpFun => write!(f, "pumpfun"),
            Venue::PumpSwap => write!(f, "pumpswap"),
            Venue::Raydium => write!(f, "raydium"),
        }
    }
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    #[default]
    Open,
    PartialClose,
    Closed,
    Stopped,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Stopped)
    }
}

/// Machine-readable reason a position exited (fully or partially)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    BreakevenFloor,
    Timeout,
    NoMomentum,
    Momentum,
    MicroTrailing,
    BuyDrought,
    RugPull,
    AuthorityReenabled,
    CreatorSell,
    CreatorTransfer,
    SellBurst,
    StalePrice,
    Dust,
    Honeypot,
    MaxAttempts,
    StrandedTimeout,
    Recovered,
}

impl ExitReason {
    /// Stable string used in checkpoints and downstream analytics
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::BreakevenFloor => "breakeven_floor",
            ExitReason::Timeout => "timeout",
            ExitReason::NoMomentum => "no_momentum",
            ExitReason::Momentum => "momentum",
            ExitReason::MicroTrailing => "micro_trailing",
            ExitReason::BuyDrought => "buy_drought",
            ExitReason::RugPull => "rug_pull",
            ExitReason::AuthorityReenabled => "authority_reenabled",
            ExitReason::CreatorSell => "creator_sell",
            ExitReason::CreatorTransfer => "creator_transfer",
            ExitReason::SellBurst => "sell_burst",
            ExitReason::StalePrice => "stale_price",
            ExitReason::Dust => "dust",
            ExitReason::Honeypot => "honeypot",
            ExitReason::MaxAttempts => "max_attempts",
            ExitReason::StrandedTimeout => "stranded_timeout",
            ExitReason::Recovered => "recovered",
        }
    }

    /// Reasons that take the emergency sell path
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            ExitReason::RugPull
                | ExitReason::AuthorityReenabled
                | ExitReason::CreatorSell
                | ExitReason::CreatorTransfer
                | ExitReason::SellBurst
                | ExitReason::StalePrice
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution urgency, escalated on each emergency retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    High,
    Critical,
}

impl Urgency {
    pub fn escalate(self) -> Self {
        match self {
            Urgency::Normal => Urgency::High,
            Urgency::High | Urgency::Critical => Urgency::Critical,
        }
    }
}

/// A single position in a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Position id (stable across checkpoints)
    pub id: Uuid,
    /// Token mint address
    pub token: Pubkey,
    /// Liquidity pool address
    pub pool: Pubkey,
    /// Venue the pool lives on
    pub venue: Venue,
    /// Token symbol, for logs only
    #[serde(default)]
    pub symbol: String,
    /// Entry transaction reference
    #[serde(default)]
    pub entry_tx: Option<String>,

    // Economics
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub peak_price: f64,
    pub token_amount_remaining: u64,
    pub sol_invested: f64,
    #[serde(default)]
    pub sol_returned: f64,
    #[serde(default)]
    pub pnl_absolute: f64,
    #[serde(default)]
    pub pnl_pct: f64,

    // Lifecycle
    #[serde(default)]
    pub status: PositionStatus,
    #[serde(default)]
    pub tp_levels_hit: BTreeSet<u8>,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,

    // Risk counters
    #[serde(default)]
    pub sell_attempts: u32,
    #[serde(default)]
    pub sell_successes: u32,
    #[serde(default)]
    pub entry_reserve: Option<u64>,
    #[serde(default)]
    pub current_reserve: Option<u64>,
    #[serde(default)]
    pub sell_burst_count: Option<u64>,
}

impl Position {
    /// Open a new position. Called exactly once per trade.
    pub fn open(
        token: Pubkey,
        pool: Pubkey,
        venue: Venue,
        entry_price: f64,
        token_amount: u64,
        sol_invested: f64,
        entry_reserve: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            pool,
            venue,
            symbol: String::new(),
            entry_tx: None,
            entry_price,
            current_price: entry_price,
            peak_price: entry_price,
            token_amount_remaining: token_amount,
            sol_invested,
            sol_returned: 0.0,
            pnl_absolute: -sol_invested,
            pnl_pct: -100.0,
            status: PositionStatus::Open,
            tp_levels_hit: BTreeSet::new(),
            opened_at: Utc::now(),
            closed_at: None,
            exit_reason: None,
            sell_attempts: 0,
            sell_successes: 0,
            entry_reserve,
            current_reserve: entry_reserve,
            sell_burst_count: None,
        }
    }

    /// Unrealized, price-based PnL percentage (what the stop-loss rules see)
    pub fn price_pnl_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price * 100.0
    }

    /// Current price multiple over entry
    pub fn price_multiple(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.current_price / self.entry_price
    }

    /// Estimated value of the remaining tokens at the current price
    pub fn current_value_sol(&self) -> f64 {
        self.token_amount_remaining as f64 * self.current_price
    }

    /// Seconds since the position opened
    pub fn age_secs(&self) -> u64 {
        (Utc::now() - self.opened_at).num_seconds().max(0) as u64
    }

    /// Drop from peak price, in percent (0 when at or above peak)
    pub fn drop_from_peak_pct(&self) -> f64 {
        if self.peak_price <= 0.0 {
            return 0.0;
        }
        ((self.peak_price - self.current_price) / self.peak_price * 100.0).max(0.0)
    }

    /// Record a new price observation, tracking the peak
    pub fn observe_price(&mut self, price: f64, reserve: Option<u64>) {
        debug_assert!(!self.status.is_terminal(), "price update on terminal position");
        self.current_price = price;
        if price > self.peak_price {
            self.peak_price = price;
        }
        if reserve.is_some() {
            self.current_reserve = reserve;
        }
    }

    /// Apply a confirmed fill. Zero-output results must never reach here;
    /// the caller treats them as failed attempts.
    pub fn apply_fill(&mut self, tokens_sold: u64, sol_out: f64) {
        debug_assert!(sol_out > 0.0 || tokens_sold > 0);
        let sold = tokens_sold.min(self.token_amount_remaining);
        self.token_amount_remaining -= sold;
        self.sol_returned += sol_out;
        self.sell_successes += 1;
        self.recompute_pnl();
    }

    /// Additional realized output discovered after settlement (late racing leg)
    pub fn reconcile_extra_fill(&mut self, tokens_sold: u64, sol_out: f64) {
        let sold = tokens_sold.min(self.token_amount_remaining);
        self.token_amount_remaining -= sold;
        self.sol_returned += sol_out;
        self.recompute_pnl();
    }

    fn recompute_pnl(&mut self) {
        self.pnl_absolute = self.sol_returned - self.sol_invested;
        self.pnl_pct = if self.sol_invested > 0.0 {
            self.pnl_absolute / self.sol_invested * 100.0
        } else {
            0.0
        };
    }

    /// Transition to a terminal state. Idempotent once terminal.
    pub fn close(&mut self, status: PositionStatus, reason: ExitReason) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.exit_reason = Some(reason);
        self.closed_at = Some(Utc::now());
        self.recompute_pnl();
    }

    /// Whether every ladder level has been hit
    pub fn all_levels_hit(&self, ladder_len: usize) -> bool {
        self.tp_levels_hit.len() >= ladder_len
    }
}
