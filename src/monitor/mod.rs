//! On-chain activity monitors
//!
//! Two independent, push-based watchers over log subscriptions: one per
//! pool (remove-liquidity, sell bursts, buy/sell windows) and one per
//! privileged wallet (creator selling or moving tokens). Both are
//! best-effort: a failed subscription is logged and ignored because the
//! polling feed still catches the same rugs, slower.
//!
//! Delivery contract: raw logs for a given pool or wallet arrive on one
//! channel and are processed in arrival order; monitor events are pushed
//! into the engine's single event queue in the order they were detected.

pub mod pool;
pub mod wallet;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;

use crate::error::Result;

pub use pool::{PoolMonitor, PoolSnapshot};
pub use wallet::WalletMonitor;

/// Opaque subscription handle owned by the subscriber boundary
pub type SubscriptionId = u64;

/// Raw transaction classification for a pool log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTxKind {
    Buy,
    Sell,
    RemoveLiquidity,
}

/// One decoded log line touching a monitored pool
#[derive(Debug, Clone)]
pub struct PoolLogEvent {
    pub pool: Pubkey,
    pub kind: PoolTxKind,
}

/// Raw activity classification for a watched wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletTxKind {
    /// Creator sold into the pool
    PoolSell,
    /// Creator moved tokens to another wallet
    TokenTransfer,
    /// Creator closed a token account
    AccountClose,
}

/// One decoded log line from a watched wallet
#[derive(Debug, Clone)]
pub struct WalletLogEvent {
    pub wallet: Pubkey,
    pub kind: WalletTxKind,
}

/// Alerts the monitors push into the engine
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Remove-liquidity instruction seen. Always critical.
    LiquidityRemoved { pool: Pubkey },
    /// Sell count in the rolling window crossed the burst threshold
    SellBurst { pool: Pubkey, sells_in_window: usize },
    /// Creator sold into the pool. Critical.
    CreatorSell { wallet: Pubkey },
    /// Creator moved tokens out. Critical: the classic pre-dump shuffle.
    CreatorTransfer { wallet: Pubkey },
    /// Creator closed an account. Informational only.
    CreatorAccountClose { wallet: Pubkey },
}

/// Log-subscription boundary supplied by the host process.
#[async_trait]
pub trait ActivitySubscriber: Send + Sync {
    /// Subscribe to logs touching a pool; decoded events are delivered in
    /// arrival order on `tx`.
    async fn subscribe_pool(
        &self,
        pool: Pubkey,
        tx: mpsc::Sender<PoolLogEvent>,
    ) -> Result<SubscriptionId>;

    /// Subscribe to activity from a wallet.
    async fn subscribe_wallet(
        &self,
        wallet: Pubkey,
        tx: mpsc::Sender<WalletLogEvent>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId);
}
