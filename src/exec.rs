//! Execution boundary
//!
//! The engine never builds or submits transactions itself; it calls a
//! supplied [`Executor`]. An implementation may internally race multiple
//! venues, but the engine also supports racing two executors explicitly
//! (see `engine::sell`). Implementations must report a confirmed
//! transaction that realized zero output distinctly from a hard failure
//! (`Error::ZeroOutput`), and must be safe to call repeatedly.

use async_trait::async_trait;
use solana_sdk::native_token::LAMPORTS_PER_SOL;
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

use crate::error::Result;
use crate::position::{Urgency, Venue};

/// A sell attempt handed to the execution boundary
#[derive(Debug, Clone)]
pub struct SellRequest {
    pub position_id: Uuid,
    pub token: Pubkey,
    pub pool: Pubkey,
    pub venue: Venue,
    /// Token amount to sell, in raw units
    pub amount: u64,
    /// Skip simulation-based sizing and use the fast path
    pub emergency: bool,
    /// Escalated on each emergency retry
    pub urgency: Urgency,
}

/// A buy order (used by stranded-recovery probes and re-entries)
#[derive(Debug, Clone)]
pub struct BuyOrder {
    pub token: Pubkey,
    pub pool: Pubkey,
    pub venue: Venue,
    pub sol_amount: f64,
    pub urgency: Urgency,
}

/// Outcome of a swap that confirmed on chain
#[derive(Debug, Clone, PartialEq)]
pub struct SwapReceipt {
    /// Token units actually consumed (may be less than requested)
    pub realized_input: u64,
    /// Lamports actually received
    pub realized_output: u64,
    /// Effective execution price in SOL per token
    pub execution_price: f64,
    /// Fees paid, in lamports
    pub fee: u64,
    /// Transaction reference, when known
    pub tx_ref: Option<String>,
}

impl SwapReceipt {
    /// Realized output in SOL
    pub fn sol_output(&self) -> f64 {
        self.realized_output as f64 / LAMPORTS_PER_SOL as f64
    }
}

/// Asynchronous swap execution supplied by the host process.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Attempt to sell. `Ok` means the transaction confirmed with non-zero
    /// output; a confirmed-but-void fill must come back as
    /// `Err(Error::ZeroOutput)`, an unknown outcome as
    /// `Err(Error::AmbiguousOutcome)`.
    async fn sell(&self, request: &SellRequest) -> Result<SwapReceipt>;

    /// Attempt to buy. Same result contract as `sell`.
    async fn buy(&self, order: &BuyOrder) -> Result<SwapReceipt>;

    /// Post-hoc resolution of an ambiguous outcome: transaction status
    /// lookup, then wallet-balance verification. `Ok(None)` means the
    /// transaction never landed and the attempt may be retried.
    async fn resolve(&self, token: Pubkey, tx_ref: &str) -> Result<Option<SwapReceipt>>;
}
