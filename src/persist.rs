//! Persistence and telemetry boundary
//!
//! The engine checkpoints position state and emits lifecycle events
//! through a supplied sink. Calls are fire-and-forget from the engine's
//! point of view: a failing sink must never block position progress, and
//! nothing is ever read back synchronously.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::position::Position;

/// Lifecycle events for downstream analytics and notification
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Opened { position_id: Uuid },
    Updated { position_id: Uuid },
    TakeProfitHit { position_id: Uuid, level: u8, sell_pct: f64 },
    StopLossHit { position_id: Uuid, reason: String, pnl_pct: f64 },
    Closed { position_id: Uuid, reason: String, pnl_sol: f64 },
}

/// Checkpoint/telemetry sink supplied by the host process.
#[async_trait]
pub trait PersistSink: Send + Sync {
    /// Persist a position snapshot. Errors are logged and dropped by the
    /// engine, never propagated into the decision path.
    async fn checkpoint(&self, position: &Position) -> Result<()>;

    /// Emit a lifecycle event.
    async fn lifecycle(&self, event: LifecycleEvent);

    /// Fold a late-arriving fill into a position that already closed and
    /// left the live table. Implementations update the persisted record
    /// directly.
    async fn reconcile_closed(&self, position_id: Uuid, tokens_sold: u64, sol_out: f64)
        -> Result<()>;
}
