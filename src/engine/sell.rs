//! Sell attempt execution
//!
//! One attempt is one spawned task: it runs one or two execution legs,
//! waits a bounded time, and reports a single settled outcome back into
//! the engine queue. Emergencies with a fallback executor race both legs;
//! a leg still pending at the deadline is abandoned but keeps running,
//! and any fill it eventually lands comes back as a `LateFill` for
//! reconciliation. The zero-output rule is enforced here: a confirmed
//! swap that realized nothing is a failed attempt, full stop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exec::{Executor, SellRequest, SwapReceipt};
use crate::position::ExitReason;

use super::EngineEvent;

/// What a sell cycle is trying to accomplish. Held by the engine for the
/// whole cycle, across every retry of the same intent.
#[derive(Debug, Clone)]
pub(super) struct SellIntent {
    pub reason: ExitReason,
    /// Token units to sell
    pub requested: u64,
    pub emergency: bool,
    /// Ladder level committed optimistically; rolled back on failure
    pub tp_level: Option<u8>,
    /// The position should be terminal once this intent fully settles
    pub close_after: bool,
}

/// Settled result of one attempt
#[derive(Debug)]
pub(crate) enum SellOutcome {
    Filled {
        tokens_sold: u64,
        sol_out: f64,
        /// How many legs confirmed a fill (2 means a double execution)
        legs: u8,
    },
    Failed(Error),
}

/// Spawn one sell attempt. The task reports via `SellSettled`; it never
/// touches position state itself.
pub(super) fn spawn_attempt(
    primary: Arc<dyn Executor>,
    fallback: Option<Arc<dyn Executor>>,
    request: SellRequest,
    attempt_timeout: Duration,
    events_tx: mpsc::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        let id = request.position_id;
        let outcome =
            run_attempt(primary, fallback, request, attempt_timeout, events_tx.clone()).await;
        let _ = events_tx.send(EngineEvent::SellSettled { id, outcome }).await;
    });
}

async fn run_attempt(
    primary: Arc<dyn Executor>,
    fallback: Option<Arc<dyn Executor>>,
    request: SellRequest,
    attempt_timeout: Duration,
    events_tx: mpsc::Sender<EngineEvent>,
) -> SellOutcome {
    let (leg_tx, mut leg_rx) = mpsc::channel::<Result<SwapReceipt>>(2);

    let mut legs: u8 = 1;
    spawn_leg(primary, request.clone(), leg_tx.clone());
    if request.emergency {
        if let Some(fb) = fallback {
            spawn_leg(fb, request.clone(), leg_tx.clone());
            legs = 2;
        }
    }
    drop(leg_tx);

    let deadline = Instant::now() + attempt_timeout;
    let mut fills: Vec<SwapReceipt> = Vec::new();
    let mut last_error: Option<Error> = None;
    let mut reported: u8 = 0;

    while reported < legs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, leg_rx.recv()).await {
            Ok(Some(Ok(receipt))) => {
                fills.push(receipt);
                reported += 1;
            }
            Ok(Some(Err(e))) => {
                last_error = Some(e);
                reported += 1;
            }
            // Every sender dropped: all legs are accounted for
            Ok(None) => break,
            // Deadline: abandon whatever is still pending
            Err(_) => break,
        }
    }

    let pending = legs - reported;
    if pending > 0 {
        // The abandoned leg keeps running; its eventual fill must not be
        // lost or the books stop matching the wallet.
        let id = request.position_id;
        let late_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = leg_rx.recv().await {
                if let Ok(receipt) = result {
                    warn!(position = %id, sol = receipt.sol_output(),
                        "Abandoned leg landed a fill after the deadline");
                    let _ = late_tx
                        .send(EngineEvent::LateFill {
                            id,
                            tokens_sold: receipt.realized_input,
                            sol_out: receipt.sol_output(),
                        })
                        .await;
                }
            }
        });
    }

    match fills.len() {
        0 => {
            let error = match last_error {
                Some(e) => e,
                // No leg reported anything before the deadline
                None => Error::AmbiguousOutcome { tx_ref: None },
            };
            SellOutcome::Failed(error)
        }
        1 => {
            let receipt = &fills[0];
            SellOutcome::Filled {
                tokens_sold: receipt.realized_input,
                sol_out: receipt.sol_output(),
                legs: 1,
            }
        }
        _ => {
            // Both legs landed. All received SOL is real and is summed; the
            // token debit is the larger claimed input, and the position caps
            // it at the pre-sell balance when applied.
            let sol_out: f64 = fills.iter().map(|r| r.sol_output()).sum();
            let tokens_sold = fills.iter().map(|r| r.realized_input).max().unwrap_or(0);
            warn!(position = %request.position_id, sol = sol_out,
                "Both racing legs executed, reconciling");
            SellOutcome::Filled { tokens_sold, sol_out, legs: 2 }
        }
    }
}

fn spawn_leg(
    executor: Arc<dyn Executor>,
    request: SellRequest,
    tx: mpsc::Sender<Result<SwapReceipt>>,
) {
    tokio::spawn(async move {
        let result = execute_leg(&*executor, &request).await;
        if tx.send(result).await.is_err() {
            debug!(position = %request.position_id, "Leg result receiver gone");
        }
    });
}

/// Run one leg end to end, including ambiguity resolution. The zero-output
/// rule lives here: `Ok` from this function always means SOL was received.
async fn execute_leg(executor: &dyn Executor, request: &SellRequest) -> Result<SwapReceipt> {
    match executor.sell(request).await {
        Ok(receipt) if receipt.realized_output == 0 => {
            Err(Error::ZeroOutput(receipt.tx_ref.clone().unwrap_or_default()))
        }
        Ok(receipt) => Ok(receipt),
        Err(Error::AmbiguousOutcome { tx_ref: Some(tx_ref) }) => {
            // Unknown outcome with a known signature: status lookup, then
            // balance verification, before the attempt may be retried.
            match executor.resolve(request.token, &tx_ref).await {
                Ok(Some(receipt)) if receipt.realized_output > 0 => Ok(receipt),
                Ok(Some(_)) => Err(Error::ZeroOutput(tx_ref)),
                Ok(None) => Err(Error::Execution(format!(
                    "transaction {} never landed",
                    tx_ref
                ))),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}
