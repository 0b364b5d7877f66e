//! Stranded recovery
//!
//! A position that exhausted its attempt cap with zero successful sells
//! still holds tokens that might become sellable again (RPC outage over,
//! congestion cleared, liquidity momentarily back). Recovery is a
//! background drumbeat: one retry per fixed interval, bounded in total
//! duration, after which the position is force-closed as a realized loss.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::EngineEvent;

/// Spawn the recovery drumbeat for one stranded position. Each tick asks
/// the engine to try one more sell; the deadline event fires exactly once
/// and ends recovery regardless of any attempt still in flight.
pub(super) fn spawn_recovery_timer(
    events_tx: mpsc::Sender<EngineEvent>,
    id: Uuid,
    retry_interval: Duration,
    max_duration: Duration,
) {
    info!(position = %id, interval = ?retry_interval, bound = ?max_duration,
        "Entering stranded recovery");
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::time::sleep(retry_interval).await;
            if started.elapsed() >= max_duration {
                let _ = events_tx.send(EngineEvent::StrandedDeadline { id }).await;
                return;
            }
            if events_tx.send(EngineEvent::StrandedTick { id }).await.is_err() {
                debug!(position = %id, "Engine gone, stopping recovery timer");
                return;
            }
        }
    });
}

/// Schedule a single retry wake-up after `delay`.
pub(super) fn spawn_retry_timer(events_tx: mpsc::Sender<EngineEvent>, id: Uuid, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events_tx.send(EngineEvent::RetryDue { id }).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recovery_ticks_then_deadline() {
        let (tx, mut rx) = mpsc::channel(16);
        let id = Uuid::new_v4();
        spawn_recovery_timer(
            tx,
            id,
            Duration::from_millis(10),
            Duration::from_millis(45),
        );

        let mut ticks = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(EngineEvent::StrandedTick { id: got })) => {
                    assert_eq!(got, id);
                    ticks += 1;
                }
                Ok(Some(EngineEvent::StrandedDeadline { id: got })) => {
                    assert_eq!(got, id);
                    break;
                }
                other => panic!("unexpected: {:?}", other.map(|o| o.is_some())),
            }
        }
        assert!(ticks >= 2, "expected a few ticks before the deadline, got {}", ticks);
        // Deadline fires exactly once; channel then goes quiet
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_retry_timer_fires_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let id = Uuid::new_v4();
        spawn_retry_timer(tx, id, Duration::from_millis(5));
        match rx.recv().await.unwrap() {
            EngineEvent::RetryDue { id: got } => assert_eq!(got, id),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(30), rx.recv())
                .await
                .is_err()
        );
    }
}
