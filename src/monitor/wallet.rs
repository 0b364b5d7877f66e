//! Creator wallet monitor
//!
//! Watches the wallet that created a pool we hold a position in. A creator
//! selling into the pool is critical. So is a plain token transfer:
//! creators evade sell detection by moving the stash to a fresh wallet
//! before dumping. Account closes are informational only.

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ActivitySubscriber, MonitorEvent, SubscriptionId, WalletLogEvent, WalletTxKind};

/// Push-based monitor over creator wallet subscriptions
pub struct WalletMonitor {
    subscriber: Arc<dyn ActivitySubscriber>,
    subscriptions: DashMap<Pubkey, SubscriptionId>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl WalletMonitor {
    pub fn new(
        subscriber: Arc<dyn ActivitySubscriber>,
        events_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            subscriber,
            subscriptions: DashMap::new(),
            events_tx,
        }
    }

    /// Start watching a creator wallet. Best-effort, like the pool monitor.
    pub async fn track_wallet(&self, wallet: Pubkey) {
        if self.subscriptions.contains_key(&wallet) {
            return;
        }

        let (log_tx, mut log_rx) = mpsc::channel::<WalletLogEvent>(64);
        match self.subscriber.subscribe_wallet(wallet, log_tx).await {
            Ok(id) => {
                self.subscriptions.insert(wallet, id);
                info!(wallet = %wallet, subscription = id, "Creator monitor attached");
            }
            Err(e) => {
                warn!(wallet = %wallet, error = %e, "Creator subscription failed, relying on polling");
                return;
            }
        }

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = log_rx.recv().await {
                if let Some(alert) = classify(&event) {
                    if events_tx.send(alert).await.is_err() {
                        debug!(wallet = %wallet, "Engine event channel closed");
                        return;
                    }
                }
            }
            debug!(wallet = %wallet, "Creator log stream ended");
        });
    }

    /// Stop watching a creator wallet.
    pub async fn untrack_wallet(&self, wallet: &Pubkey) {
        if let Some((_, id)) = self.subscriptions.remove(wallet) {
            self.subscriber.unsubscribe(id).await;
            info!(wallet = %wallet, "Creator monitor detached");
        }
    }

    /// Direct injection for hosts that demultiplex their own log stream.
    pub async fn ingest(&self, event: WalletLogEvent) {
        if let Some(alert) = classify(&event) {
            let _ = self.events_tx.send(alert).await;
        }
    }
}

fn classify(event: &WalletLogEvent) -> Option<MonitorEvent> {
    match event.kind {
        WalletTxKind::PoolSell => {
            warn!(wallet = %event.wallet, "CREATOR SELLING");
            Some(MonitorEvent::CreatorSell { wallet: event.wallet })
        }
        WalletTxKind::TokenTransfer => {
            warn!(wallet = %event.wallet, "Creator moved tokens out");
            Some(MonitorEvent::CreatorTransfer { wallet: event.wallet })
        }
        WalletTxKind::AccountClose => {
            debug!(wallet = %event.wallet, "Creator closed a token account");
            Some(MonitorEvent::CreatorAccountClose { wallet: event.wallet })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    struct FailingSubscriber;

    #[async_trait]
    impl ActivitySubscriber for FailingSubscriber {
        async fn subscribe_pool(
            &self,
            _pool: Pubkey,
            _tx: mpsc::Sender<super::super::PoolLogEvent>,
        ) -> Result<SubscriptionId> {
            Err(Error::Subscription("ws down".into()))
        }
        async fn subscribe_wallet(
            &self,
            _wallet: Pubkey,
            _tx: mpsc::Sender<WalletLogEvent>,
        ) -> Result<SubscriptionId> {
            Err(Error::Subscription("ws down".into()))
        }
        async fn unsubscribe(&self, _id: SubscriptionId) {}
    }

    #[tokio::test]
    async fn test_subscription_failure_is_non_fatal() {
        let (tx, _rx) = mpsc::channel(8);
        let monitor = WalletMonitor::new(Arc::new(FailingSubscriber), tx);
        // Must not panic or error; polling covers the gap
        monitor.track_wallet(Pubkey::new_unique()).await;
        assert!(monitor.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_classification() {
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = WalletMonitor::new(Arc::new(FailingSubscriber), tx);
        let wallet = Pubkey::new_unique();

        monitor
            .ingest(WalletLogEvent { wallet, kind: WalletTxKind::PoolSell })
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            MonitorEvent::CreatorSell { .. }
        ));

        monitor
            .ingest(WalletLogEvent { wallet, kind: WalletTxKind::TokenTransfer })
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            MonitorEvent::CreatorTransfer { .. }
        ));

        monitor
            .ingest(WalletLogEvent { wallet, kind: WalletTxKind::AccountClose })
            .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            MonitorEvent::CreatorAccountClose { .. }
        ));
    }
}
