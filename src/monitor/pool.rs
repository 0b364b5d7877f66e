//! Pool activity monitor
//!
//! Classifies every transaction touching a monitored pool: remove-liquidity
//! is always critical, sells feed a short rolling window for burst
//! detection, buys feed a longer window for the buy/sell ratio. Stats are
//! readable by the engine at any time; alerts are pushed into its queue.

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ActivitySubscriber, MonitorEvent, PoolLogEvent, PoolTxKind, SubscriptionId};
use crate::config::MonitorConfig;

/// Rolling per-pool statistics
#[derive(Debug)]
struct PoolStats {
    sell_times: VecDeque<Instant>,
    buy_times: VecDeque<Instant>,
    lifetime_sells: u64,
    lifetime_buys: u64,
    last_buy_at: Option<Instant>,
    /// Cool-down marker so one burst does not re-alarm every sell
    last_burst_alarm: Option<Instant>,
}

impl PoolStats {
    fn new() -> Self {
        Self {
            sell_times: VecDeque::new(),
            buy_times: VecDeque::new(),
            lifetime_sells: 0,
            lifetime_buys: 0,
            last_buy_at: None,
            last_burst_alarm: None,
        }
    }

    fn prune(&mut self, now: Instant, sell_window: Duration, buy_window: Duration) {
        while let Some(front) = self.sell_times.front() {
            if now.duration_since(*front) > sell_window {
                self.sell_times.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.buy_times.front() {
            if now.duration_since(*front) > buy_window {
                self.buy_times.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Read-only view of a pool's rolling stats
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolSnapshot {
    pub sells_in_window: usize,
    pub buys_in_window: usize,
    pub lifetime_sells: u64,
    pub lifetime_buys: u64,
    pub secs_since_last_buy: Option<u64>,
}

impl PoolSnapshot {
    /// Sell-to-buy ratio over the rolling windows. `None` until at least
    /// one buy is in the window (a pure drought is handled separately).
    pub fn sell_buy_ratio(&self) -> Option<f64> {
        if self.buys_in_window == 0 {
            None
        } else {
            Some(self.sells_in_window as f64 / self.buys_in_window as f64)
        }
    }
}

/// Push-based monitor over pool log subscriptions
pub struct PoolMonitor {
    config: MonitorConfig,
    subscriber: Arc<dyn ActivitySubscriber>,
    stats: Arc<DashMap<Pubkey, PoolStats>>,
    subscriptions: DashMap<Pubkey, SubscriptionId>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl PoolMonitor {
    pub fn new(
        config: MonitorConfig,
        subscriber: Arc<dyn ActivitySubscriber>,
        events_tx: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            config,
            subscriber,
            stats: Arc::new(DashMap::new()),
            subscriptions: DashMap::new(),
            events_tx,
        }
    }

    /// Start watching a pool. Subscription failure is non-fatal: the
    /// polling feed still covers the same pool.
    pub async fn track_pool(&self, pool: Pubkey) {
        self.stats.entry(pool).or_insert_with(PoolStats::new);

        let (log_tx, mut log_rx) = mpsc::channel::<PoolLogEvent>(256);
        match self.subscriber.subscribe_pool(pool, log_tx).await {
            Ok(id) => {
                self.subscriptions.insert(pool, id);
                info!(pool = %pool, subscription = id, "Pool monitor attached");
            }
            Err(e) => {
                warn!(pool = %pool, error = %e, "Pool log subscription failed, relying on polling");
                return;
            }
        }

        let config = self.config.clone();
        let stats = self.stats.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = log_rx.recv().await {
                if let Some(alert) = classify(&config, &stats, &event, Instant::now()) {
                    if events_tx.send(alert).await.is_err() {
                        debug!(pool = %pool, "Engine event channel closed");
                        return;
                    }
                }
            }
            debug!(pool = %pool, "Pool log stream ended");
        });
    }

    /// Stop watching a pool and drop its stats.
    pub async fn untrack_pool(&self, pool: &Pubkey) {
        if let Some((_, id)) = self.subscriptions.remove(pool) {
            self.subscriber.unsubscribe(id).await;
        }
        self.stats.remove(pool);
        info!(pool = %pool, "Pool monitor detached");
    }

    /// Current rolling stats for a pool.
    pub fn snapshot(&self, pool: &Pubkey) -> PoolSnapshot {
        let now = Instant::now();
        match self.stats.get_mut(pool) {
            Some(mut entry) => {
                entry.prune(
                    now,
                    Duration::from_secs(self.config.sell_burst_window_secs),
                    Duration::from_secs(self.config.buy_window_secs),
                );
                PoolSnapshot {
                    sells_in_window: entry.sell_times.len(),
                    buys_in_window: entry.buy_times.len(),
                    lifetime_sells: entry.lifetime_sells,
                    lifetime_buys: entry.lifetime_buys,
                    secs_since_last_buy: entry
                        .last_buy_at
                        .map(|t| now.duration_since(t).as_secs()),
                }
            }
            None => PoolSnapshot::default(),
        }
    }

    /// Direct injection for hosts that demultiplex their own log stream.
    pub async fn ingest(&self, event: PoolLogEvent) {
        if let Some(alert) = classify(&self.config, &self.stats, &event, Instant::now()) {
            let _ = self.events_tx.send(alert).await;
        }
    }
}

/// Classify one pool log event, updating rolling windows. Returns an alert
/// when the event escalates to critical.
fn classify(
    config: &MonitorConfig,
    stats: &DashMap<Pubkey, PoolStats>,
    event: &PoolLogEvent,
    now: Instant,
) -> Option<MonitorEvent> {
    match event.kind {
        PoolTxKind::RemoveLiquidity => {
            warn!(pool = %event.pool, "Remove-liquidity instruction seen");
            Some(MonitorEvent::LiquidityRemoved { pool: event.pool })
        }
        PoolTxKind::Sell => {
            let mut entry = stats.entry(event.pool).or_insert_with(PoolStats::new);
            entry.prune(
                now,
                Duration::from_secs(config.sell_burst_window_secs),
                Duration::from_secs(config.buy_window_secs),
            );
            entry.sell_times.push_back(now);
            entry.lifetime_sells += 1;

            let in_window = entry.sell_times.len();
            if in_window >= config.sell_burst_threshold {
                let cooled_down = entry
                    .last_burst_alarm
                    .map(|t| now.duration_since(t).as_secs() >= config.burst_cooldown_secs)
                    .unwrap_or(true);
                if cooled_down {
                    entry.last_burst_alarm = Some(now);
                    warn!(pool = %event.pool, sells = in_window, "Sell burst detected");
                    return Some(MonitorEvent::SellBurst {
                        pool: event.pool,
                        sells_in_window: in_window,
                    });
                }
            }
            None
        }
        PoolTxKind::Buy => {
            let mut entry = stats.entry(event.pool).or_insert_with(PoolStats::new);
            entry.prune(
                now,
                Duration::from_secs(config.sell_burst_window_secs),
                Duration::from_secs(config.buy_window_secs),
            );
            entry.buy_times.push_back(now);
            entry.lifetime_buys += 1;
            entry.last_buy_at = Some(now);
            None
        }
    }
}
