//! Position lifecycle engine
//!
//! Single-threaded core over one event queue: feed readings, monitor
//! alerts, settled sells, late fills and timer wake-ups all arrive here
//! and are applied in order. Every position is mutated only inside this
//! loop, and a per-position lock (`selling`) guarantees at most one sell
//! cycle is in flight per position at any time. Actual transaction work
//! happens in spawned tasks that report back through the same queue.
//!
//! Decision order on each price tick: attempt cap, take-profit ladder,
//! momentum ratio, early-window micro-trailing, buy drought, then the
//! standard stop-loss chain. Emergencies bypass all of it and funnel
//! through the same lock, so the first trigger wins and the rest find
//! the position already exiting.

mod retry;
mod sell;
mod stranded;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{Executor, SellRequest};
use crate::feed::{AuthorityState, FeedEvent, PollGate, ReserveFeed, ReserveSource};
use crate::monitor::{ActivitySubscriber, MonitorEvent, PoolMonitor, WalletMonitor};
use crate::persist::{LifecycleEvent, PersistSink};
use crate::position::{ExitReason, Position, PositionStatus, Venue};
use crate::signals::{self, SmartExitSignals, StopTrigger};

use retry::{EphemeralState, GiveUpKind, RetryDecision, StrandedState};
use sell::{SellIntent, SellOutcome};

/// Everything the engine needs to take over a freshly entered trade
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub token: Pubkey,
    pub pool: Pubkey,
    pub venue: Venue,
    pub symbol: String,
    pub entry_tx: Option<String>,
    /// Pool creator wallet, watched for pre-dump behavior when known
    pub creator: Option<Pubkey>,
    pub entry_price: f64,
    pub token_amount: u64,
    pub sol_invested: f64,
    /// Quote reserve at entry, the drain baseline
    pub entry_reserve: Option<u64>,
    pub entry_authority: Option<AuthorityState>,
}

/// Everything that can wake the engine loop
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Feed(FeedEvent),
    Monitor(MonitorEvent),
    Open(Box<OpenRequest>),
    SellSettled { id: Uuid, outcome: SellOutcome },
    LateFill { id: Uuid, tokens_sold: u64, sol_out: f64 },
    RetryDue { id: Uuid },
    StrandedTick { id: Uuid },
    StrandedDeadline { id: Uuid },
    Query(QueryRequest),
    Shutdown,
}

/// Read-only questions answered in event order by the engine loop
#[derive(Debug)]
pub(crate) enum QueryRequest {
    OpenCount(oneshot::Sender<usize>),
    Snapshot(Uuid, oneshot::Sender<Option<Position>>),
    Snapshots(oneshot::Sender<Vec<Position>>),
}

/// Cloneable handle for feeding the engine from outside its loop
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Hand a freshly entered trade to the engine.
    pub async fn open_position(&self, request: OpenRequest) -> Result<()> {
        self.tx
            .send(EngineEvent::Open(Box::new(request)))
            .await
            .map_err(|_| Error::Internal("engine event queue closed".into()))
    }

    /// Number of live positions, answered by the running engine loop.
    pub async fn open_count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.query(QueryRequest::OpenCount(reply)).await?;
        rx.await.map_err(|_| Error::Internal("engine dropped the query".into()))
    }

    /// Snapshot of one live position.
    pub async fn snapshot(&self, id: Uuid) -> Result<Position> {
        let (reply, rx) = oneshot::channel();
        self.query(QueryRequest::Snapshot(id, reply)).await?;
        rx.await
            .map_err(|_| Error::Internal("engine dropped the query".into()))?
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))
    }

    /// Snapshots of every live position.
    pub async fn snapshots(&self) -> Result<Vec<Position>> {
        let (reply, rx) = oneshot::channel();
        self.query(QueryRequest::Snapshots(reply)).await?;
        rx.await.map_err(|_| Error::Internal("engine dropped the query".into()))
    }

    async fn query(&self, request: QueryRequest) -> Result<()> {
        self.tx
            .send(EngineEvent::Query(request))
            .await
            .map_err(|_| Error::Internal("engine event queue closed".into()))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineEvent::Shutdown).await;
    }
}

/// The exit engine. Owns all live positions and the single event loop
/// that mutates them.
pub struct ExitEngine {
    config: Config,
    executor: Arc<dyn Executor>,
    /// Second executor raced against the primary on emergency sells
    fallback_executor: Option<Arc<dyn Executor>>,
    sink: Arc<dyn PersistSink>,
    source: Arc<dyn ReserveSource>,
    feed: Arc<ReserveFeed>,
    pool_monitor: Arc<PoolMonitor>,
    wallet_monitor: Arc<WalletMonitor>,
    gate: PollGate,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,

    positions: HashMap<Uuid, Position>,
    ephemeral: HashMap<Uuid, EphemeralState>,
    by_token: HashMap<Pubkey, Uuid>,
    by_pool: HashMap<Pubkey, Uuid>,
    by_creator: HashMap<Pubkey, Vec<Uuid>>,
    creator_of: HashMap<Uuid, Pubkey>,
    /// Positions with a sell cycle in flight; the mutual-exclusion lock
    selling: HashSet<Uuid>,
    /// Active intent per locked position, kept across retries of one cycle
    intents: HashMap<Uuid, SellIntent>,
}

impl ExitEngine {
    pub fn new(
        config: Config,
        executor: Arc<dyn Executor>,
        fallback_executor: Option<Arc<dyn Executor>>,
        sink: Arc<dyn PersistSink>,
        source: Arc<dyn ReserveSource>,
        subscriber: Arc<dyn ActivitySubscriber>,
    ) -> (Self, EngineHandle) {
        let (events_tx, events_rx) = mpsc::channel::<EngineEvent>(1024);
        let gate = PollGate::default();

        let (feed_tx, mut feed_rx) = mpsc::channel::<FeedEvent>(1024);
        let feed = Arc::new(ReserveFeed::new(
            config.feed.clone(),
            source.clone(),
            feed_tx,
            gate.clone(),
        ));

        let (monitor_tx, mut monitor_rx) = mpsc::channel::<MonitorEvent>(256);
        let pool_monitor = Arc::new(PoolMonitor::new(
            config.monitor.clone(),
            subscriber.clone(),
            monitor_tx.clone(),
        ));
        let wallet_monitor = Arc::new(WalletMonitor::new(subscriber, monitor_tx));

        // Funnel both producers into the one engine queue
        let feed_forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                if feed_forward.send(EngineEvent::Feed(event)).await.is_err() {
                    return;
                }
            }
        });
        let monitor_forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_rx.recv().await {
                if monitor_forward.send(EngineEvent::Monitor(event)).await.is_err() {
                    return;
                }
            }
        });

        let handle = EngineHandle { tx: events_tx.clone() };
        let engine = Self {
            config,
            executor,
            fallback_executor,
            sink,
            source,
            feed,
            pool_monitor,
            wallet_monitor,
            gate,
            events_tx,
            events_rx,
            positions: HashMap::new(),
            ephemeral: HashMap::new(),
            by_token: HashMap::new(),
            by_pool: HashMap::new(),
            by_creator: HashMap::new(),
            creator_of: HashMap::new(),
            selling: HashSet::new(),
            intents: HashMap::new(),
        };
        (engine, handle)
    }

    /// Run the engine until shutdown. Consumes the engine: the loop is the
    /// only place position state is ever mutated.
    pub async fn run(mut self) {
        info!(positions = self.positions.len(), "Exit engine running");
        self.feed.start();
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }
        self.feed.stop();
        info!("Exit engine stopped");
    }

    /// Number of non-terminal positions currently owned by the engine.
    /// While the loop runs, go through [`EngineHandle::open_count`].
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Snapshot of one live position.
    /// While the loop runs, go through [`EngineHandle::snapshot`].
    pub fn snapshot(&self, id: &Uuid) -> Option<Position> {
        self.positions.get(id).cloned()
    }

    /// Snapshots of every live position.
    /// While the loop runs, go through [`EngineHandle::snapshots`].
    pub fn snapshots(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    fn handle_query(&self, query: QueryRequest) {
        match query {
            QueryRequest::OpenCount(reply) => {
                let _ = reply.send(self.open_count());
            }
            QueryRequest::Snapshot(id, reply) => {
                let _ = reply.send(self.snapshot(&id));
            }
            QueryRequest::Snapshots(reply) => {
                let _ = reply.send(self.snapshots());
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Open(request) => self.handle_open(*request).await,
            EngineEvent::Feed(feed_event) => self.handle_feed_event(feed_event).await,
            EngineEvent::Monitor(monitor_event) => {
                self.handle_monitor_event(monitor_event).await
            }
            EngineEvent::SellSettled { id, outcome } => {
                self.handle_sell_settled(id, outcome).await
            }
            EngineEvent::LateFill { id, tokens_sold, sol_out } => {
                self.handle_late_fill(id, tokens_sold, sol_out).await
            }
            EngineEvent::RetryDue { id } => self.handle_retry_due(id).await,
            EngineEvent::StrandedTick { id } => self.handle_stranded_tick(id).await,
            EngineEvent::StrandedDeadline { id } => self.handle_stranded_deadline(id).await,
            EngineEvent::Query(query) => self.handle_query(query),
            EngineEvent::Shutdown => {}
        }
    }

    // ---- lifecycle -----------------------------------------------------

    async fn handle_open(&mut self, request: OpenRequest) {
        let mut position = Position::open(
            request.token,
            request.pool,
            request.venue,
            request.entry_price,
            request.token_amount,
            request.sol_invested,
            request.entry_reserve,
        );
        position.symbol = request.symbol;
        position.entry_tx = request.entry_tx;
        let id = position.id;

        info!(position = %id, token = %request.token, symbol = %position.symbol,
            sol = request.sol_invested, "Taking over position");

        self.by_token.insert(request.token, id);
        self.by_pool.insert(request.pool, id);
        if let Some(creator) = request.creator {
            self.by_creator.entry(creator).or_default().push(id);
            self.creator_of.insert(id, creator);
            self.wallet_monitor.track_wallet(creator).await;
        }
        self.ephemeral.insert(id, EphemeralState::new());

        self.feed
            .add_token(
                request.token,
                request.pool,
                request.venue,
                request.entry_reserve,
                request.entry_authority,
            )
            .await;
        self.pool_monitor.track_pool(request.pool).await;

        self.persist_checkpoint(&position);
        self.emit(LifecycleEvent::Opened { position_id: id });
        self.positions.insert(id, position);
    }

    /// Terminal transition: close, checkpoint, deregister, evict. The
    /// ephemeral record dies here and only here.
    async fn finalize(&mut self, id: Uuid, status: PositionStatus, reason: ExitReason) {
        let Some(position) = self.positions.get_mut(&id) else {
            return;
        };
        position.close(status, reason);
        let snapshot = position.clone();
        info!(position = %id, reason = %reason,
            pnl = format!("{:+.4} SOL", snapshot.pnl_absolute), "Position closed");

        self.persist_checkpoint(&snapshot);
        self.emit(LifecycleEvent::Closed {
            position_id: id,
            reason: reason.as_str().into(),
            pnl_sol: snapshot.pnl_absolute,
        });

        self.feed.remove_token(&snapshot.token).await;
        self.pool_monitor.untrack_pool(&snapshot.pool).await;
        if let Some(creator) = self.creator_of.remove(&id) {
            let mut last_for_creator = false;
            if let Some(ids) = self.by_creator.get_mut(&creator) {
                ids.retain(|p| *p != id);
                last_for_creator = ids.is_empty();
            }
            if last_for_creator {
                self.by_creator.remove(&creator);
                self.wallet_monitor.untrack_wallet(&creator).await;
            }
        }
        self.by_token.remove(&snapshot.token);
        self.by_pool.remove(&snapshot.pool);
        self.positions.remove(&id);
        self.ephemeral.remove(&id);
        self.intents.remove(&id);
        self.selling.remove(&id);
    }

    // ---- feed events ---------------------------------------------------

    async fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::PriceUpdate { token, price, reserve } => {
                self.handle_price_update(token, price, reserve).await
            }
            FeedEvent::RugPull { token, drop_pct, kind } => {
                if let Some(&id) = self.by_token.get(&token) {
                    warn!(token = %token, drop = format!("{:.1}%", drop_pct), ?kind,
                        "RUG PULL DETECTED");
                    self.trigger_emergency(id, ExitReason::RugPull).await;
                }
            }
            FeedEvent::AuthorityReenabled { token, kind } => {
                if let Some(&id) = self.by_token.get(&token) {
                    warn!(token = %token, ?kind, "Revoked authority re-enabled");
                    self.trigger_emergency(id, ExitReason::AuthorityReenabled).await;
                }
            }
            FeedEvent::StaleReading { token, consecutive } => {
                self.handle_stale_reading(token, consecutive).await
            }
        }
    }

    async fn handle_price_update(&mut self, token: Pubkey, price: f64, reserve: Option<u64>) {
        let Some(&id) = self.by_token.get(&token) else {
            return;
        };
        {
            let Some(position) = self.positions.get_mut(&id) else {
                return;
            };
            if position.status.is_terminal() {
                return;
            }
            position.observe_price(price, reserve);
        }

        // A locked or stranded position makes no new decisions
        if self.selling.contains(&id) {
            return;
        }
        if let Some(eph) = self.ephemeral.get(&id) {
            if eph.is_stranded() || eph.attempts >= retry::absolute_cap(&self.config.retry) {
                return;
            }
        }

        if self.consider_take_profit(id).await {
            return;
        }
        if self.consider_market_structure(id).await {
            return;
        }
        self.consider_stop_loss(id).await;
    }

    async fn handle_stale_reading(&mut self, token: Pubkey, consecutive: u32) {
        let Some(&id) = self.by_token.get(&token) else {
            return;
        };
        if self.selling.contains(&id) {
            return;
        }
        let (age, terminal) = match self.positions.get(&id) {
            Some(p) => (p.age_secs(), p.status.is_terminal()),
            None => return,
        };
        if terminal {
            return;
        }
        if self.ephemeral.get(&id).map(|e| e.is_stranded()).unwrap_or(false) {
            return;
        }

        let bonus = self.ephemeral.get(&id).map(|e| e.stale_bonus).unwrap_or(0);
        let effective = consecutive + bonus;
        if effective < self.config.engine.stale_miss_threshold {
            return;
        }

        if age >= self.config.engine.grace_period_secs {
            warn!(position = %id, misses = effective, "Price feed dark past the grace period");
            self.trigger_emergency(id, ExitReason::StalePrice).await;
        } else {
            // Too young to trust the alarm: one on-demand read decides
            self.confirm_suspicion(id, ExitReason::StalePrice).await;
        }
    }

    // ---- monitor events ------------------------------------------------

    async fn handle_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::LiquidityRemoved { pool } => {
                if let Some(&id) = self.by_pool.get(&pool) {
                    warn!(position = %id, pool = %pool, "Liquidity being removed");
                    self.trigger_emergency(id, ExitReason::RugPull).await;
                }
            }
            MonitorEvent::SellBurst { pool, sells_in_window } => {
                let Some(&id) = self.by_pool.get(&pool) else {
                    return;
                };
                let age = match self.positions.get_mut(&id) {
                    Some(p) => {
                        p.sell_burst_count = Some(p.sell_burst_count.unwrap_or(0) + 1);
                        p.age_secs()
                    }
                    None => return,
                };
                warn!(position = %id, sells = sells_in_window, "Sell burst against our pool");
                if age >= self.config.engine.grace_period_secs {
                    self.trigger_emergency(id, ExitReason::SellBurst).await;
                } else {
                    self.confirm_suspicion(id, ExitReason::SellBurst).await;
                }
            }
            MonitorEvent::CreatorSell { wallet } => {
                for id in self.by_creator.get(&wallet).cloned().unwrap_or_default() {
                    self.trigger_emergency(id, ExitReason::CreatorSell).await;
                }
            }
            MonitorEvent::CreatorTransfer { wallet } => {
                for id in self.by_creator.get(&wallet).cloned().unwrap_or_default() {
                    self.trigger_emergency(id, ExitReason::CreatorTransfer).await;
                }
            }
            MonitorEvent::CreatorAccountClose { wallet } => {
                debug!(wallet = %wallet, "Creator closed a token account");
            }
        }
    }

    /// In-grace alarm resolution: a burst or stale alarm on a very young
    /// position gets one on-demand reserve read. A confirmed drain exits
    /// immediately despite the grace period; an unreadable pool accelerates
    /// the staleness count instead.
    async fn confirm_suspicion(&mut self, id: Uuid, reason: ExitReason) {
        let (venue, pool, baseline) = match self.positions.get(&id) {
            Some(p) => (p.venue, p.pool, p.entry_reserve),
            None => return,
        };
        let rug_drop_pct = self.config.feed.rug_drop_pct;

        // Bounded: this runs inline in the event loop, and a hung RPC here
        // would stall every other position's decisions.
        let read_timeout = Duration::from_millis(self.config.feed.read_timeout_ms);
        let result = tokio::time::timeout(read_timeout, self.source.get_reserves(venue, &[pool]))
            .await
            .unwrap_or_else(|_| Err(Error::RpcTimeout(self.config.feed.read_timeout_ms)));
        match result {
            Ok(readings) => match readings.into_iter().next().flatten() {
                Some(reserves) => {
                    let drained = reserves.quote == 0
                        || baseline
                            .filter(|b| *b > 0)
                            .map(|b| {
                                (b as f64 - reserves.quote as f64) / b as f64 * 100.0
                                    >= rug_drop_pct
                            })
                            .unwrap_or(false);
                    if drained {
                        warn!(position = %id, quote = reserves.quote,
                            "In-grace check confirms the pool is draining");
                        self.trigger_emergency(id, reason).await;
                    } else {
                        debug!(position = %id, "In-grace alarm not confirmed, pool intact");
                    }
                }
                None => self.accelerate_staleness(id),
            },
            Err(e) => {
                warn!(position = %id, error = %e,
                    "In-grace confirmation read failed, assuming trouble");
                self.accelerate_staleness(id);
            }
        }
    }

    fn accelerate_staleness(&mut self, id: Uuid) {
        let accel = self.config.engine.stale_accel_misses;
        if let Some(eph) = self.ephemeral.get_mut(&id) {
            eph.stale_bonus += accel;
        }
    }

    // ---- decision paths ------------------------------------------------

    async fn consider_take_profit(&mut self, id: Uuid) -> bool {
        if self
            .ephemeral
            .get(&id)
            .map(|e| e.tp_cooldown_active(Instant::now()))
            .unwrap_or(false)
        {
            return false;
        }

        let (amount, close_after, level) = {
            let Some(position) = self.positions.get(&id) else {
                return false;
            };
            let ladder = &self.config.take_profit.ladder;
            let Some(level) = signals::evaluate_take_profit(position, ladder) else {
                return false;
            };
            let mut sell_pct = ladder[level].sell_pct;

            // First milestone: score pool health and maybe sell less
            if position.tp_levels_hit.is_empty() {
                let snap = self.pool_monitor.snapshot(&position.pool);
                let decision = signals::evaluate_smart_partial_exit(
                    &SmartExitSignals {
                        position_value_sol: position.current_value_sol(),
                        entry_reserve: position.entry_reserve,
                        current_reserve: position.current_reserve,
                        sell_buy_ratio: snap.sell_buy_ratio(),
                        secs_to_first_target: position.age_secs(),
                        cumulative_sells: snap.lifetime_sells,
                        default_sell_pct: sell_pct,
                    },
                    &self.config.smart_exit,
                );
                if decision.confident {
                    info!(position = %id, signals = decision.signals_passed,
                        "Pool looks healthy, selling reduced size at first target");
                }
                sell_pct = decision.sell_pct;
            }

            let remaining = position.token_amount_remaining;
            let is_last = level + 1 == ladder.len();
            let (amount, close_after) = if is_last {
                let profitable = position.sol_returned + position.current_value_sol()
                    > position.sol_invested;
                if profitable && self.config.take_profit.moon_bag_pct > 0.0 {
                    let split =
                        signals::calculate_moon_bag(position, self.config.take_profit.moon_bag_pct);
                    info!(position = %id, keep = split.keep, "Final target, keeping a moon bag");
                    (split.sell, false)
                } else {
                    (remaining, true)
                }
            } else {
                let amount = (remaining as f64 * sell_pct / 100.0).floor() as u64;
                (amount.clamp(1, remaining), false)
            };
            (amount, close_after, level as u8)
        };

        info!(position = %id, level, amount, "Take-profit level reached");
        // Optimistic commit; rolled back explicitly if the sell fails
        if let Some(position) = self.positions.get_mut(&id) {
            position.tp_levels_hit.insert(level);
        }
        self.start_sell_cycle(
            id,
            SellIntent {
                reason: ExitReason::TakeProfit,
                requested: amount,
                emergency: false,
                tp_level: Some(level),
                close_after,
            },
        )
        .await;
        true
    }

    /// Momentum, early-window micro-trailing and buy drought, in that order.
    async fn consider_market_structure(&mut self, id: Uuid) -> bool {
        let (pool, age, drop_from_peak) = match self.positions.get(&id) {
            Some(p) => (p.pool, p.age_secs(), p.drop_from_peak_pct()),
            None => return false,
        };
        let snap = self.pool_monitor.snapshot(&pool);
        let engine_cfg = &self.config.engine;

        if snap.sells_in_window >= engine_cfg.momentum_min_sells {
            if let Some(ratio) = snap.sell_buy_ratio() {
                if ratio >= engine_cfg.momentum_sell_buy_ratio {
                    info!(position = %id, ratio = format!("{:.1}", ratio),
                        "Sell pressure overwhelming buys, exiting");
                    self.start_full_exit(id, ExitReason::Momentum, false).await;
                    return true;
                }
            }
        }

        let stop_cfg = &self.config.stop_loss;
        if age <= stop_cfg.micro_trailing_window_secs
            && drop_from_peak >= stop_cfg.micro_trailing_drop_pct
        {
            info!(position = %id, drop = format!("{:.1}%", drop_from_peak),
                "Early collapse from peak, exiting");
            self.start_full_exit(id, ExitReason::MicroTrailing, false).await;
            return true;
        }

        let drought = snap
            .secs_since_last_buy
            .map(|s| s >= engine_cfg.drought_window_secs)
            .unwrap_or(age >= engine_cfg.drought_window_secs);
        if drought
            && snap.sells_in_window >= engine_cfg.drought_min_sells
            && drop_from_peak >= engine_cfg.drought_trailing_pct
        {
            info!(position = %id, "Buy drought with continued selling, exiting");
            self.start_full_exit(id, ExitReason::BuyDrought, false).await;
            return true;
        }
        false
    }

    async fn consider_stop_loss(&mut self, id: Uuid) {
        let ladder_len = self.config.take_profit.ladder.len();
        let verdict = match self.positions.get(&id) {
            Some(p) => signals::evaluate_stop_loss(p, &self.config.stop_loss, ladder_len),
            None => return,
        };
        let Some(trigger) = verdict.trigger else {
            return;
        };
        let reason = match trigger {
            StopTrigger::HardStop => ExitReason::StopLoss,
            StopTrigger::BreakevenFloor => ExitReason::BreakevenFloor,
            StopTrigger::TrailingStop => ExitReason::TrailingStop,
            StopTrigger::NoMomentum => ExitReason::NoMomentum,
            StopTrigger::Timeout => ExitReason::Timeout,
        };
        info!(position = %id, reason = %reason,
            pnl = format!("{:+.1}%", verdict.pnl_pct), "Stop triggered");
        self.emit(LifecycleEvent::StopLossHit {
            position_id: id,
            reason: reason.as_str().into(),
            pnl_pct: verdict.pnl_pct,
        });
        self.start_full_exit(id, reason, false).await;
    }

    // ---- sell cycle ----------------------------------------------------

    /// Emergency funnel. Every critical trigger lands here; the lock makes
    /// the first one win and the rest no-ops.
    async fn trigger_emergency(&mut self, id: Uuid, reason: ExitReason) {
        if self.selling.contains(&id) {
            debug!(position = %id, reason = %reason, "Already exiting, emergency absorbed");
            return;
        }
        match self.positions.get(&id) {
            Some(p) if !p.status.is_terminal() => {}
            _ => return,
        }
        if self.ephemeral.get(&id).map(|e| e.is_stranded()).unwrap_or(false) {
            return;
        }
        warn!(position = %id, reason = %reason, "EMERGENCY EXIT");
        if let Some(eph) = self.ephemeral.get_mut(&id) {
            eph.urgency = eph.urgency.escalate();
        }
        self.start_full_exit(id, reason, true).await;
    }

    async fn start_full_exit(&mut self, id: Uuid, reason: ExitReason, emergency: bool) {
        let Some(requested) = self.positions.get(&id).map(|p| p.token_amount_remaining) else {
            return;
        };
        self.start_sell_cycle(
            id,
            SellIntent { reason, requested, emergency, tp_level: None, close_after: true },
        )
        .await;
    }

    async fn start_sell_cycle(&mut self, id: Uuid, intent: SellIntent) {
        if self.selling.contains(&id) {
            return;
        }
        let (remaining, value) = match self.positions.get(&id) {
            Some(p) if !p.status.is_terminal() => {
                (p.token_amount_remaining, p.current_value_sol())
            }
            _ => return,
        };
        if remaining == 0 {
            return;
        }
        // Not worth a transaction: write it off instead of burning fees
        if value < self.config.engine.dust_threshold_sol {
            info!(position = %id, value = format!("{:.6}", value),
                "Remaining value under dust threshold, writing off");
            self.finalize(id, PositionStatus::Closed, ExitReason::Dust).await;
            return;
        }
        self.selling.insert(id);
        self.intents.insert(id, intent);
        self.launch_attempt(id).await;
    }

    /// Fire one attempt task for the position's current intent. The poll
    /// gate pauses for the duration because the RPC channel is shared.
    async fn launch_attempt(&mut self, id: Uuid) {
        let Some(intent) = self.intents.get(&id).cloned() else {
            self.selling.remove(&id);
            return;
        };
        let request = {
            let Some(position) = self.positions.get_mut(&id) else {
                self.selling.remove(&id);
                return;
            };
            position.sell_attempts += 1;
            SellRequest {
                position_id: id,
                token: position.token,
                pool: position.pool,
                venue: position.venue,
                amount: intent.requested.min(position.token_amount_remaining),
                emergency: intent.emergency,
                urgency: self.ephemeral.get(&id).map(|e| e.urgency).unwrap_or_default(),
            }
        };
        if let Some(eph) = self.ephemeral.get_mut(&id) {
            eph.attempts += 1;
        }

        let fallback = if intent.emergency { self.fallback_executor.clone() } else { None };
        let attempt_timeout = if fallback.is_some() {
            Duration::from_secs(self.config.retry.race_timeout_secs)
        } else {
            Duration::from_secs(self.config.retry.sell_timeout_secs)
        };

        debug!(position = %id, amount = request.amount, emergency = request.emergency,
            urgency = ?request.urgency, "Launching sell attempt");
        self.gate.pause();
        sell::spawn_attempt(
            self.executor.clone(),
            fallback,
            request,
            attempt_timeout,
            self.events_tx.clone(),
        );
    }

    async fn handle_sell_settled(&mut self, id: Uuid, outcome: SellOutcome) {
        self.gate.resume();
        let Some(intent) = self.intents.get(&id).cloned() else {
            self.selling.remove(&id);
            return;
        };
        match outcome {
            SellOutcome::Filled { tokens_sold, sol_out, legs } => {
                self.settle_fill(id, intent, tokens_sold, sol_out, legs).await
            }
            SellOutcome::Failed(error) => self.settle_failure(id, intent, error).await,
        }
    }

    async fn settle_fill(
        &mut self,
        id: Uuid,
        intent: SellIntent,
        tokens_sold: u64,
        sol_out: f64,
        legs: u8,
    ) {
        let (pre_balance, remaining, value, stranded) = {
            let Some(position) = self.positions.get_mut(&id) else {
                self.selling.remove(&id);
                return;
            };
            let pre_balance = position.token_amount_remaining;
            position.apply_fill(tokens_sold, sol_out);
            let snapshot = position.clone();
            let remaining = snapshot.token_amount_remaining;
            let value = snapshot.current_value_sol();
            self.persist_checkpoint(&snapshot);
            (
                pre_balance,
                remaining,
                value,
                self.ephemeral.get(&id).map(|e| e.is_stranded()).unwrap_or(false),
            )
        };
        info!(position = %id, tokens = tokens_sold.min(pre_balance),
            sol = format!("{:.4}", sol_out), legs, reason = %intent.reason, "Sell confirmed");

        if let Some(eph) = self.ephemeral.get_mut(&id) {
            eph.record_success(
                Instant::now(),
                Duration::from_secs(self.config.take_profit.cooldown_secs),
            );
        }

        if stranded {
            self.selling.remove(&id);
            self.finalize(id, PositionStatus::Closed, ExitReason::Recovered).await;
            return;
        }

        if intent.reason == ExitReason::TakeProfit {
            let sell_pct = if pre_balance > 0 {
                tokens_sold.min(pre_balance) as f64 / pre_balance as f64 * 100.0
            } else {
                0.0
            };
            self.emit(LifecycleEvent::TakeProfitHit {
                position_id: id,
                level: intent.tp_level.unwrap_or(0),
                sell_pct,
            });
            self.selling.remove(&id);
            self.intents.remove(&id);
            if remaining == 0 {
                self.finalize(id, PositionStatus::Closed, ExitReason::TakeProfit).await;
            } else if let Some(position) = self.positions.get_mut(&id) {
                position.status = PositionStatus::PartialClose;
                let snapshot = position.clone();
                self.persist_checkpoint(&snapshot);
            }
            return;
        }

        // Stop/emergency path: a short fill leaves tokens behind; keep the
        // lock and sell the rest unless it is now dust
        let capped = self
            .ephemeral
            .get(&id)
            .map(|e| e.attempts >= retry::absolute_cap(&self.config.retry))
            .unwrap_or(false);
        if intent.close_after
            && remaining > 0
            && value >= self.config.engine.dust_threshold_sol
            && !capped
        {
            warn!(position = %id, remaining, "Partial execution, selling the rest");
            if let Some(active) = self.intents.get_mut(&id) {
                active.requested = remaining;
            }
            self.launch_attempt(id).await;
            return;
        }

        self.selling.remove(&id);
        self.intents.remove(&id);
        self.finalize(id, PositionStatus::Stopped, intent.reason).await;
    }

    async fn settle_failure(&mut self, id: Uuid, intent: SellIntent, error: Error) {
        // The optimistic ladder commit shrinks only via this rollback
        if let Some(level) = intent.tp_level {
            if let Some(position) = self.positions.get_mut(&id) {
                position.tp_levels_hit.remove(&level);
            }
        }

        let (attempts, stranded, stranded_expired) = {
            let Some(eph) = self.ephemeral.get_mut(&id) else {
                self.selling.remove(&id);
                return;
            };
            eph.record_failure(&error);
            if intent.emergency {
                eph.urgency = eph.urgency.escalate();
            }
            (
                eph.attempts,
                eph.is_stranded(),
                eph.stranded.map(|s| s.expired).unwrap_or(false),
            )
        };
        warn!(position = %id, attempt = attempts, error = %error, "Sell attempt failed");

        if stranded {
            self.selling.remove(&id);
            self.intents.remove(&id);
            if error.is_pool_drained() {
                // Confirmed drained during recovery: realize the loss now
                self.finalize(id, PositionStatus::Stopped, ExitReason::RugPull).await;
            } else if stranded_expired {
                let reason = self.stranded_close_reason(id);
                self.finalize(id, PositionStatus::Stopped, reason).await;
            }
            // Otherwise wait for the next recovery tick
            return;
        }

        // A rate-limited ladder attempt is not worth holding the lock for:
        // abort the cycle and push the next try out progressively
        if intent.reason == ExitReason::TakeProfit && error.is_rate_limit() {
            let base = Duration::from_secs(self.config.take_profit.cooldown_secs);
            let step = Duration::from_secs(self.config.take_profit.rate_limit_step_secs);
            if let Some(eph) = self.ephemeral.get_mut(&id) {
                eph.apply_tp_rate_limit(Instant::now(), base, step);
            }
            self.selling.remove(&id);
            self.intents.remove(&id);
            return;
        }

        let decision = match self.ephemeral.get(&id) {
            Some(eph) => retry::next_retry(&self.config.retry, eph, &error, intent.emergency),
            None => {
                self.selling.remove(&id);
                return;
            }
        };
        match decision {
            RetryDecision::Retry(delay) => {
                debug!(position = %id, delay = ?delay, "Retrying sell");
                // Lock stays held: the cycle owns the position until it ends
                stranded::spawn_retry_timer(self.events_tx.clone(), id, delay);
            }
            RetryDecision::GiveUp(GiveUpKind::Drained) => {
                self.selling.remove(&id);
                self.intents.remove(&id);
                self.finalize(id, PositionStatus::Stopped, ExitReason::RugPull).await;
            }
            RetryDecision::GiveUp(GiveUpKind::HardCap) => self.give_up_hard_cap(id).await,
        }
    }

    /// Attempt cap reached. With nothing ever sold the tokens are still
    /// here, so the position goes into stranded recovery instead of closing
    /// with a phantom loss.
    async fn give_up_hard_cap(&mut self, id: Uuid) {
        let successes = self.positions.get(&id).map(|p| p.sell_successes).unwrap_or(0);
        if successes == 0 {
            if let Some(eph) = self.ephemeral.get_mut(&id) {
                eph.stranded = Some(StrandedState { started: Instant::now(), expired: false });
            }
            // Lock released between recovery attempts; each tick re-takes it
            self.selling.remove(&id);
            stranded::spawn_recovery_timer(
                self.events_tx.clone(),
                id,
                Duration::from_secs(self.config.retry.stranded_retry_interval_secs),
                Duration::from_secs(self.config.retry.stranded_max_duration_secs),
            );
        } else {
            self.selling.remove(&id);
            self.intents.remove(&id);
            self.finalize(id, PositionStatus::Stopped, ExitReason::MaxAttempts).await;
        }
    }

    fn stranded_close_reason(&self, id: Uuid) -> ExitReason {
        // Sells that confirm but always pay zero are the token's doing,
        // not the infrastructure's
        match self.ephemeral.get(&id) {
            Some(eph) if eph.attempts > 0 && eph.zero_output_failures * 2 >= eph.attempts => {
                ExitReason::Honeypot
            }
            _ => ExitReason::StrandedTimeout,
        }
    }

    // ---- timers and reconciliation -------------------------------------

    async fn handle_retry_due(&mut self, id: Uuid) {
        if !self.selling.contains(&id) {
            return; // cycle ended while the timer was pending
        }
        if !self.intents.contains_key(&id) {
            self.selling.remove(&id);
            return;
        }
        let capped = self
            .ephemeral
            .get(&id)
            .map(|e| e.attempts >= retry::absolute_cap(&self.config.retry))
            .unwrap_or(true);
        if capped {
            self.give_up_hard_cap(id).await;
        } else {
            self.launch_attempt(id).await;
        }
    }

    async fn handle_stranded_tick(&mut self, id: Uuid) {
        if self.selling.contains(&id) {
            return; // previous recovery attempt still in flight
        }
        let remaining = match self.positions.get(&id) {
            Some(p) if !p.status.is_terminal() => p.token_amount_remaining,
            _ => return,
        };
        if !self.ephemeral.get(&id).map(|e| e.is_stranded()).unwrap_or(false) {
            return;
        }
        info!(position = %id, "Stranded recovery attempt");
        self.selling.insert(id);
        self.intents.insert(
            id,
            SellIntent {
                reason: ExitReason::Recovered,
                requested: remaining,
                emergency: true,
                tp_level: None,
                close_after: true,
            },
        );
        self.launch_attempt(id).await;
    }

    async fn handle_stranded_deadline(&mut self, id: Uuid) {
        {
            let Some(eph) = self.ephemeral.get_mut(&id) else {
                return;
            };
            let Some(stranded) = eph.stranded.as_mut() else {
                return;
            };
            stranded.expired = true;
        }
        if self.selling.contains(&id) {
            return; // the in-flight attempt's settlement closes it
        }
        warn!(position = %id, "Stranded recovery window exhausted, force-closing");
        let reason = self.stranded_close_reason(id);
        self.finalize(id, PositionStatus::Stopped, reason).await;
    }

    async fn handle_late_fill(&mut self, id: Uuid, tokens_sold: u64, sol_out: f64) {
        if let Some(position) = self.positions.get_mut(&id) {
            warn!(position = %id, tokens = tokens_sold, sol = format!("{:.4}", sol_out),
                "Late fill from an abandoned leg, reconciling live position");
            position.reconcile_extra_fill(tokens_sold, sol_out);
            let snapshot = position.clone();
            self.persist_checkpoint(&snapshot);
            self.emit(LifecycleEvent::Updated { position_id: id });
        } else {
            warn!(position = %id, sol = format!("{:.4}", sol_out),
                "Late fill for an already-closed position, patching the record");
            let sink = self.sink.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.reconcile_closed(id, tokens_sold, sol_out).await {
                    warn!(position = %id, error = %e, "Closed-position reconciliation failed");
                }
            });
        }
    }

    // ---- persistence helpers -------------------------------------------

    fn persist_checkpoint(&self, position: &Position) {
        let sink = self.sink.clone();
        let snapshot = position.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.checkpoint(&snapshot).await {
                warn!(position = %snapshot.id, error = %e, "Checkpoint failed");
            }
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.lifecycle(event).await;
        });
    }

    /// Drain and apply queued events until the queue stays quiet for
    /// `idle`. Test pump; production uses [`ExitEngine::run`].
    #[cfg(test)]
    pub(crate) async fn run_until_idle(&mut self, idle: Duration) {
        loop {
            match tokio::time::timeout(idle, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TakeProfitLevel;
    use crate::error::Result;
    use crate::exec::{BuyOrder, SwapReceipt};
    use crate::feed::{DrainKind, PoolReserves};
    use crate::monitor::{PoolLogEvent, PoolTxKind, SubscriptionId, WalletLogEvent};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // -- mocks ----------------------------------------------------------

    struct MockExecutor {
        script: Mutex<VecDeque<Result<SwapReceipt>>>,
        calls: AtomicU32,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
        delay: Duration,
    }

    impl MockExecutor {
        fn new(script: Vec<Result<SwapReceipt>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn sell(&self, _request: &SellRequest) -> Result<SwapReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(Error::Execution("script exhausted".into())));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            result
        }
        async fn buy(&self, _order: &BuyOrder) -> Result<SwapReceipt> {
            Err(Error::Execution("not scripted".into()))
        }
        async fn resolve(&self, _token: Pubkey, _tx_ref: &str) -> Result<Option<SwapReceipt>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MockSink {
        checkpoints: Mutex<Vec<Position>>,
        events: Mutex<Vec<LifecycleEvent>>,
        reconciled: Mutex<Vec<(Uuid, u64, f64)>>,
    }

    impl MockSink {
        /// The terminal snapshot, independent of checkpoint task ordering
        fn closed_position(&self) -> Position {
            self.checkpoints
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|p| p.status.is_terminal())
                .cloned()
                .expect("no terminal checkpoint")
        }
    }

    #[async_trait]
    impl PersistSink for MockSink {
        async fn checkpoint(&self, position: &Position) -> Result<()> {
            self.checkpoints.lock().unwrap().push(position.clone());
            Ok(())
        }
        async fn lifecycle(&self, event: LifecycleEvent) {
            self.events.lock().unwrap().push(event);
        }
        async fn reconcile_closed(
            &self,
            position_id: Uuid,
            tokens_sold: u64,
            sol_out: f64,
        ) -> Result<()> {
            self.reconciled.lock().unwrap().push((position_id, tokens_sold, sol_out));
            Ok(())
        }
    }

    struct MockSource {
        reading: Mutex<Option<PoolReserves>>,
        fail: bool,
        hang: bool,
    }

    impl MockSource {
        fn healthy(reserves: PoolReserves) -> Self {
            Self { reading: Mutex::new(Some(reserves)), fail: false, hang: false }
        }
        fn failing() -> Self {
            Self { reading: Mutex::new(None), fail: true, hang: false }
        }
        /// Never answers: models an RPC connection that silently stalls
        fn hanging() -> Self {
            Self { reading: Mutex::new(None), fail: false, hang: true }
        }
    }

    #[async_trait]
    impl ReserveSource for MockSource {
        async fn get_reserves(
            &self,
            _venue: Venue,
            pools: &[Pubkey],
        ) -> Result<Vec<Option<PoolReserves>>> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(Error::Rpc("unreachable".into()));
            }
            Ok(vec![*self.reading.lock().unwrap(); pools.len()])
        }
        async fn get_authority_state(&self, _token: Pubkey) -> Result<AuthorityState> {
            Ok(AuthorityState::default())
        }
    }

    struct NullSubscriber;

    #[async_trait]
    impl ActivitySubscriber for NullSubscriber {
        async fn subscribe_pool(
            &self,
            _pool: Pubkey,
            _tx: mpsc::Sender<PoolLogEvent>,
        ) -> Result<SubscriptionId> {
            Ok(1)
        }
        async fn subscribe_wallet(
            &self,
            _wallet: Pubkey,
            _tx: mpsc::Sender<WalletLogEvent>,
        ) -> Result<SubscriptionId> {
            Ok(2)
        }
        async fn unsubscribe(&self, _id: SubscriptionId) {}
    }

    fn receipt(input: u64, output: u64) -> SwapReceipt {
        SwapReceipt {
            realized_input: input,
            realized_output: output,
            execution_price: 0.0,
            fee: 5_000,
            tx_ref: Some("sig".into()),
        }
    }

    /// Config with timer values scaled down to test speed
    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry.backoff_base_ms = 10;
        config.retry.backoff_cap_ms = 40;
        config.retry.emergency_retry_delay_ms = 10;
        config.retry.pool_drained_delay_ms = 5;
        config
    }

    struct Harness {
        engine: ExitEngine,
        executor: Arc<MockExecutor>,
        sink: Arc<MockSink>,
    }

    fn harness_with(
        config: Config,
        executor: MockExecutor,
        fallback: Option<MockExecutor>,
        source: MockSource,
    ) -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let executor = Arc::new(executor);
        let sink = Arc::new(MockSink::default());
        let (engine, _handle) = ExitEngine::new(
            config,
            executor.clone(),
            fallback.map(|f| Arc::new(f) as Arc<dyn Executor>),
            sink.clone(),
            Arc::new(source),
            Arc::new(NullSubscriber),
        );
        Harness { engine, executor, sink }
    }

    fn harness(executor: MockExecutor) -> Harness {
        harness_with(
            fast_config(),
            executor,
            None,
            MockSource::healthy(PoolReserves { base: 1_000_000_000, quote: 10_000_000_000 }),
        )
    }

    async fn open(engine: &mut ExitEngine, entry_price: f64, amount: u64) -> Uuid {
        open_with_creator(engine, entry_price, amount, None).await
    }

    async fn open_with_creator(
        engine: &mut ExitEngine,
        entry_price: f64,
        amount: u64,
        creator: Option<Pubkey>,
    ) -> Uuid {
        let request = OpenRequest {
            token: Pubkey::new_unique(),
            pool: Pubkey::new_unique(),
            venue: Venue::PumpFun,
            symbol: "TEST".into(),
            entry_tx: Some("entry-sig".into()),
            creator,
            entry_price,
            token_amount: amount,
            sol_invested: entry_price * amount as f64,
            entry_reserve: Some(10_000_000_000),
            entry_authority: None,
        };
        engine.handle_event(EngineEvent::Open(Box::new(request))).await;
        *engine.positions.keys().next().expect("position not opened")
    }

    async fn price(engine: &mut ExitEngine, id: Uuid, price: f64) {
        let token = engine.positions.get(&id).map(|p| p.token);
        if let Some(token) = token {
            engine
                .handle_event(EngineEvent::Feed(FeedEvent::PriceUpdate {
                    token,
                    price,
                    reserve: Some(10_000_000_000),
                }))
                .await;
        }
    }

    fn rewind_open_time(engine: &mut ExitEngine, id: Uuid, secs: i64) {
        if let Some(p) = engine.positions.get_mut(&id) {
            p.opened_at -= chrono::Duration::seconds(secs);
        }
    }

    const IDLE: Duration = Duration::from_millis(60);

    // -- take profit -----------------------------------------------------

    #[tokio::test]
    async fn test_take_profit_partial_close() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(500_000, 750_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        price(&mut h.engine, id, 1.6e-6).await;
        h.engine.run_until_idle(IDLE).await;

        let p = h.engine.positions.get(&id).unwrap();
        assert_eq!(p.status, PositionStatus::PartialClose);
        assert!(p.tp_levels_hit.contains(&0));
        assert_eq!(p.token_amount_remaining, 500_000);
        assert!((p.sol_returned - 0.75).abs() < 1e-9);
        assert!(!h.engine.selling.contains(&id));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_take_profit_rollback_on_failure() {
        let mut config = fast_config();
        config.retry.backoff_base_ms = 10_000; // park the retry out of reach
        config.retry.backoff_cap_ms = 10_000;
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![Err(Error::Execution("send failed".into()))]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        price(&mut h.engine, id, 1.6e-6).await;
        h.engine.run_until_idle(IDLE).await;

        let p = h.engine.positions.get(&id).unwrap();
        // Ladder commit rolled back; the cycle still owns the position
        assert!(p.tp_levels_hit.is_empty());
        assert_eq!(p.sell_successes, 0);
        assert!(h.engine.selling.contains(&id));
    }

    #[tokio::test]
    async fn test_rate_limited_take_profit_aborts_cycle_with_cooldown() {
        let mut h = harness(MockExecutor::new(vec![Err(Error::RateLimited("429".into()))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        price(&mut h.engine, id, 1.6e-6).await;
        h.engine.run_until_idle(IDLE).await;

        // Lock released, cooldown armed, level rolled back
        assert!(!h.engine.selling.contains(&id));
        let eph = h.engine.ephemeral.get(&id).unwrap();
        assert!(eph.tp_cooldown_active(Instant::now()));
        assert_eq!(eph.consecutive_tp_rate_limits, 1);
        assert!(h.engine.positions.get(&id).unwrap().tp_levels_hit.is_empty());

        // Under cooldown the same price does not re-fire
        price(&mut h.engine, id, 1.6e-6).await;
        h.engine.run_until_idle(IDLE).await;
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_final_level_keeps_moon_bag() {
        let mut config = fast_config();
        config.take_profit.ladder = vec![
            TakeProfitLevel { multiplier: 1.5, sell_pct: 50.0 },
            TakeProfitLevel { multiplier: 2.0, sell_pct: 50.0 },
            TakeProfitLevel { multiplier: 3.0, sell_pct: 100.0 },
        ];
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![
                Ok(receipt(500_000, 750_000_000)), // level 0
                Ok(receipt(250_000, 500_000_000)), // level 1
                Ok(receipt(225_000, 675_000_000)), // level 2 minus moon bag
            ]),
            None,
            MockSource::healthy(PoolReserves { base: 1_000_000_000, quote: 10_000_000_000 }),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        for multiple in [1.6e-6, 2.1e-6, 3.1e-6] {
            // Clear the ladder cooldown between rungs
            if let Some(eph) = h.engine.ephemeral.get_mut(&id) {
                eph.tp_cooldown_until = None;
            }
            price(&mut h.engine, id, multiple).await;
            h.engine.run_until_idle(IDLE).await;
        }

        let p = h.engine.positions.get(&id).unwrap();
        assert_eq!(p.tp_levels_hit.len(), 3);
        assert_eq!(p.status, PositionStatus::PartialClose);
        // 10% of the 250k remaining before the final sell
        assert_eq!(p.token_amount_remaining, 25_000);
        assert!(p.sol_returned > p.sol_invested);
    }

    // -- emergencies -----------------------------------------------------

    #[tokio::test]
    async fn test_rug_event_forces_emergency_exit() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 100_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 21.0,
                kind: DrainKind::Cumulative,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Stopped);
        assert_eq!(closed.exit_reason, Some(ExitReason::RugPull));
        assert!((closed.sol_returned - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_emergency_wins() {
        let executor = MockExecutor::new(vec![Ok(receipt(1_000_000, 100_000_000))])
            .with_delay(Duration::from_millis(20));
        let mut h = harness(executor);
        let id = open_with_creator(&mut h.engine, 1.0e-6, 1_000_000, Some(Pubkey::new_unique()))
            .await;
        let token = h.engine.positions.get(&id).unwrap().token;
        let creator = h.engine.creator_of.get(&id).copied().unwrap();

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 60.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        // Second trigger lands while the first sell is in flight
        h.engine
            .handle_event(EngineEvent::Monitor(MonitorEvent::CreatorSell { wallet: creator }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        let closed = h.sink.closed_position();
        assert_eq!(closed.exit_reason, Some(ExitReason::RugPull));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_creator_sell_closes_all_creator_positions() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 200_000_000))]));
        let creator = Pubkey::new_unique();
        let id = open_with_creator(&mut h.engine, 1.0e-6, 1_000_000, Some(creator)).await;

        h.engine
            .handle_event(EngineEvent::Monitor(MonitorEvent::CreatorSell { wallet: creator }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        assert!(!h.engine.positions.contains_key(&id));
        assert_eq!(h.sink.closed_position().exit_reason, Some(ExitReason::CreatorSell));
    }

    // -- mutual exclusion and the zero-output rule -----------------------

    #[tokio::test]
    async fn test_one_sell_in_flight_per_position() {
        let executor = MockExecutor::new(vec![Ok(receipt(500_000, 750_000_000))])
            .with_delay(Duration::from_millis(30));
        let mut h = harness(executor);
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        // Two triggering ticks in a row; the second must find the lock held
        price(&mut h.engine, id, 1.6e-6).await;
        price(&mut h.engine, id, 1.7e-6).await;
        h.engine.run_until_idle(IDLE).await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.executor.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_output_is_never_a_success() {
        let mut config = fast_config();
        config.retry.backoff_base_ms = 10_000;
        config.retry.backoff_cap_ms = 10_000;
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![Ok(receipt(1_000_000, 0))]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;

        price(&mut h.engine, id, 0.6e-6).await; // hard stop
        h.engine.run_until_idle(IDLE).await;

        let p = h.engine.positions.get(&id).unwrap();
        assert_eq!(p.sell_successes, 0);
        assert_eq!(p.token_amount_remaining, 1_000_000);
        assert!((p.sol_returned).abs() < f64::EPSILON);
        assert!(!p.status.is_terminal());
        assert_eq!(h.engine.ephemeral.get(&id).unwrap().zero_output_failures, 1);
    }

    #[tokio::test]
    async fn test_dust_position_closed_without_selling() {
        let mut h = harness(MockExecutor::new(vec![]));
        let id = open(&mut h.engine, 1.0e-9, 1_000).await; // ~1e-6 SOL

        price(&mut h.engine, id, 0.5e-9).await; // hard stop territory
        h.engine.run_until_idle(IDLE).await;

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::Dust));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    // -- double execution ------------------------------------------------

    #[tokio::test]
    async fn test_double_execution_credits_sol_exactly_once() {
        // Both racing legs land: 600M + 400M lamports on a 1.0 SOL position
        let primary = MockExecutor::new(vec![Ok(receipt(1_000_000, 600_000_000))]);
        let fallback = MockExecutor::new(vec![Ok(receipt(1_000_000, 400_000_000))]);
        let mut h = harness_with(
            fast_config(),
            primary,
            Some(fallback),
            MockSource::healthy(PoolReserves { base: 1_000_000_000, quote: 10_000_000_000 }),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 55.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Stopped);
        // Exactly 1.0 SOL in, tokens debited once, never negative
        assert!((closed.sol_returned - 1.0).abs() < 1e-9);
        assert_eq!(closed.token_amount_remaining, 0);
        assert!((closed.pnl_absolute - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_late_fill_patches_closed_position_record() {
        let mut h = harness(MockExecutor::new(vec![]));
        let ghost = Uuid::new_v4();

        h.engine
            .handle_event(EngineEvent::LateFill {
                id: ghost,
                tokens_sold: 500_000,
                sol_out: 0.2,
            })
            .await;
        h.engine.run_until_idle(IDLE).await;

        let reconciled = h.sink.reconciled.lock().unwrap().clone();
        assert_eq!(reconciled, vec![(ghost, 500_000, 0.2)]);
    }

    // -- staleness and the grace period ----------------------------------

    #[tokio::test]
    async fn test_stale_feed_in_grace_accelerates_instead_of_firing() {
        let mut h = harness_with(
            fast_config(),
            MockExecutor::new(vec![Ok(receipt(1_000_000, 500_000_000))]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        // Four consecutive misses while still inside the grace period
        for consecutive in 1..=4 {
            h.engine
                .handle_event(EngineEvent::Feed(FeedEvent::StaleReading { token, consecutive }))
                .await;
        }
        h.engine.run_until_idle(IDLE).await;

        // No exit, but the counter accelerated
        assert!(h.engine.positions.contains_key(&id));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.engine.ephemeral.get(&id).unwrap().stale_bonus >= 2);

        // Past the grace period, fewer misses now suffice
        rewind_open_time(&mut h.engine, id, 120);
        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::StaleReading { token, consecutive: 2 }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        assert!(h.engine.positions.is_empty());
        assert_eq!(h.sink.closed_position().exit_reason, Some(ExitReason::StalePrice));
    }

    #[tokio::test]
    async fn test_sell_burst_in_grace_with_healthy_pool_is_ignored() {
        let mut h = harness(MockExecutor::new(vec![]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let pool = h.engine.positions.get(&id).unwrap().pool;

        h.engine
            .handle_event(EngineEvent::Monitor(MonitorEvent::SellBurst {
                pool,
                sells_in_window: 9,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        // Reserve read came back intact: no exit in the grace window
        assert!(h.engine.positions.contains_key(&id));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.positions.get(&id).unwrap().sell_burst_count, Some(1));
    }

    #[tokio::test]
    async fn test_in_grace_confirmation_read_is_time_bounded() {
        let mut config = fast_config();
        config.feed.read_timeout_ms = 20;
        let mut h = harness_with(config, MockExecutor::new(vec![]), None, MockSource::hanging());
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let pool = h.engine.positions.get(&id).unwrap().pool;

        // The confirmation read never answers; the loop must move on anyway
        let handled = tokio::time::timeout(
            Duration::from_millis(500),
            h.engine.handle_event(EngineEvent::Monitor(MonitorEvent::SellBurst {
                pool,
                sells_in_window: 9,
            })),
        )
        .await;
        assert!(handled.is_ok(), "hung reserve read stalled the event loop");

        // A timed-out read counts as an unreadable pool: staleness
        // accelerates, the position stays open, nothing was sold
        assert!(h.engine.ephemeral.get(&id).unwrap().stale_bonus >= 1);
        assert!(h.engine.positions.contains_key(&id));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sell_burst_past_grace_is_an_emergency() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 300_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let pool = h.engine.positions.get(&id).unwrap().pool;
        rewind_open_time(&mut h.engine, id, 120);

        h.engine
            .handle_event(EngineEvent::Monitor(MonitorEvent::SellBurst {
                pool,
                sells_in_window: 9,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        assert!(h.engine.positions.is_empty());
        assert_eq!(h.sink.closed_position().exit_reason, Some(ExitReason::SellBurst));
    }

    // -- market-structure exits ------------------------------------------

    #[tokio::test]
    async fn test_momentum_exit_on_one_sided_flow() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 900_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let pool = h.engine.positions.get(&id).unwrap().pool;

        // 12 sells against 3 buys: ratio 4, above the 3.0 threshold
        for _ in 0..12 {
            h.engine.pool_monitor.ingest(PoolLogEvent { pool, kind: PoolTxKind::Sell }).await;
        }
        for _ in 0..3 {
            h.engine.pool_monitor.ingest(PoolLogEvent { pool, kind: PoolTxKind::Buy }).await;
        }
        // Drain burst alerts the monitor pushed during ingestion
        h.engine.run_until_idle(Duration::from_millis(90)).await;

        if h.engine.positions.contains_key(&id) {
            price(&mut h.engine, id, 1.05e-6).await;
            h.engine.run_until_idle(IDLE).await;
        }

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        // The burst alarm (in grace, healthy pool read) is absorbed; the
        // momentum ratio is what fires on the next tick
        assert!(matches!(
            closed.exit_reason,
            Some(ExitReason::Momentum) | Some(ExitReason::SellBurst)
        ));
    }

    // -- retries and stranded recovery -----------------------------------

    #[tokio::test]
    async fn test_emergency_retries_then_recovers() {
        let mut config = fast_config();
        config.retry.max_attempts = 3;
        config.retry.max_rate_limit_retries = 3;
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![
                Err(Error::Execution("blockhash expired".into())),
                Ok(receipt(1_000_000, 400_000_000)),
            ]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 30.0,
                kind: DrainKind::Cumulative,
            }))
            .await;
        h.engine.run_until_idle(Duration::from_millis(120)).await;

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Stopped);
        assert_eq!(closed.exit_reason, Some(ExitReason::RugPull));
        assert!((closed.sol_returned - 0.4).abs() < 1e-9);
        assert_eq!(closed.sell_attempts, 2);
        assert_eq!(closed.sell_successes, 1);
    }

    #[tokio::test]
    async fn test_pool_drained_gives_up_fast_as_loss() {
        let mut h = harness_with(
            fast_config(),
            MockExecutor::new(vec![
                Err(Error::PoolDrained("empty".into())),
                Err(Error::PoolDrained("empty".into())),
                Err(Error::PoolDrained("empty".into())),
            ]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 80.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(Duration::from_millis(120)).await;

        // Two fast retries after the first failure, then the loss is real
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 3);
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Stopped);
        assert_eq!(closed.exit_reason, Some(ExitReason::RugPull));
        assert_eq!(closed.sol_returned, 0.0);
    }

    #[tokio::test]
    async fn test_stranded_position_recovers_on_later_attempt() {
        let mut config = fast_config();
        config.retry.max_attempts = 1;
        config.retry.max_rate_limit_retries = 1;
        config.retry.stranded_retry_interval_secs = 0; // immediate drumbeat
        config.retry.stranded_max_duration_secs = 1;
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![
                Err(Error::Execution("node down".into())),
                Ok(receipt(1_000_000, 300_000_000)),
            ]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 90.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(Duration::from_millis(150)).await;

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::Recovered));
        assert!((closed.sol_returned - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stranded_deadline_forces_timeout_close() {
        let mut config = fast_config();
        config.retry.max_attempts = 1;
        config.retry.max_rate_limit_retries = 1;
        config.retry.stranded_retry_interval_secs = 0;
        config.retry.stranded_max_duration_secs = 0; // deadline immediately
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![Err(Error::Execution("node down".into()))]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 90.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(Duration::from_millis(120)).await;

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        assert_eq!(closed.status, PositionStatus::Stopped);
        assert_eq!(closed.exit_reason, Some(ExitReason::StrandedTimeout));
        // Recorded loss is the full stake: nothing ever came back
        assert!((closed.pnl_absolute + closed.sol_invested).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_honeypot_detected_from_zero_output_pattern() {
        let mut config = fast_config();
        config.retry.max_attempts = 2;
        config.retry.max_rate_limit_retries = 2;
        config.retry.stranded_retry_interval_secs = 0;
        config.retry.stranded_max_duration_secs = 0;
        let mut h = harness_with(
            config,
            MockExecutor::new(vec![
                Ok(receipt(1_000_000, 0)),
                Ok(receipt(1_000_000, 0)),
            ]),
            None,
            MockSource::failing(),
        );
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 90.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(Duration::from_millis(150)).await;

        assert!(h.engine.positions.is_empty());
        let closed = h.sink.closed_position();
        assert_eq!(closed.exit_reason, Some(ExitReason::Honeypot));
        assert_eq!(closed.sell_successes, 0);
    }

    // -- bookkeeping invariants ------------------------------------------

    #[tokio::test]
    async fn test_poll_gate_balanced_across_cycle() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(500_000, 750_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        assert!(!h.engine.gate.is_paused());

        price(&mut h.engine, id, 1.5e-6).await;
        assert!(h.engine.gate.is_paused()); // attempt on the wire
        h.engine.run_until_idle(IDLE).await;
        assert!(!h.engine.gate.is_paused()); // settled, resumed
    }

    #[tokio::test]
    async fn test_terminal_close_evicts_all_registries() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 100_000_000))]));
        let creator = Pubkey::new_unique();
        let id = open_with_creator(&mut h.engine, 1.0e-6, 1_000_000, Some(creator)).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 90.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;

        assert!(h.engine.positions.is_empty());
        assert!(h.engine.ephemeral.is_empty());
        assert!(h.engine.by_token.is_empty());
        assert!(h.engine.by_pool.is_empty());
        assert!(h.engine.by_creator.is_empty());
        assert!(h.engine.selling.is_empty());
        assert!(h.engine.intents.is_empty());
        assert_eq!(h.engine.feed.monitored_count().await, 0);

        // Closed lifecycle event carries the final PnL
        let events = h.sink.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn test_price_updates_ignored_after_close() {
        let mut h = harness(MockExecutor::new(vec![Ok(receipt(1_000_000, 100_000_000))]));
        let id = open(&mut h.engine, 1.0e-6, 1_000_000).await;
        let token = h.engine.positions.get(&id).unwrap().token;

        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::RugPull {
                token,
                drop_pct: 90.0,
                kind: DrainKind::SingleTick,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;
        let calls = h.executor.calls.load(Ordering::SeqCst);

        // Straggler events for the evicted token are dropped silently
        h.engine
            .handle_event(EngineEvent::Feed(FeedEvent::PriceUpdate {
                token,
                price: 2.0e-6,
                reserve: None,
            }))
            .await;
        h.engine.run_until_idle(IDLE).await;
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_handle_queries_answered_while_engine_runs() {
        let executor = Arc::new(MockExecutor::new(vec![]));
        let sink = Arc::new(MockSink::default());
        let (engine, handle) = ExitEngine::new(
            fast_config(),
            executor,
            None,
            sink,
            Arc::new(MockSource::healthy(PoolReserves {
                base: 1_000_000_000,
                quote: 10_000_000_000,
            })),
            Arc::new(NullSubscriber),
        );
        let engine_task = tokio::spawn(engine.run());

        // Entry price matches the mocked reserves so the background poller
        // cannot trip a stop while the queries run
        handle
            .open_position(OpenRequest {
                token: Pubkey::new_unique(),
                pool: Pubkey::new_unique(),
                venue: Venue::PumpFun,
                symbol: "TEST".into(),
                entry_tx: None,
                creator: None,
                entry_price: 1.0e-8,
                token_amount: 1_000_000,
                sol_invested: 0.01,
                entry_reserve: Some(10_000_000_000),
                entry_authority: None,
            })
            .await
            .unwrap();

        // The queue is ordered, so the open is applied before the query
        assert_eq!(handle.open_count().await.unwrap(), 1);

        let snaps = handle.snapshots().await.unwrap();
        assert_eq!(snaps.len(), 1);
        let snap = handle.snapshot(snaps[0].id).await.unwrap();
        assert_eq!(snap.token_amount_remaining, 1_000_000);

        let missing = handle.snapshot(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(Error::PositionNotFound(_))));

        handle.shutdown().await;
        engine_task.await.unwrap();
    }
}
