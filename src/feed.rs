//! Price/reserve feed
//!
//! Polls venue reserves for every monitored token, batched per venue to
//! keep round trips down. Each reading is sanity-checked, then run through
//! three independent drain detectors (single-tick, cumulative-from-entry,
//! constant-product) plus a periodic authority re-check. The feed only
//! reports; the engine decides what is actionable.
//!
//! Delivery contract: events for a given token are emitted in reading
//! order on one mpsc channel. The whole poller is gated while any sell is
//! in flight because the RPC channel is shared and rate-limited.

use async_trait::async_trait;
use solana_sdk::native_token::LAMPORTS_PER_SOL;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::Result;
use crate::position::Venue;

/// Raw reserves of a pool: `base` in token units, `quote` in lamports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReserves {
    pub base: u64,
    pub quote: u64,
}

impl PoolReserves {
    /// Price in SOL per token unit
    pub fn price(&self) -> f64 {
        if self.base == 0 {
            return 0.0;
        }
        (self.quote as f64 / LAMPORTS_PER_SOL as f64) / self.base as f64
    }

    /// Constant product of the two reserves
    pub fn k(&self) -> f64 {
        self.base as f64 * self.quote as f64
    }
}

/// Mint/freeze authority state for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthorityState {
    pub mint_revoked: bool,
    pub freeze_revoked: bool,
}

/// Which authority came back from the dead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityKind {
    Mint,
    Freeze,
}

/// Which drain detector fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainKind {
    /// Reserve halved (or zeroed) within one tick
    SingleTick,
    /// Reserve bled past the threshold measured from the entry baseline
    Cumulative,
    /// K dropped: side-agnostic liquidity removal
    ConstantProduct,
}

/// Events pushed into the engine, in per-token reading order
#[derive(Debug, Clone)]
pub enum FeedEvent {
    PriceUpdate {
        token: Pubkey,
        price: f64,
        reserve: Option<u64>,
    },
    RugPull {
        token: Pubkey,
        drop_pct: f64,
        kind: DrainKind,
    },
    AuthorityReenabled {
        token: Pubkey,
        kind: AuthorityKind,
    },
    /// A failed or rejected reading; the engine applies the grace period
    StaleReading {
        token: Pubkey,
        consecutive: u32,
    },
}

/// Pool/price source supplied by the host process.
#[async_trait]
pub trait ReserveSource: Send + Sync {
    /// Batched reserve read for pools on one venue, one entry per pool in
    /// input order. `None` marks a pool that could not be read.
    async fn get_reserves(
        &self,
        venue: Venue,
        pools: &[Pubkey],
    ) -> Result<Vec<Option<PoolReserves>>>;

    /// Current mint/freeze authority state for a token.
    async fn get_authority_state(&self, token: Pubkey) -> Result<AuthorityState>;
}

/// Shared gate pausing the poller while any sell is in flight.
#[derive(Clone, Default)]
pub struct PollGate(Arc<AtomicUsize>);

impl PollGate {
    pub fn pause(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unbalanced PollGate::resume");
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Per-token feed state
#[derive(Debug)]
struct FeedState {
    pool: Pubkey,
    venue: Venue,
    last_price: Option<f64>,
    consecutive_failures: u32,
    /// Quote reserve at entry, the drain baseline
    baseline_reserve: Option<u64>,
    baseline_k: Option<f64>,
    /// Previous-tick quote reserve for single-tick drop detection
    prev_reserve: Option<u64>,
    fast_poll_until: Option<Instant>,
    next_poll_at: Instant,
    entry_authority: Option<AuthorityState>,
    tick_count: u32,
    rug_fired: bool,
}

impl FeedState {
    fn new(
        pool: Pubkey,
        venue: Venue,
        initial_reserve: Option<u64>,
        entry_authority: Option<AuthorityState>,
        now: Instant,
    ) -> Self {
        Self {
            pool,
            venue,
            last_price: None,
            consecutive_failures: 0,
            baseline_reserve: initial_reserve,
            baseline_k: None,
            prev_reserve: initial_reserve,
            fast_poll_until: None,
            next_poll_at: now,
            entry_authority,
            tick_count: 0,
            rug_fired: false,
        }
    }

    fn fast_polling(&self, now: Instant) -> bool {
        self.fast_poll_until.map(|t| now < t).unwrap_or(false)
    }

    /// Fold one reading into the state, producing zero or more events.
    fn ingest(
        &mut self,
        token: Pubkey,
        config: &FeedConfig,
        reading: Option<PoolReserves>,
        now: Instant,
    ) -> Vec<FeedEvent> {
        self.tick_count = self.tick_count.wrapping_add(1);
        let mut events = Vec::new();

        let reserves = match reading {
            Some(r) => r,
            None => {
                self.consecutive_failures += 1;
                events.push(FeedEvent::StaleReading {
                    token,
                    consecutive: self.consecutive_failures,
                });
                return events;
            }
        };

        // A pool that previously held real liquidity and now reads exactly
        // zero is an instant rug, not a bad reading.
        if reserves.quote == 0 {
            if !self.rug_fired
                && self
                    .prev_reserve
                    .map(|p| p >= config.min_reserve_units)
                    .unwrap_or(false)
            {
                self.rug_fired = true;
                events.push(FeedEvent::RugPull {
                    token,
                    drop_pct: 100.0,
                    kind: DrainKind::SingleTick,
                });
                self.prev_reserve = Some(0);
                return events;
            }
            self.consecutive_failures += 1;
            events.push(FeedEvent::StaleReading {
                token,
                consecutive: self.consecutive_failures,
            });
            return events;
        }

        // Near-zero reserves on either side blow up the price division
        if reserves.base < config.min_reserve_units || reserves.quote < config.min_reserve_units {
            warn!(token = %token, base = reserves.base, quote = reserves.quote,
                "Rejecting near-zero reserve reading");
            self.consecutive_failures += 1;
            events.push(FeedEvent::StaleReading {
                token,
                consecutive: self.consecutive_failures,
            });
            return events;
        }

        // Implausible one-tick price jump: bad decode or RPC lag artifact
        let price = reserves.price();
        if let Some(last) = self.last_price {
            if last > 0.0 {
                let jump = price / last;
                if jump > config.max_price_jump || jump < config.min_price_jump {
                    warn!(token = %token, last, price, "Rejecting implausible price jump");
                    self.consecutive_failures += 1;
                    events.push(FeedEvent::StaleReading {
                        token,
                        consecutive: self.consecutive_failures,
                    });
                    return events;
                }
            }
        }

        self.consecutive_failures = 0;

        // Single-tick drain, independent of the cumulative check
        if let Some(prev) = self.prev_reserve {
            if prev >= config.min_reserve_units {
                let drop_pct = (prev as f64 - reserves.quote as f64) / prev as f64 * 100.0;
                if drop_pct >= config.instant_drop_pct && !self.rug_fired {
                    self.rug_fired = true;
                    events.push(FeedEvent::RugPull {
                        token,
                        drop_pct,
                        kind: DrainKind::SingleTick,
                    });
                }
            }
        }

        // Baselines are set on the first good reading when registration
        // did not supply them
        let baseline = *self.baseline_reserve.get_or_insert(reserves.quote);
        let baseline_k = *self.baseline_k.get_or_insert_with(|| reserves.k());

        // Cumulative drain from the entry baseline
        if baseline > 0 && !self.rug_fired {
            let drop_pct = (baseline as f64 - reserves.quote as f64) / baseline as f64 * 100.0;
            if drop_pct >= config.rug_drop_pct {
                self.rug_fired = true;
                events.push(FeedEvent::RugPull {
                    token,
                    drop_pct,
                    kind: DrainKind::Cumulative,
                });
            } else if drop_pct >= config.fast_poll_trigger_drop_pct && !self.fast_polling(now) {
                info!(token = %token, drop_pct = format!("{:.1}", drop_pct),
                    "Partial drain, switching to fast poll");
                self.fast_poll_until =
                    Some(now + Duration::from_secs(config.fast_poll_duration_secs));
            }
        }

        // Constant-product drain: normal trading holds K flat or grows it
        if baseline_k > 0.0 && !self.rug_fired {
            let k_drop_pct = (baseline_k - reserves.k()) / baseline_k * 100.0;
            if k_drop_pct >= config.k_drop_pct {
                self.rug_fired = true;
                events.push(FeedEvent::RugPull {
                    token,
                    drop_pct: k_drop_pct,
                    kind: DrainKind::ConstantProduct,
                });
            }
        }

        self.prev_reserve = Some(reserves.quote);
        self.last_price = Some(price);
        events.push(FeedEvent::PriceUpdate {
            token,
            price,
            reserve: Some(reserves.quote),
        });
        events
    }
}

/// Polling reserve feed over a [`ReserveSource`]
pub struct ReserveFeed {
    config: FeedConfig,
    source: Arc<dyn ReserveSource>,
    states: Arc<RwLock<HashMap<Pubkey, FeedState>>>,
    events_tx: mpsc::Sender<FeedEvent>,
    gate: PollGate,
    shutdown: broadcast::Sender<()>,
}

impl ReserveFeed {
    pub fn new(
        config: FeedConfig,
        source: Arc<dyn ReserveSource>,
        events_tx: mpsc::Sender<FeedEvent>,
        gate: PollGate,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            source,
            states: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            gate,
            shutdown,
        }
    }

    /// Register a token for polling.
    pub async fn add_token(
        &self,
        token: Pubkey,
        pool: Pubkey,
        venue: Venue,
        initial_reserve: Option<u64>,
        initial_authority: Option<AuthorityState>,
    ) {
        let mut states = self.states.write().await;
        states.insert(
            token,
            FeedState::new(pool, venue, initial_reserve, initial_authority, Instant::now()),
        );
        info!(token = %token, pool = %pool, venue = %venue, "Added token to reserve feed");
    }

    /// Stop polling a token.
    pub async fn remove_token(&self, token: &Pubkey) {
        let mut states = self.states.write().await;
        if states.remove(token).is_some() {
            info!(token = %token, "Removed token from reserve feed");
        }
    }

    pub async fn monitored_count(&self) -> usize {
        self.states.read().await.len()
    }

    /// Start the polling loop. The loop ticks at the fast-poll granularity
    /// and each token carries its own due time, so fast-polled tokens are
    /// read more often without a second timer.
    pub fn start(&self) {
        let config = self.config.clone();
        let source = self.source.clone();
        let states = self.states.clone();
        let events_tx = self.events_tx.clone();
        let gate = self.gate.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let tick = Duration::from_millis(
            (self.config.poll_interval_ms / self.config.fast_poll_multiplier as u64).max(1),
        );

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if gate.is_paused() {
                            continue;
                        }
                        Self::poll_once(&config, &source, &states, &events_tx).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Reserve feed shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    async fn poll_once(
        config: &FeedConfig,
        source: &Arc<dyn ReserveSource>,
        states: &Arc<RwLock<HashMap<Pubkey, FeedState>>>,
        events_tx: &mpsc::Sender<FeedEvent>,
    ) {
        let now = Instant::now();
        let normal_interval = Duration::from_millis(config.poll_interval_ms);
        let fast_interval = normal_interval / config.fast_poll_multiplier;

        // Collect due tokens grouped by venue for batched reads
        let mut by_venue: HashMap<Venue, Vec<(Pubkey, Pubkey)>> = HashMap::new();
        {
            let guard = states.read().await;
            for (token, state) in guard.iter() {
                if now >= state.next_poll_at {
                    by_venue
                        .entry(state.venue)
                        .or_default()
                        .push((*token, state.pool));
                }
            }
        }
        if by_venue.is_empty() {
            return;
        }

        let read_timeout = Duration::from_millis(config.read_timeout_ms);
        for (venue, entries) in by_venue {
            let pools: Vec<Pubkey> = entries.iter().map(|(_, pool)| *pool).collect();
            let readings = match timeout(read_timeout, source.get_reserves(venue, &pools)).await {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    warn!(venue = %venue, error = %e, "Batched reserve read failed");
                    vec![None; pools.len()]
                }
                Err(_) => {
                    warn!(venue = %venue, timeout_ms = config.read_timeout_ms,
                        "Batched reserve read timed out");
                    vec![None; pools.len()]
                }
            };

            let mut pending = Vec::new();
            let mut authority_checks = Vec::new();
            {
                let mut guard = states.write().await;
                for ((token, _pool), reading) in entries.iter().zip(readings) {
                    let state = match guard.get_mut(token) {
                        Some(s) => s,
                        None => continue, // removed while we were reading
                    };
                    pending.extend(state.ingest(*token, config, reading, now));

                    let interval = if state.fast_polling(now) {
                        fast_interval
                    } else {
                        normal_interval
                    };
                    state.next_poll_at = now + interval;

                    if config.authority_recheck_ticks > 0
                        && state.tick_count % config.authority_recheck_ticks == 0
                    {
                        if let Some(entry_auth) = state.entry_authority {
                            authority_checks.push((*token, entry_auth));
                        }
                    }
                }
            }

            // Sends go out with the registry guard dropped: a backed-up
            // channel must never block add/remove on the registry.
            for event in pending {
                if events_tx.send(event).await.is_err() {
                    debug!("Feed event channel closed");
                    return;
                }
            }

            // Authority re-checks go out after the batched read so a slow
            // RPC here never delays price delivery
            for (token, entry_auth) in authority_checks {
                match source.get_authority_state(token).await {
                    Ok(current) => {
                        let mut reenabled = Vec::new();
                        if entry_auth.mint_revoked && !current.mint_revoked {
                            reenabled.push(AuthorityKind::Mint);
                        }
                        if entry_auth.freeze_revoked && !current.freeze_revoked {
                            reenabled.push(AuthorityKind::Freeze);
                        }
                        for kind in reenabled {
                            warn!(token = %token, ?kind, "Revoked authority is active again");
                            if events_tx
                                .send(FeedEvent::AuthorityReenabled { token, kind })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!(token = %token, error = %e, "Authority re-check failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_baseline(baseline: u64) -> FeedState {
        let mut state = FeedState::new(
            Pubkey::new_unique(),
            Venue::PumpFun,
            Some(baseline),
            None,
            Instant::now(),
        );
        // Seed K/price from a first clean reading at the baseline
        let _ = state.ingest(
            Pubkey::new_unique(),
            &FeedConfig::default(),
            Some(PoolReserves { base: 1_000_000_000, quote: baseline }),
            Instant::now(),
        );
        state
    }

    fn ingest(state: &mut FeedState, reading: Option<PoolReserves>) -> Vec<FeedEvent> {
        state.ingest(Pubkey::new_unique(), &FeedConfig::default(), reading, Instant::now())
    }

    fn rug_kind(events: &[FeedEvent]) -> Option<DrainKind> {
        events.iter().find_map(|e| match e {
            FeedEvent::RugPull { kind, .. } => Some(*kind),
            _ => None,
        })
    }

    #[test]
    fn test_cumulative_drain_boundary() {
        // 19.9% drop from entry: no rug. 20.0%: rug.
        // Base grows as price falls so K stays flat: only the quote-side
        // cumulative check is under test here.
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_250_000_000, quote: 8_010_000_000 }),
        );
        assert_eq!(rug_kind(&events), None);

        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_250_000_000, quote: 8_000_000_000 }),
        );
        assert_eq!(rug_kind(&events), Some(DrainKind::Cumulative));
    }

    #[test]
    fn test_confirmed_rug_at_21_pct() {
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_270_000_000, quote: 7_900_000_000 }),
        );
        match events.first() {
            Some(FeedEvent::RugPull { drop_pct, kind, .. }) => {
                assert_eq!(*kind, DrainKind::Cumulative);
                assert!((drop_pct - 21.0).abs() < 0.01);
            }
            other => panic!("expected rug pull, got {:?}", other),
        }
    }

    #[test]
    fn test_single_tick_drain_boundary() {
        // Exactly 50% within one tick fires; 49.9% does not. The other
        // detectors are parked on matching baselines so only the
        // single-tick rule is in play.
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 2_000_000_000, quote: 5_000_000_000 }),
        );
        assert_eq!(rug_kind(&events), Some(DrainKind::SingleTick));

        let mut state = state_with_baseline(10_000_000_000);
        state.baseline_reserve = Some(5_010_000_000);
        state.baseline_k = Some(0.0);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 2_000_000_000, quote: 5_010_000_000 }),
        );
        assert_eq!(rug_kind(&events), None);
    }

    #[test]
    fn test_zero_reserve_after_liquidity_is_instant_rug() {
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_000_000_000, quote: 0 }),
        );
        match events.first() {
            Some(FeedEvent::RugPull { drop_pct, kind, .. }) => {
                assert_eq!(*kind, DrainKind::SingleTick);
                assert_eq!(*drop_pct, 100.0);
            }
            other => panic!("expected instant rug, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_product_drain() {
        // Quote dips 10% (below the 20% cumulative threshold) while base
        // also shrinks: K drops ~19%, the side-agnostic signal fires.
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 900_000_000, quote: 9_000_000_000 }),
        );
        assert_eq!(rug_kind(&events), Some(DrainKind::ConstantProduct));
    }

    #[test]
    fn test_fast_poll_band() {
        // A 10% quote drop with K held flat arms fast-poll without a rug
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_112_000_000, quote: 9_000_000_000 }),
        );
        assert_eq!(rug_kind(&events), None);
        assert!(state.fast_polling(Instant::now()));
    }

    #[test]
    fn test_staleness_counter_and_reset() {
        let mut state = state_with_baseline(10_000_000_000);
        for expected in 1..=3u32 {
            let events = ingest(&mut state, None);
            match events.first() {
                Some(FeedEvent::StaleReading { consecutive, .. }) => {
                    assert_eq!(*consecutive, expected)
                }
                other => panic!("expected stale reading, got {:?}", other),
            }
        }
        // A good reading resets the counter
        let _ = ingest(
            &mut state,
            Some(PoolReserves { base: 1_000_000_000, quote: 9_900_000_000 }),
        );
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_implausible_jump_rejected() {
        let mut state = state_with_baseline(10_000_000_000);
        // 100x the previous price within one tick: rejected as a failure
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 10_000_000, quote: 10_000_000_000 }),
        );
        assert!(matches!(
            events.first(),
            Some(FeedEvent::StaleReading { consecutive: 1, .. })
        ));
    }

    #[test]
    fn test_price_update_carries_reserve() {
        let mut state = state_with_baseline(10_000_000_000);
        let events = ingest(
            &mut state,
            Some(PoolReserves { base: 1_000_000_000, quote: 9_900_000_000 }),
        );
        match events.last() {
            Some(FeedEvent::PriceUpdate { price, reserve, .. }) => {
                assert!(*price > 0.0);
                assert_eq!(*reserve, Some(9_900_000_000));
            }
            other => panic!("expected price update, got {:?}", other),
        }
    }

    struct StaticSource {
        reserves: PoolReserves,
    }

    #[async_trait]
    impl ReserveSource for StaticSource {
        async fn get_reserves(
            &self,
            _venue: Venue,
            pools: &[Pubkey],
        ) -> Result<Vec<Option<PoolReserves>>> {
            Ok(pools.iter().map(|_| Some(self.reserves)).collect())
        }

        async fn get_authority_state(&self, _token: Pubkey) -> Result<AuthorityState> {
            Ok(AuthorityState { mint_revoked: true, freeze_revoked: true })
        }
    }

    #[tokio::test]
    async fn test_polling_loop_emits_updates_and_respects_gate() {
        let config = FeedConfig {
            poll_interval_ms: 20,
            ..FeedConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(64);
        let gate = PollGate::default();
        let feed = ReserveFeed::new(
            config,
            Arc::new(StaticSource {
                reserves: PoolReserves { base: 1_000_000_000, quote: 10_000_000_000 },
            }),
            tx,
            gate.clone(),
        );

        feed.add_token(Pubkey::new_unique(), Pubkey::new_unique(), Venue::PumpFun, None, None)
            .await;
        feed.start();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("poller should emit within the interval")
            .unwrap();
        assert!(matches!(event, FeedEvent::PriceUpdate { .. }));

        // Paused gate: the poller must go quiet
        gate.pause();
        tokio::time::sleep(Duration::from_millis(60)).await;
        while rx.try_recv().is_ok() {} // drain anything in flight
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        gate.resume();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("poller should resume")
            .unwrap();
        assert!(matches!(event, FeedEvent::PriceUpdate { .. }));

        feed.stop();
    }

    #[tokio::test]
    async fn test_backed_up_channel_does_not_hold_registry_lock() {
        let config = FeedConfig {
            poll_interval_ms: 10,
            ..FeedConfig::default()
        };
        // Capacity 1 and nothing draining: the poller fills the channel and
        // blocks in send on the next reading
        let (tx, rx) = mpsc::channel(1);
        let feed = ReserveFeed::new(
            config,
            Arc::new(StaticSource {
                reserves: PoolReserves { base: 1_000_000_000, quote: 10_000_000_000 },
            }),
            tx,
            PollGate::default(),
        );

        let token = Pubkey::new_unique();
        feed.add_token(token, Pubkey::new_unique(), Venue::PumpFun, None, None).await;
        feed.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Registry writes must never wait on the event channel
        let removed =
            tokio::time::timeout(Duration::from_millis(500), feed.remove_token(&token)).await;
        assert!(removed.is_ok(), "remove_token blocked behind a full event channel");
        assert_eq!(feed.monitored_count().await, 0);

        feed.stop();
        drop(rx);
    }
}
