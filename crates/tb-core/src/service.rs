//! Background service on tokio
//!
//! Owns the [`TrackerState`] behind an async mutex and drives the pure
//! handlers in [`crate::dispatch`]. Three tasks run until
//! [`BackgroundService::shutdown`]:
//!
//! - the writer, which serializes all store writes, coalescing queued key
//!   sets and encoding the state as it is at write time
//! - the re-check loop, which flushes accrual and notifies threshold
//!   crossings
//! - the sweep loop, which refreshes the state from the store and applies
//!   day rollover
//!
//! Every store call is bounded by the configured timeout. A failed or
//! timed-out call is logged and the in-memory state stays authoritative.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::dispatch::{handle_event, handle_message, handle_tick, BrowserEvent, Effect, Message, Reply};
use crate::engine::BlockDecisionEngine;
use crate::error::{Error, Result};
use crate::state::{decode, encode, StateKeys, StoredState, TrackerState, ALL_KEYS};
use crate::store::{StateStore, StoreMap};
use crate::types::{Decision, Millis, TabId};

// =============================================================================
// Collaborators
// =============================================================================

/// Source of "now".
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Millis;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: Millis) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Millis) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Millis) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.0.load(Ordering::SeqCst)
    }
}

impl<C: Clock> Clock for Arc<C> {
    fn now(&self) -> Millis {
        (**self).now()
    }
}

/// Carries out the visible effects: tab redirects and content-script
/// notifications.
pub trait Presenter: Send + Sync + 'static {
    fn redirect_tab(&self, tab_id: TabId, url: &str);
    fn notify(&self, tab_id: TabId, decision: &Decision);
}

impl<P: Presenter> Presenter for Arc<P> {
    fn redirect_tab(&self, tab_id: TabId, url: &str) {
        (**self).redirect_tab(tab_id, url)
    }

    fn notify(&self, tab_id: TabId, decision: &Decision) {
        (**self).notify(tab_id, decision)
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared<S, P, C> {
    state: Mutex<TrackerState>,
    store: S,
    presenter: P,
    clock: C,
    config: TrackerConfig,
    engine: BlockDecisionEngine,
    writes: mpsc::UnboundedSender<StateKeys>,
    /// Write requests queued and not yet attempted
    pending_writes: AtomicUsize,
    /// Total write requests ever queued
    queued_writes: AtomicU64,
    /// `StateKeys` bits whose last write failed
    unsaved: AtomicU8,
}

impl<S, P, C> Shared<S, P, C>
where
    S: StateStore + 'static,
    P: Presenter,
    C: Clock,
{
    /// Queue a write. Call with the state lock held so a concurrent
    /// refresh sees the request.
    fn enqueue(&self, keys: StateKeys) {
        if keys.is_empty() {
            return;
        }
        self.pending_writes.fetch_add(1, Ordering::SeqCst);
        self.queued_writes.fetch_add(1, Ordering::SeqCst);
        if self.writes.send(keys).is_err() {
            self.pending_writes.fetch_sub(1, Ordering::SeqCst);
            debug!("Writer is gone, dropping write of {:?}", keys);
        }
    }

    /// Queue the persist effects and return the rest. Must be called with
    /// the state lock held.
    fn take_visible(&self, effects: Vec<Effect>) -> Vec<Effect> {
        effects
            .into_iter()
            .filter(|effect| match effect {
                Effect::Persist(keys) => {
                    self.enqueue(*keys);
                    false
                }
                _ => true,
            })
            .collect()
    }

    fn present(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RedirectTab { tab_id, url } => self.presenter.redirect_tab(tab_id, &url),
                Effect::Notify { tab_id, decision } => self.presenter.notify(tab_id, &decision),
                Effect::Persist(keys) => self.enqueue(keys),
            }
        }
    }

    async fn store_get(&self) -> Result<StoreMap> {
        match tokio::time::timeout(self.config.store_timeout(), self.store.get(&ALL_KEYS)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "read timed out after {}ms",
                self.config.store_timeout_ms
            ))),
        }
    }

    async fn store_set(&self, items: StoreMap) -> Result<()> {
        match tokio::time::timeout(self.config.store_timeout(), self.store.set(items)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "write timed out after {}ms",
                self.config.store_timeout_ms
            ))),
        }
    }

    fn unsaved(&self) -> StateKeys {
        StateKeys::from_bits_truncate(self.unsaved.load(Ordering::SeqCst))
    }

    /// Encode the current state for `keys`, plus anything a failed write
    /// left behind, and write it.
    async fn write(&self, keys: StateKeys) {
        let keys = keys | self.unsaved();
        let items = {
            let state = self.state.lock().await;
            encode(&state, keys)
        };
        match self.store_set(items).await {
            Ok(()) => {
                self.unsaved.fetch_and(!keys.bits(), Ordering::SeqCst);
                debug!("Persisted {:?}", keys);
            }
            Err(e) => {
                self.unsaved.fetch_or(keys.bits(), Ordering::SeqCst);
                warn!("Keeping in-memory state, write failed: {}", e);
            }
        }
    }

    async fn tick(&self) {
        let now = self.clock.now();
        let visible = {
            let mut state = self.state.lock().await;
            let effects = handle_tick(&mut state, &self.engine, now);
            self.take_visible(effects)
        };
        self.present(visible);
    }

    /// Re-read the store, then roll counters over to today.
    async fn sweep(&self) {
        let queued_before = self.queued_writes.load(Ordering::SeqCst);
        let stored = match self.store_get().await {
            Ok(map) => Some(decode_logged(&map)),
            Err(e) => {
                warn!("Keeping in-memory state, refresh failed: {}", e);
                None
            }
        };

        let now = self.clock.now();
        let today = self.engine.today(now);
        let mut state = self.state.lock().await;

        // Changes a failed write never saved are newer than the store
        let unsaved = self.unsaved();
        if !unsaved.is_empty() {
            debug!("Retrying unsaved {:?}", unsaved);
            self.enqueue(unsaved);
        }

        if let Some(stored) = stored {
            // Our own unwritten changes are newer than what was read
            let idle = unsaved.is_empty()
                && self.pending_writes.load(Ordering::SeqCst) == 0
                && self.queued_writes.load(Ordering::SeqCst) == queued_before;
            if idle {
                if state.apply_stored(stored, now, &today).is_some() {
                    self.enqueue(StateKeys::WEBSITES);
                }
            } else {
                debug!("Skipping refresh, local writes in flight");
            }
        }

        if state.budgets.roll_over_all(&today) {
            info!("Rolled tracked websites over to {}", today);
            self.enqueue(StateKeys::WEBSITES);
        }
    }
}

fn decode_logged(map: &StoreMap) -> StoredState {
    let (stored, problems) = decode(map);
    for problem in problems {
        warn!("Skipping stored record: {}", problem);
    }
    stored
}

// =============================================================================
// Tasks
// =============================================================================

async fn run_writer<S, P, C>(
    shared: Arc<Shared<S, P, C>>,
    mut rx: mpsc::UnboundedReceiver<StateKeys>,
    cancel_token: CancellationToken,
) where
    S: StateStore + 'static,
    P: Presenter,
    C: Clock,
{
    loop {
        let first = tokio::select! {
            next = rx.recv() => match next {
                Some(keys) => keys,
                None => break,
            },
            _ = cancel_token.cancelled() => break,
        };
        let (keys, count) = coalesce(first, &mut rx);
        shared.write(keys).await;
        shared.pending_writes.fetch_sub(count, Ordering::SeqCst);
    }

    // Flush whatever was queued before shutdown
    let (keys, count) = coalesce(StateKeys::empty(), &mut rx);
    if !keys.is_empty() {
        shared.write(keys).await;
    }
    shared.pending_writes.fetch_sub(count.saturating_sub(1), Ordering::SeqCst);
    info!("State writer stopped");
}

/// Merge every queued key set into `first`. Returns the union and the
/// number of requests it covers.
fn coalesce(first: StateKeys, rx: &mut mpsc::UnboundedReceiver<StateKeys>) -> (StateKeys, usize) {
    let mut keys = first;
    let mut count = 1;
    while let Ok(more) = rx.try_recv() {
        keys |= more;
        count += 1;
    }
    (keys, count)
}

async fn run_recheck<S, P, C>(shared: Arc<Shared<S, P, C>>, cancel_token: CancellationToken)
where
    S: StateStore + 'static,
    P: Presenter,
    C: Clock,
{
    let period = shared.config.recheck_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.tick().await,
            _ = cancel_token.cancelled() => {
                info!("Re-check loop shutting down");
                break;
            }
        }
    }
}

async fn run_sweep<S, P, C>(shared: Arc<Shared<S, P, C>>, cancel_token: CancellationToken)
where
    S: StateStore + 'static,
    P: Presenter,
    C: Clock,
{
    let period = shared.config.sweep_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.sweep().await,
            _ = cancel_token.cancelled() => {
                info!("Sweep loop shutting down");
                break;
            }
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// The background context: single owner and writer of the state.
pub struct BackgroundService<S, P, C = SystemClock> {
    shared: Arc<Shared<S, P, C>>,
    cancel_token: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    writer_token: CancellationToken,
    writer: JoinHandle<()>,
}

impl<S, P, C> BackgroundService<S, P, C>
where
    S: StateStore + 'static,
    P: Presenter,
    C: Clock,
{
    /// Load the state from `store` and start the background tasks.
    ///
    /// A store that fails or times out yields an empty state.
    pub async fn start(store: S, presenter: P, clock: C, config: TrackerConfig) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        let engine = BlockDecisionEngine::new(&config);
        let shared = Arc::new(Shared {
            state: Mutex::new(TrackerState::new()),
            store,
            presenter,
            clock,
            config,
            engine,
            writes,
            pending_writes: AtomicUsize::new(0),
            queued_writes: AtomicU64::new(0),
            unsaved: AtomicU8::new(0),
        });

        match shared.store_get().await {
            Ok(map) => {
                let now = shared.clock.now();
                let today = engine.today(now);
                let mut state = shared.state.lock().await;
                *state = TrackerState::from_stored(decode_logged(&map), now, &today);
                if state.budgets.roll_over_all(&today) {
                    shared.enqueue(StateKeys::WEBSITES);
                }
                info!(
                    "Loaded {} blocked sites and {} tracked websites",
                    state.blocked.len(),
                    state.budgets.len()
                );
            }
            Err(e) => warn!("Starting with empty state, load failed: {}", e),
        }

        let writer_token = CancellationToken::new();
        let writer = tokio::spawn(run_writer(shared.clone(), rx, writer_token.clone()));
        let cancel_token = CancellationToken::new();
        let loops = vec![
            tokio::spawn(run_recheck(shared.clone(), cancel_token.clone())),
            tokio::spawn(run_sweep(shared.clone(), cancel_token.clone())),
        ];
        info!("Background service started");

        Self {
            shared,
            cancel_token,
            loops,
            writer_token,
            writer,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    pub async fn handle_event(&self, event: &BrowserEvent) {
        let visible = {
            let mut state = self.shared.state.lock().await;
            let effects = handle_event(&mut state, &self.shared.engine, &self.shared.config, event);
            self.shared.take_visible(effects)
        };
        self.shared.present(visible);
    }

    pub async fn handle_message(&self, message: &Message) -> Reply {
        let now = self.shared.clock.now();
        let (reply, visible) = {
            let mut state = self.shared.state.lock().await;
            let (reply, effects) = handle_message(&mut state, &self.shared.engine, message, now);
            (reply, self.shared.take_visible(effects))
        };
        self.shared.present(visible);
        reply
    }

    /// Decision for `hostname` now, without side effects.
    pub async fn decide(&self, hostname: &str) -> Decision {
        let now = self.shared.clock.now();
        let state = self.shared.state.lock().await;
        self.shared.engine.decide(&state, hostname, now)
    }

    /// Run one re-check immediately.
    pub async fn tick(&self) {
        self.shared.tick().await;
    }

    /// Run one sweep immediately.
    pub async fn sweep(&self) {
        self.shared.sweep().await;
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> TrackerState {
        self.shared.state.lock().await.clone()
    }

    /// Record accrued time, flush queued writes and stop every task. No
    /// task runs once this returns.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!("Background task failed to join: {}", e);
            }
        }

        // Loops are gone, so the writer sees every remaining request
        self.shared.tick().await;
        self.writer_token.cancel();
        if let Err(e) = self.writer.await {
            warn!("State writer failed to join: {}", e);
        }
        info!("Background service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{DayKey, TrackedWebsite, MS_PER_MINUTE};
    use serde_json::{json, Value};
    use std::future::Future;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const T0: Millis = 1_792_152_000_000; // 2026-10-16T12:00:00Z

    #[derive(Debug, Default)]
    struct RecordingPresenter {
        seen: StdMutex<Vec<String>>,
    }

    impl RecordingPresenter {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Presenter for RecordingPresenter {
        fn redirect_tab(&self, tab_id: TabId, url: &str) {
            self.seen.lock().unwrap().push(format!("redirect {tab_id} {url}"));
        }

        fn notify(&self, tab_id: TabId, decision: &Decision) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("notify {tab_id} {}", decision.kind()));
        }
    }

    /// Store whose calls never finish in time.
    struct StalledStore;

    impl StateStore for StalledStore {
        fn get(&self, _keys: &[&str]) -> impl Future<Output = Result<StoreMap>> + Send {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StoreMap::new())
            }
        }

        fn set(&self, _items: StoreMap) -> impl Future<Output = Result<()>> + Send {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }
    }

    fn quiet_config() -> TrackerConfig {
        // Periodic tasks stay out of the way unless a test wants them
        TrackerConfig {
            recheck_interval_ms: 3_600_000,
            sweep_interval_ms: 3_600_000,
            store_timeout_ms: 50,
            ..TrackerConfig::default()
        }
    }

    fn store_with(value: Value) -> Arc<MemoryStore> {
        match value {
            Value::Object(map) => Arc::new(MemoryStore::with_items(map)),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_start_loads_state() {
        let store = store_with(json!({
            "blockedSites": ["example.com"],
            "websites": [{"domain": "video.org", "timeLimit": 30, "timeSpent": 28, "dayKey": "2026-10-16"}]
        }));
        let presenter = Arc::new(RecordingPresenter::default());
        let service =
            BackgroundService::start(store, presenter, ManualClock::new(T0), quiet_config()).await;

        assert_eq!(
            service.decide("www.example.com").await,
            Decision::BlockPermanent {
                domain: "example.com".into()
            }
        );
        assert_eq!(service.decide("video.org").await.kind(), "warn");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_navigation_redirects_and_persists_count() {
        let store = store_with(json!({"blockedSites": ["example.com"]}));
        let presenter = Arc::new(RecordingPresenter::default());
        let service = BackgroundService::start(
            store.clone(),
            presenter.clone(),
            ManualClock::new(T0),
            quiet_config(),
        )
        .await;

        service
            .handle_event(&BrowserEvent::NavigationAttempt {
                tab_id: 4,
                hostname: "example.com".into(),
                is_top_level_frame: true,
                timestamp: T0,
            })
            .await;
        service.shutdown().await;

        assert_eq!(presenter.seen(), vec!["redirect 4 blocked.html"]);
        let stored = store.snapshot();
        assert_eq!(stored["todayBlockedCount"], json!(1));
        assert_eq!(stored["lastBlockedDate"], json!("2026-10-16"));
    }

    #[tokio::test]
    async fn test_messages_are_written_through() {
        let store = Arc::new(MemoryStore::new());
        let service = BackgroundService::start(
            store.clone(),
            Arc::new(RecordingPresenter::default()),
            ManualClock::new(T0),
            quiet_config(),
        )
        .await;

        let reply = service
            .handle_message(&Message::AddBlockedSite {
                site: "https://www.Example.com/".into(),
            })
            .await;
        assert_eq!(reply, Reply::Ok);
        let reply = service
            .handle_message(&Message::AddWebsite {
                domain: "video.org".into(),
                time_limit_minutes: 45,
            })
            .await;
        assert!(matches!(reply, Reply::Website { .. }));
        service.shutdown().await;

        let stored = store.snapshot();
        assert_eq!(stored["blockedSites"], json!(["example.com"]));
        assert_eq!(stored["websites"][0]["domain"], json!("video.org"));
        assert_eq!(stored["websites"][0]["timeLimit"], json!(45));
    }

    #[tokio::test]
    async fn test_failing_store_keeps_memory_state() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let service = BackgroundService::start(
            store.clone(),
            Arc::new(RecordingPresenter::default()),
            ManualClock::new(T0),
            quiet_config(),
        )
        .await;

        service
            .handle_message(&Message::AddBlockedSite {
                site: "example.com".into(),
            })
            .await;
        service.sweep().await;
        assert!(service.decide("example.com").await.is_blocked());
        service.shutdown().await;
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_changes_a_failed_write_lost() {
        let store = Arc::new(MemoryStore::new());
        let service = BackgroundService::start(
            store.clone(),
            Arc::new(RecordingPresenter::default()),
            ManualClock::new(T0),
            quiet_config(),
        )
        .await;

        store.set_failing(true);
        service
            .handle_message(&Message::AddBlockedSite {
                site: "example.com".into(),
            })
            .await;
        // Let the writer attempt the write while the store is down
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.write_count(), 0);

        store.set_failing(false);
        service.sweep().await;
        assert!(service.decide("example.com").await.is_blocked());

        service.shutdown().await;
        assert_eq!(store.snapshot()["blockedSites"], json!(["example.com"]));
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let started = std::time::Instant::now();
        let service = BackgroundService::start(
            StalledStore,
            Arc::new(RecordingPresenter::default()),
            ManualClock::new(T0),
            quiet_config(),
        )
        .await;
        service
            .handle_message(&Message::AddBlockedSite {
                site: "example.com".into(),
            })
            .await;
        assert!(service.decide("example.com").await.is_blocked());
        service.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_recheck_loop_records_time() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let presenter = Arc::new(RecordingPresenter::default());
        let config = TrackerConfig {
            recheck_interval_ms: 10,
            ..quiet_config()
        };
        let service =
            BackgroundService::start(store.clone(), presenter.clone(), clock.clone(), config).await;

        service
            .handle_message(&Message::AddWebsite {
                domain: "video.org".into(),
                time_limit_minutes: 2,
            })
            .await;
        for event in [
            BrowserEvent::TabNavigatedComplete {
                tab_id: 1,
                hostname: "video.org".into(),
                timestamp: T0,
            },
            BrowserEvent::TabBecameActive {
                tab_id: 1,
                timestamp: T0,
            },
        ] {
            service.handle_event(&event).await;
        }

        clock.advance(2 * MS_PER_MINUTE);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = service.snapshot().await;
        let website = state.budgets.website("video.org").unwrap();
        assert_eq!(website.time_spent_minutes, 2);
        assert!(website.is_locked);
        assert_eq!(presenter.seen(), vec!["notify 1 blockTimeExceeded"]);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_refreshes_and_rolls_over() {
        let store = store_with(json!({
            "websites": [{"domain": "video.org", "timeLimit": 30, "timeSpent": 30, "isLocked": true, "dayKey": "2026-10-16"}]
        }));
        let clock = Arc::new(ManualClock::new(T0));
        let service = BackgroundService::start(
            store.clone(),
            Arc::new(RecordingPresenter::default()),
            clock.clone(),
            quiet_config(),
        )
        .await;
        assert!(service.decide("video.org").await.is_blocked());

        // Another context blocks a site
        let mut items = StoreMap::new();
        items.insert("blockedSites".into(), json!(["news.net"]));
        store.set(items).await.unwrap();

        clock.advance(24 * 60 * MS_PER_MINUTE);
        service.sweep().await;
        let state = service.snapshot().await;
        assert!(state.blocked.contains("news.net"));
        let website = state.budgets.website("video.org").unwrap();
        assert_eq!(website.time_spent_minutes, 0);
        assert_eq!(website.day_key, DayKey::parse("2026-10-17"));
        service.shutdown().await;

        let stored = store.snapshot();
        let websites: Vec<TrackedWebsite> =
            serde_json::from_value(stored["websites"].clone()).unwrap();
        assert!(!websites[0].is_locked);
    }

    #[tokio::test]
    async fn test_no_task_runs_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let config = TrackerConfig {
            recheck_interval_ms: 5,
            sweep_interval_ms: 5,
            ..quiet_config()
        };
        let service = BackgroundService::start(
            store.clone(),
            Arc::new(RecordingPresenter::default()),
            clock.clone(),
            config,
        )
        .await;
        service
            .handle_message(&Message::AddWebsite {
                domain: "video.org".into(),
                time_limit_minutes: 60,
            })
            .await;
        service.shutdown().await;

        let writes = store.write_count();
        clock.advance(48 * 60 * MS_PER_MINUTE);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.write_count(), writes);
    }
}
