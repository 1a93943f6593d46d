//! Reply correlation registry.
//!
//! Maps a correlation id to the callback waiting for its reply. Each entry
//! records an absolute deadline when it is registered. A background task
//! sweeps the table on a fixed period and fires expired callbacks with
//! [`ReplyOutcome::TimedOut`].
//!
//! # Exactly-once
//!
//! Both the reply path and the sweep path take an entry out of the map under
//! the same lock before invoking it. Whichever path removes the entry owns the
//! callback; the other finds nothing. Callbacks run after the lock is released,
//! so a callback may itself send another correlated message.
//!
//! All time is `tokio::time::Instant`, which lets paused-clock tests and
//! simulated networks drive expiry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use courier_proto::Reply;
use rand::Rng;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};

use crate::Lifecycle;

/// How a correlated request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// Matching reply arrived before the deadline
    Received(Reply),
    /// Deadline passed first
    TimedOut,
}

impl ReplyOutcome {
    /// Whether a reply arrived.
    pub fn is_received(&self) -> bool {
        matches!(self, Self::Received(_))
    }

    /// The reply, if one arrived.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Received(reply) => Some(reply),
            Self::TimedOut => None,
        }
    }

    /// Consume into the reply, if one arrived.
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Self::Received(reply) => Some(reply),
            Self::TimedOut => None,
        }
    }
}

/// Callback fired once per correlation id.
pub type ReplyCallback = Box<dyn FnOnce(ReplyOutcome) + Send + 'static>;

struct Pending {
    callback: ReplyCallback,
    deadline: Instant,
}

struct Table {
    state: Lifecycle,
    entries: HashMap<u64, Pending>,
}

type SharedTable = Arc<Mutex<Table>>;

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TTL map from correlation id to pending callback.
///
/// Must be created inside a Tokio runtime: construction spawns the sweep task.
pub struct ReplyRegistry {
    table: SharedTable,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Reply timeout used when the caller does not pick one.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Default period of the expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

impl ReplyRegistry {
    /// Registry sweeping every `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> Self {
        let table = Arc::new(Mutex::new(Table { state: Lifecycle::Open, entries: HashMap::new() }));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&table), sweep_interval));
        Self { table, sweeper: Mutex::new(Some(sweeper)) }
    }

    /// Register `callback` under a caller-chosen `id`, expiring `ttl` from now.
    ///
    /// Refuses (and drops the callback unfired) when `id` is zero, already
    /// pending, or the registry is closed.
    pub fn put(&self, id: u64, callback: ReplyCallback, ttl: Duration) -> bool {
        let deadline = Instant::now() + ttl;
        let mut table = lock(&self.table);
        if id == 0 || table.state == Lifecycle::Closed || table.entries.contains_key(&id) {
            return false;
        }
        table.entries.insert(id, Pending { callback, deadline });
        true
    }

    /// Register `callback` under a fresh random non-zero id.
    ///
    /// Returns the id, or `None` when the registry is closed.
    pub fn register(&self, callback: ReplyCallback, ttl: Duration) -> Option<u64> {
        let deadline = Instant::now() + ttl;
        let mut table = lock(&self.table);
        if table.state == Lifecycle::Closed {
            return None;
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u64 = rng.r#gen();
            if candidate != 0 && !table.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        table.entries.insert(id, Pending { callback, deadline });
        Some(id)
    }

    /// Register a one-shot channel instead of a callback.
    ///
    /// The receiver resolves with the outcome, or errors if the registry is
    /// closed before the entry fires.
    pub fn register_oneshot(&self, ttl: Duration) -> Option<(u64, oneshot::Receiver<ReplyOutcome>)> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
            ttl,
        )?;
        Some((id, rx))
    }

    /// Deliver a reply to its waiting callback.
    ///
    /// Returns `false` when nothing was pending for `reply.id` (unknown id,
    /// already expired, or already answered).
    pub fn handle_reply(&self, reply: Reply) -> bool {
        let pending = lock(&self.table).entries.remove(&reply.id);
        match pending {
            Some(pending) => {
                (pending.callback)(ReplyOutcome::Received(reply));
                true
            },
            None => false,
        }
    }

    /// Remove an entry without firing it.
    pub fn remove(&self, id: u64) -> bool {
        lock(&self.table).entries.remove(&id).is_some()
    }

    /// Remove an entry and hand its callback back unfired.
    pub fn take(&self, id: u64) -> Option<ReplyCallback> {
        lock(&self.table).entries.remove(&id).map(|p| p.callback)
    }

    /// Whether `id` is still waiting.
    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.table).entries.contains_key(&id)
    }

    /// Deadline of a pending entry.
    pub fn deadline(&self, id: u64) -> Option<Instant> {
        lock(&self.table).entries.get(&id).map(|p| p.deadline)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every entry whose deadline is at or before `now`.
    ///
    /// The background task calls this on every tick; it is public so tests
    /// can drive expiry with an explicit time.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        sweep(&self.table, now)
    }

    /// Stop the sweep task and drop every pending callback unfired.
    pub fn close(&self) {
        let dropped = {
            let mut table = lock(&self.table);
            table.state = Lifecycle::Closed;
            std::mem::take(&mut table.entries)
        };
        drop(dropped);

        let handle = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Whether the registry still accepts entries.
    pub fn is_open(&self) -> bool {
        lock(&self.table).state == Lifecycle::Open
    }
}

impl Drop for ReplyRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ReplyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = lock(&self.table);
        f.debug_struct("ReplyRegistry")
            .field("state", &table.state)
            .field("pending", &table.entries.len())
            .finish()
    }
}

fn sweep(table: &Mutex<Table>, now: Instant) -> usize {
    let expired: Vec<Pending> = {
        let mut table = lock(table);
        let ids: Vec<u64> =
            table.entries.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| *id).collect();
        ids.iter().filter_map(|id| table.entries.remove(id)).collect()
    };

    let count = expired.len();
    for pending in expired {
        (pending.callback)(ReplyOutcome::TimedOut);
    }
    count
}

async fn sweep_loop(table: SharedTable, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let _ = ticker.tick().await;
        if lock(&table).state == Lifecycle::Closed {
            break;
        }
        let fired = sweep(&table, Instant::now());
        if fired > 0 {
            tracing::trace!(fired, "expired pending replies");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn reply(id: u64) -> Reply {
        let mut reply = Reply::new("alice", "ping").with_content("pong");
        reply.id = id;
        reply
    }

    fn counting() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, ReplyCallback) {
        let received = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));
        let (r, t) = (Arc::clone(&received), Arc::clone(&timed_out));
        let callback: ReplyCallback = Box::new(move |outcome| match outcome {
            ReplyOutcome::Received(_) => {
                let _ = r.fetch_add(1, Ordering::SeqCst);
            },
            ReplyOutcome::TimedOut => {
                let _ = t.fetch_add(1, Ordering::SeqCst);
            },
        });
        (received, timed_out, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn reply_before_deadline_fires_received() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let (tx, rx) = oneshot::channel();
        assert!(registry.put(7, Box::new(move |o: ReplyOutcome| drop(tx.send(o))), Duration::from_millis(200)));

        assert!(registry.handle_reply(reply(7)));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.reply().map(|r| r.id), Some(7));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_fires_timeout_at_deadline() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let (tx, rx) = oneshot::channel();
        let start = Instant::now();
        assert!(registry.put(9, Box::new(move |o: ReplyOutcome| drop(tx.send(o))), Duration::from_millis(200)));

        assert_eq!(rx.await.unwrap(), ReplyOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200) + DEFAULT_SWEEP_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_exactly_the_requested_ttl() {
        let registry = ReplyRegistry::new(Duration::from_secs(3600));
        let (_, _, callback) = counting();
        let before = Instant::now();
        assert!(registry.put(1, callback, Duration::from_millis(150)));
        assert_eq!(registry.deadline(1), Some(before + Duration::from_millis(150)));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_ignored_after_expiry() {
        let registry = ReplyRegistry::new(Duration::from_secs(3600));
        let (received, timed_out, callback) = counting();
        assert!(registry.put(3, callback, Duration::from_millis(50)));

        assert_eq!(registry.sweep_expired(Instant::now() + Duration::from_millis(49)), 0);
        assert_eq!(registry.sweep_expired(Instant::now() + Duration::from_millis(50)), 1);
        assert!(!registry.handle_reply(reply(3)));

        assert_eq!(received.load(Ordering::SeqCst), 0);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_refuses_zero_and_duplicate_ids() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let (_, _, first) = counting();
        let (_, _, second) = counting();
        let (_, _, zero) = counting();

        assert!(!registry.put(0, zero, Duration::from_secs(1)));
        assert!(registry.put(5, first, Duration::from_secs(1)));
        assert!(!registry.put(5, second, Duration::from_secs(1)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn take_returns_callback_unfired() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let (received, timed_out, callback) = counting();
        let id = registry.register(callback, Duration::from_secs(1)).unwrap();

        let callback = registry.take(id).unwrap();
        assert!(!registry.is_pending(id));
        assert!(registry.take(id).is_none());
        assert_eq!(received.load(Ordering::SeqCst) + timed_out.load(Ordering::SeqCst), 0);

        callback(ReplyOutcome::TimedOut);
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn register_draws_distinct_non_zero_ids() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let mut ids = std::collections::HashSet::new();
        for _ in 0..64 {
            let (_, _, callback) = counting();
            let id = registry.register(callback, Duration::from_secs(5)).unwrap();
            assert_ne!(id, 0);
            assert!(ids.insert(id));
        }
        assert_eq!(registry.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn oneshot_registration_resolves_either_way() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);

        let (answered, rx) = registry.register_oneshot(Duration::from_secs(1)).unwrap();
        assert!(registry.handle_reply(reply(answered)));
        assert!(rx.await.unwrap().is_received());

        let (_, rx) = registry.register_oneshot(Duration::from_millis(100)).unwrap();
        assert_eq!(rx.await.unwrap(), ReplyOutcome::TimedOut);

        let (_, rx) = registry.register_oneshot(Duration::from_secs(1)).unwrap();
        registry.close();
        assert!(rx.await.is_err());
        assert!(registry.register_oneshot(Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn close_drops_callbacks_and_refuses_new_entries() {
        let registry = ReplyRegistry::new(DEFAULT_SWEEP_INTERVAL);
        let (received, timed_out, callback) = counting();
        assert!(registry.put(11, callback, Duration::from_millis(1)));

        registry.close();
        assert!(!registry.is_open());
        assert!(registry.is_empty());

        let (_, _, again) = counting();
        assert!(!registry.put(12, again, Duration::from_secs(1)));
        assert!(!registry.handle_reply(reply(11)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(received.load(Ordering::SeqCst) + timed_out.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_reply_and_expiry_fire_exactly_once() {
        let registry = Arc::new(ReplyRegistry::new(Duration::from_millis(1)));
        let mut counters = Vec::new();

        for id in 1..=200u64 {
            let (received, timed_out, callback) = counting();
            // Deadlines straddle the moment the replies arrive.
            assert!(registry.put(id, callback, Duration::from_millis(id % 5)));
            counters.push((received, timed_out));
        }

        let replier = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for id in 1..=200u64 {
                    let _ = registry.handle_reply(reply(id));
                    if id % 20 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        replier.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (received, timed_out) in counters {
            assert_eq!(received.load(Ordering::SeqCst) + timed_out.load(Ordering::SeqCst), 1);
        }
        assert!(registry.is_empty());
    }
}
