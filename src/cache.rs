//! A keyed cache for data fetched from the network, where each entry is trusted for a fixed
//! interval after it was fetched.
//!
//! Lookups never wait for the network. A lookup on a missing or stale key starts a refresh in the
//! background and returns whatever is cached right now; subscribers hear about the key once the
//! refresh is done and can look it up again.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::broadcast, time::Instant};

use crate::error::Error;

/// How long a fetched value is trusted before the next lookup refreshes it.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

const STATUS_OK: u16 = 200;
const STATUS_NOT_FOUND: u16 = 404;

/// Room for this many unread notifications before slow subscribers start missing some.
const UPDATE_BACKLOG: usize = 64;

/// What the network handed back for a key.
#[derive(Debug, Clone)]
pub struct Response<V> {
    pub status: u16,
    pub payload: Option<V>,
}

/// The source of cached values.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    type Value: Clone + Default + Send + Sync + 'static;

    async fn fetch(&self, key: &str) -> eyre::Result<Response<Self::Value>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Fetching,
    Fresh,
    Stale,
}

struct Entry<V> {
    value: V,
    fetched_at: Instant,
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,

    /// The newest refresh attempt for each key being fetched. Only that attempt may change the
    /// key's entry; older ones finish without effect.
    fetching: HashMap<String, u64>,
    next_attempt: u64,
}

impl<V> State<V> {
    fn begin_attempt(&mut self, key: &str) -> u64 {
        self.next_attempt += 1;
        self.fetching.insert(key.to_string(), self.next_attempt);
        self.next_attempt
    }

    /// Clears the in-flight mark if `attempt` is still the newest. Returns whether it was.
    fn end_attempt(&mut self, key: &str, attempt: u64) -> bool {
        if self.fetching.get(key) != Some(&attempt) {
            return false;
        }

        self.fetching.remove(key);
        true
    }
}

/// Clears an attempt's in-flight mark if the attempt is dropped before it finishes, e.g. when the
/// runtime it was spawned on has shut down. Otherwise the key would look `Fetching` forever.
struct AttemptGuard<F: Fetch> {
    inner: Arc<Inner<F>>,
    key: String,
    attempt: u64,
}

impl<F: Fetch> Drop for AttemptGuard<F> {
    fn drop(&mut self) {
        self.inner.state.lock().end_attempt(&self.key, self.attempt);
    }
}

struct Inner<F: Fetch> {
    fetcher: F,
    interval: Duration,
    state: Mutex<State<F::Value>>,
    updates: broadcast::Sender<String>,
    runtime: Option<Handle>,
}

pub struct RefreshCache<F: Fetch> {
    inner: Arc<Inner<F>>,
}

impl<F: Fetch> Clone for RefreshCache<F> {
    fn clone(&self) -> Self {
        RefreshCache {
            inner: self.inner.clone(),
        }
    }
}

impl<F: Fetch> RefreshCache<F> {
    pub fn new(fetcher: F) -> RefreshCache<F> {
        RefreshCache::with_interval(fetcher, REFRESH_INTERVAL)
    }

    /// Refreshes are spawned on whichever runtime is current at lookup time. Lookups made outside
    /// a runtime fall back to the one that was current when the cache was created.
    pub fn with_interval(fetcher: F, interval: Duration) -> RefreshCache<F> {
        let (updates, _) = broadcast::channel(UPDATE_BACKLOG);

        RefreshCache {
            inner: Arc::new(Inner {
                fetcher,
                interval,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    fetching: HashMap::new(),
                    next_attempt: 0,
                }),
                updates,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    /// Returns the cached value for `key`, starting a background refresh if the key has never
    /// been fetched or its value is older than the refresh interval. A stale value is still
    /// returned while it is being refreshed.
    pub fn get(&self, key: &str) -> Option<F::Value> {
        let (value, attempt) = {
            let mut state = self.inner.state.lock();

            let entry = state.entries.get(key);
            let value = entry.map(|entry| entry.value.clone());
            let stale = entry.map_or(true, |entry| self.is_stale(entry));

            let attempt = (stale && !state.fetching.contains_key(key))
                .then(|| state.begin_attempt(key));

            (value, attempt)
        };

        if let Some(attempt) = attempt {
            self.spawn_refresh(key, attempt);
        }

        value
    }

    /// Returns the cached value without ever refreshing it.
    pub fn peek(&self, key: &str) -> Option<F::Value> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn state(&self, key: &str) -> EntryState {
        let state = self.inner.state.lock();

        if state.fetching.contains_key(key) {
            return EntryState::Fetching;
        }

        match state.entries.get(key) {
            None => EntryState::Absent,
            Some(entry) if self.is_stale(entry) => EntryState::Stale,
            Some(_) => EntryState::Fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Yields each key whose refresh has finished, successfully or not.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.updates.subscribe()
    }

    /// Fetches `key` now, regardless of how fresh it is. Any refresh of `key` already in flight
    /// is superseded, and its result is thrown away when it lands. Returns whether a value was
    /// stored.
    pub async fn refresh(&self, key: &str) -> bool {
        let attempt = self.inner.state.lock().begin_attempt(key);
        let _guard = self.guard(key, attempt);

        self.run_refresh(key, attempt).await
    }

    fn is_stale(&self, entry: &Entry<F::Value>) -> bool {
        entry.fetched_at.elapsed() > self.inner.interval
    }

    fn guard(&self, key: &str, attempt: u64) -> AttemptGuard<F> {
        AttemptGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
            attempt,
        }
    }

    fn spawn_refresh(&self, key: &str, attempt: u64) {
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone());

        let Some(runtime) = runtime else {
            log::error!("no async runtime available to refresh `{key}`");
            self.inner.state.lock().end_attempt(key, attempt);
            return;
        };

        let cache = self.clone();
        let guard = self.guard(key, attempt);

        // If the runtime is gone, the task is dropped unpolled and the guard goes with it.
        runtime.spawn(async move {
            let guard = guard;
            cache.run_refresh(&guard.key, guard.attempt).await;
        });
    }

    async fn run_refresh(&self, key: &str, attempt: u64) -> bool {
        let outcome = match self.inner.fetcher.fetch(key).await {
            Ok(Response {
                status: STATUS_OK,
                payload,
            }) => Ok(payload.unwrap_or_default()),

            // Cache "not found" as an empty value so we don't keep asking.
            Ok(Response {
                status: STATUS_NOT_FOUND,
                ..
            }) => Ok(F::Value::default()),

            Ok(Response { status, .. }) => Err(format!("unexpected status {status}")),
            Err(err) => Err(format!("{err:#}")),
        };

        let stored = {
            let mut state = self.inner.state.lock();

            if !state.end_attempt(key, attempt) {
                log::debug!("discarding superseded refresh of `{key}`");
                return false;
            }

            match outcome {
                Ok(value) => {
                    state.entries.insert(
                        key.to_string(),
                        Entry {
                            value,
                            fetched_at: Instant::now(),
                        },
                    );

                    Ok(())
                }

                // A failed refresh leaves no entry at all, so the next lookup tries again.
                Err(reason) => {
                    state.entries.remove(key);

                    Err(Error::RefreshFailed {
                        key: key.to_string(),
                        reason,
                    })
                }
            }
        };

        if let Err(err) = &stored {
            log::warn!("{err}");
        }

        // Nobody listening is fine.
        let _ = self.inner.updates.send(key.to_string());

        stored.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    };
    use tokio::runtime::Builder;

    #[derive(Clone)]
    struct FakeApi {
        calls: Arc<AtomicUsize>,
        status: Arc<AtomicU16>,
        offline: Arc<AtomicBool>,
    }

    impl FakeApi {
        fn new() -> FakeApi {
            FakeApi {
                calls: Arc::new(AtomicUsize::new(0)),
                status: Arc::new(AtomicU16::new(200)),
                offline: Arc::new(AtomicBool::new(false)),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for FakeApi {
        type Value = String;

        async fn fetch(&self, key: &str) -> eyre::Result<Response<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

            if self.offline.load(Ordering::SeqCst) {
                return Err(eyre!("network unreachable"));
            }

            Ok(Response {
                status: self.status.load(Ordering::SeqCst),
                payload: Some(format!("{key}-v{n}")),
            })
        }
    }

    /// Answers calls in order: each one waits for its delay, then succeeds with the payload or
    /// fails if there isn't one.
    struct Scripted {
        steps: Mutex<VecDeque<(Duration, Option<&'static str>)>>,
    }

    impl Scripted {
        fn new(steps: impl IntoIterator<Item = (Duration, Option<&'static str>)>) -> Scripted {
            Scripted {
                steps: Mutex::new(steps.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl Fetch for Scripted {
        type Value = String;

        async fn fetch(&self, _: &str) -> eyre::Result<Response<String>> {
            let step = self.steps.lock().pop_front();
            let (delay, payload) = step.ok_or_else(|| eyre!("no more steps"))?;

            tokio::time::sleep(delay).await;
            let payload = payload.ok_or_else(|| eyre!("network unreachable"))?;

            Ok(Response {
                status: 200,
                payload: Some(payload.to_string()),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_refresh_per_interval() {
        let api = FakeApi::new();
        let cache = RefreshCache::new(api.clone());
        let mut updates = cache.subscribe();

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.state("a"), EntryState::Fetching);
        assert_eq!(updates.recv().await.unwrap(), "a");

        assert_eq!(cache.get("a").as_deref(), Some("a-v1"));
        tokio::time::advance(REFRESH_INTERVAL / 2).await;
        assert_eq!(cache.get("a").as_deref(), Some("a-v1"));
        tokio::task::yield_now().await;
        assert_eq!(api.calls(), 1);

        tokio::time::advance(REFRESH_INTERVAL).await;
        assert_eq!(cache.state("a"), EntryState::Stale);

        // The stale value is served while the refresh runs.
        assert_eq!(cache.get("a").as_deref(), Some("a-v1"));
        assert_eq!(updates.recv().await.unwrap(), "a");
        assert_eq!(cache.get("a").as_deref(), Some("a-v2"));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_refresh() {
        let api = FakeApi::new();
        let cache = RefreshCache::new(api.clone());
        let mut updates = cache.subscribe();

        cache.get("a");
        cache.get("a");
        updates.recv().await.unwrap();

        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn not_found_is_cached_as_empty() {
        let api = FakeApi::new();
        api.status.store(404, Ordering::SeqCst);

        let cache = RefreshCache::new(api.clone());
        let mut updates = cache.subscribe();

        cache.get("ghost");
        updates.recv().await.unwrap();

        assert_eq!(cache.state("ghost"), EntryState::Fresh);
        assert_eq!(cache.get("ghost").as_deref(), Some(""));
        tokio::task::yield_now().await;
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn transport_failure_retries_immediately() {
        let api = FakeApi::new();
        api.offline.store(true, Ordering::SeqCst);

        let cache = RefreshCache::new(api.clone());
        let mut updates = cache.subscribe();

        assert_eq!(cache.get("a"), None);
        updates.recv().await.unwrap();
        assert_eq!(cache.state("a"), EntryState::Absent);

        assert_eq!(cache.get("a"), None);
        updates.recv().await.unwrap();
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn unexpected_status_is_not_cached() {
        let api = FakeApi::new();
        api.status.store(500, Ordering::SeqCst);

        let cache = RefreshCache::new(api.clone());

        assert!(!cache.refresh("a").await);
        assert_eq!(cache.state("a"), EntryState::Absent);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_drops_the_stale_value() {
        let api = FakeApi::new();
        let cache = RefreshCache::new(api.clone());

        assert!(cache.refresh("a").await);
        tokio::time::advance(REFRESH_INTERVAL * 2).await;

        api.offline.store(true, Ordering::SeqCst);
        assert!(!cache.refresh("a").await);

        assert_eq!(cache.peek("a"), None);
        assert_eq!(cache.state("a"), EntryState::Absent);
    }

    #[tokio::test]
    async fn keys_refresh_independently() {
        let api = FakeApi::new();
        let cache = RefreshCache::new(api.clone());

        assert!(cache.refresh("a").await);

        api.offline.store(true, Ordering::SeqCst);
        assert!(!cache.refresh("b").await);

        assert_eq!(cache.peek("a").as_deref(), Some("a-v1"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_undo_a_newer_refresh() {
        let cache = RefreshCache::new(Scripted::new([
            (Duration::from_secs(10), None),
            (Duration::ZERO, Some("fresh")),
        ]));

        // Starts the slow, failing fetch in the background.
        assert_eq!(cache.get("a"), None);
        tokio::task::yield_now().await;
        assert_eq!(cache.state("a"), EntryState::Fetching);

        assert!(cache.refresh("a").await);
        assert_eq!(cache.state("a"), EntryState::Fresh);

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(cache.peek("a").as_deref(), Some("fresh"));
        assert_eq!(cache.state("a"), EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_does_not_overwrite_a_newer_refresh() {
        let cache = RefreshCache::new(Scripted::new([
            (Duration::from_secs(10), Some("old")),
            (Duration::ZERO, Some("new")),
        ]));

        cache.get("a");
        tokio::task::yield_now().await;

        assert!(cache.refresh("a").await);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(cache.peek("a").as_deref(), Some("new"));
    }

    #[test]
    fn refreshes_use_the_runtime_current_at_lookup() {
        let api = FakeApi::new();

        let setup = Builder::new_current_thread().enable_all().build().unwrap();
        let cache = setup.block_on(async { RefreshCache::new(api.clone()) });
        drop(setup);

        let runtime = Builder::new_current_thread().enable_all().build().unwrap();

        runtime.block_on(async {
            let mut updates = cache.subscribe();

            assert_eq!(cache.get("a"), None);
            assert_eq!(updates.recv().await.unwrap(), "a");
            assert_eq!(cache.get("a").as_deref(), Some("a-v1"));
        });

        assert_eq!(api.calls(), 1);
    }

    #[test]
    fn refresh_dropped_by_a_stopped_runtime_is_retried() {
        let api = FakeApi::new();

        let setup = Builder::new_current_thread().enable_all().build().unwrap();
        let cache = setup.block_on(async { RefreshCache::new(api.clone()) });
        drop(setup);

        // No runtime is current here, so the refresh goes to the stopped one and is dropped.
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.state("a"), EntryState::Absent);
        assert_eq!(api.calls(), 0);
    }
}
