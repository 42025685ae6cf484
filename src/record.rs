//! Per-key query state.
//!
//! A [`QueryRecord`] owns everything known about one cache entry: the last value,
//! the last error, timestamps, the in-flight fetch and the subscribers. Every
//! mutation happens under the record's lock and is followed, after the lock is
//! released, by a notification of every subscriber. A listener that reads the
//! record from inside its callback therefore sees the completed mutation.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::WeakQueryCache;
use crate::error::QueryError;
use crate::fetch::{FetchOutcome, SharedFetch};

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Never fetched.
    #[default]
    Idle,
    /// Fetching with no data to show yet.
    Pending,
    Success,
    /// The last fetch failed and there is no earlier data to fall back on.
    Error,
}

/// A consistent snapshot of a record.
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    pub data: Option<V>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub invalidated_at: Option<Instant>,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Whether a fetch is in flight, independently of `status`.
    pub is_fetching: bool,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            data_updated_at: None,
            error_updated_at: None,
            invalidated_at: None,
            failure_count: 0,
            is_fetching: false,
        }
    }
}

impl<V> QueryState<V> {
    /// Returns the data if present.
    pub const fn data(&self) -> Option<&V> {
        self.data.as_ref()
    }

    /// Returns `true` while the first fetch is running.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Staleness at `now` for the given `stale_time`.
    ///
    /// Data is stale when it was never fetched, when it was invalidated after its
    /// last update, or when more than `stale_time` has passed since that update.
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        is_stale(self.data_updated_at, self.invalidated_at, now, stale_time)
    }
}

fn is_stale(
    data_updated_at: Option<Instant>,
    invalidated_at: Option<Instant>,
    now: Instant,
    stale_time: Duration,
) -> bool {
    let Some(updated) = data_updated_at else {
        return true;
    };
    if invalidated_at.is_some_and(|invalidated| invalidated >= updated) {
        return true;
    }
    now.saturating_duration_since(updated) > stale_time
}

/// Per-key summary reported by [`QueryCache::stats`](crate::cache::QueryCache::stats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStats {
    pub subscriber_count: usize,
    pub status: QueryStatus,
    pub has_data: bool,
    pub data_updated_at: Option<Instant>,
    pub is_fetching: bool,
}

/// The inputs the refresh gate needs, read in one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Probe {
    pub(crate) is_fetching: bool,
    pub(crate) has_error: bool,
    pub(crate) failure_count: u32,
    pub(crate) is_stale: bool,
}

/// Identifies one subscriber of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SubscriberId(u64);

pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// The fetch currently owning a record.
struct InFlight<V> {
    generation: u64,
    token: CancellationToken,
    result: SharedFetch<V>,
}

/// Result of asking a record to start a fetch.
pub(crate) enum Begin<V> {
    /// A new fetch owns the record; the caller must run it.
    Started {
        generation: u64,
        token: CancellationToken,
    },
    /// Another fetch is already running and the caller asked to join it.
    Joined(SharedFetch<V>),
}

/// How [`QueryRecord::settle`] treated a completion.
#[derive(Debug)]
pub(crate) enum Settled<V> {
    Applied(FetchOutcome<V>),
    /// The completion belonged to a superseded or cancelled fetch.
    Discarded,
}

#[derive(Debug, Default)]
struct Gc {
    /// Bumped whenever a pending eviction becomes obsolete.
    epoch: u64,
    /// The grace period elapsed while a fetch was running.
    due: bool,
}

struct Inner<V> {
    data: Option<V>,
    error: Option<QueryError>,
    status: QueryStatus,
    data_updated_at: Option<Instant>,
    error_updated_at: Option<Instant>,
    invalidated_at: Option<Instant>,
    failure_count: u32,
    in_flight: Option<InFlight<V>>,
    next_generation: u64,
    subscribers: BTreeMap<SubscriberId, Listener>,
    next_subscriber: u64,
    gc: Gc,
}

impl<V: Clone> Inner<V> {
    fn snapshot(&self) -> QueryState<V> {
        QueryState {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            invalidated_at: self.invalidated_at,
            failure_count: self.failure_count,
            is_fetching: self.in_flight.is_some(),
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        self.subscribers.values().cloned().collect()
    }

    /// Drops the in-flight slot after a cancellation that nothing replaced.
    fn clear_in_flight(&mut self) -> Option<InFlight<V>> {
        let in_flight = self.in_flight.take()?;
        if self.status == QueryStatus::Pending {
            self.status = if self.error.is_some() {
                QueryStatus::Error
            } else {
                QueryStatus::Idle
            };
        }
        Some(in_flight)
    }

    /// An overdue eviction can run once nothing observes or fetches the record.
    fn eviction_ready(&self) -> bool {
        self.gc.due && self.subscribers.is_empty() && self.in_flight.is_none()
    }
}

/// State machine and data holder for one cache entry.
pub struct QueryRecord<V> {
    key: String,
    cache: WeakQueryCache,
    inner: Mutex<Inner<V>>,
}

impl<V> fmt::Debug for QueryRecord<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("QueryRecord")
            .field("key", &self.key)
            .field("status", &inner.status)
            .field("is_fetching", &inner.in_flight.is_some())
            .field("subscribers", &inner.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl<V> QueryRecord<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: String, cache: WeakQueryCache) -> Self {
        Self {
            key,
            cache,
            inner: Mutex::new(Inner {
                data: None,
                error: None,
                status: QueryStatus::Idle,
                data_updated_at: None,
                error_updated_at: None,
                invalidated_at: None,
                failure_count: 0,
                in_flight: None,
                next_generation: 0,
                subscribers: BTreeMap::new(),
                next_subscriber: 0,
                gc: Gc::default(),
            }),
        }
    }

    /// The encoded key this record is stored under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn state(&self) -> QueryState<V> {
        self.inner.lock().snapshot()
    }

    #[must_use]
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        let inner = self.inner.lock();
        is_stale(inner.data_updated_at, inner.invalidated_at, now, stale_time)
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Returns the data if it is fresh at `now`.
    pub(crate) fn fresh_data(&self, now: Instant, stale_time: Duration) -> Option<V> {
        let inner = self.inner.lock();
        if is_stale(inner.data_updated_at, inner.invalidated_at, now, stale_time) {
            return None;
        }
        inner.data.clone()
    }

    pub(crate) fn probe(&self, now: Instant, stale_time: Duration) -> Probe {
        let inner = self.inner.lock();
        Probe {
            is_fetching: inner.in_flight.is_some(),
            has_error: inner.error.is_some(),
            failure_count: inner.failure_count,
            is_stale: is_stale(inner.data_updated_at, inner.invalidated_at, now, stale_time),
        }
    }

    /// Applies `f` under the lock, then notifies every subscriber.
    fn mutate<R>(&self, f: impl FnOnce(&mut Inner<V>) -> R) -> R {
        let (result, listeners) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, inner.listeners())
        };
        for listener in listeners {
            listener();
        }
        result
    }

    /// Claims the in-flight slot for a new fetch.
    ///
    /// With `join` set and a fetch already running, the running fetch is returned
    /// instead. Otherwise any running fetch is cancelled and `result` becomes the
    /// pending result of the new one.
    pub(crate) fn begin_fetch(&self, result: SharedFetch<V>, join: bool) -> Begin<V> {
        let (begin, listeners) = {
            let mut inner = self.inner.lock();
            if let Some(in_flight) = &inner.in_flight {
                if join {
                    return Begin::Joined(in_flight.result.clone());
                }
                tracing::debug!(
                    key = %self.key,
                    generation = in_flight.generation,
                    "superseding in-flight fetch"
                );
                in_flight.token.cancel();
            }

            inner.next_generation += 1;
            let generation = inner.next_generation;
            let token = CancellationToken::new();
            if inner.data.is_none() {
                inner.status = QueryStatus::Pending;
            }
            inner.in_flight = Some(InFlight {
                generation,
                token: token.clone(),
                result,
            });
            (Begin::Started { generation, token }, inner.listeners())
        };

        for listener in listeners {
            listener();
        }
        begin
    }

    /// Returns the pending result of the running fetch, if any.
    pub(crate) fn in_flight_result(&self) -> Option<SharedFetch<V>> {
        self.inner.lock().in_flight.as_ref().map(|f| f.result.clone())
    }

    /// Records the completion of the fetch started as `generation`.
    ///
    /// Completions of fetches that no longer own the record are discarded without
    /// touching it.
    pub(crate) fn settle(
        self: &Arc<Self>,
        generation: u64,
        result: Result<V, QueryError>,
        now: Instant,
    ) -> Settled<V> {
        let settled = {
            let mut inner = self.inner.lock();
            if inner.in_flight.as_ref().map(|f| f.generation) != Some(generation) {
                tracing::trace!(key = %self.key, generation, "discarding superseded completion");
                return Settled::Discarded;
            }

            let outcome = match result {
                Ok(data) => {
                    inner.in_flight = None;
                    inner.data = Some(data.clone());
                    inner.status = QueryStatus::Success;
                    inner.error = None;
                    inner.data_updated_at = Some(now);
                    inner.failure_count = 0;
                    inner.invalidated_at = None;
                    FetchOutcome::Fetched(data)
                }
                Err(QueryError::Cancelled) => {
                    inner.clear_in_flight();
                    FetchOutcome::Cancelled
                }
                Err(error) => {
                    inner.in_flight = None;
                    inner.failure_count += 1;
                    inner.error_updated_at = Some(now);
                    inner.error = Some(error.clone());
                    if inner.data.is_none() {
                        inner.status = QueryStatus::Error;
                    }
                    FetchOutcome::Failed(error)
                }
            };
            let evict = inner.eviction_ready();
            (outcome, inner.listeners(), evict)
        };

        let (outcome, listeners, evict) = settled;
        for listener in listeners {
            listener();
        }
        if evict {
            self.evict();
        }
        Settled::Applied(outcome)
    }

    /// Cancels the running fetch, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut inner = self.inner.lock();
            match inner.clear_in_flight() {
                Some(in_flight) => {
                    in_flight.token.cancel();
                    Some((inner.listeners(), inner.eviction_ready()))
                }
                None => None,
            }
        };

        let Some((listeners, evict)) = cancelled else {
            return false;
        };
        tracing::debug!(key = %self.key, "cancelled in-flight fetch");
        for listener in listeners {
            listener();
        }
        if evict {
            self.evict();
        }
        true
    }

    /// Marks the data as stale from `now` on.
    pub fn invalidate(&self, now: Instant) {
        self.mutate(|inner| inner.invalidated_at = Some(now));
    }

    /// Writes data directly, bypassing the producer.
    ///
    /// `updater` receives a snapshot of the current data and runs without the
    /// record's lock held, so it may read this record again.
    pub fn set_data(&self, now: Instant, updater: impl FnOnce(Option<&V>) -> V) -> V {
        let current = self.inner.lock().data.clone();
        let data = updater(current.as_ref());
        self.mutate(|inner| {
            inner.data = Some(data.clone());
            inner.status = QueryStatus::Success;
            inner.error = None;
            inner.data_updated_at = Some(now);
            inner.failure_count = 0;
            inner.invalidated_at = None;
            data
        })
    }

    /// Adds a listener and cancels any pending eviction.
    pub(crate) fn add_subscriber(&self, listener: Listener) -> SubscriberId {
        let mut inner = self.inner.lock();
        let id = SubscriberId(inner.next_subscriber);
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, listener);
        inner.gc.epoch += 1;
        inner.gc.due = false;
        id
    }

    /// Removes a listener; the last one to leave starts the eviction countdown.
    pub(crate) fn remove_subscriber(self: &Arc<Self>, id: SubscriberId, gc_time: Duration) {
        let (epoch, evict_now) = {
            let mut inner = self.inner.lock();
            if inner.subscribers.remove(&id).is_none() || !inner.subscribers.is_empty() {
                return;
            }
            inner.gc.epoch += 1;
            inner.gc.due = gc_time.is_zero();
            (inner.gc.epoch, inner.eviction_ready())
        };

        if gc_time.is_zero() {
            if evict_now {
                self.evict();
            } else {
                tracing::debug!(key = %self.key, "deferring eviction until fetch settles");
            }
            return;
        }

        // Subscriptions may be dropped outside a runtime; the record then stays
        // cached until removed explicitly.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "no tokio runtime, eviction not scheduled");
            return;
        };
        tracing::trace!(key = %self.key, ?gc_time, "scheduling eviction");
        let record = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(record) = Weak::upgrade(&record) {
                record.gc_elapsed(epoch);
            }
        });
    }

    /// Runs when the grace period scheduled as `epoch` has passed.
    fn gc_elapsed(&self, epoch: u64) {
        let evict = {
            let mut inner = self.inner.lock();
            if inner.gc.epoch != epoch || !inner.subscribers.is_empty() {
                return;
            }
            inner.gc.due = true;
            inner.eviction_ready()
        };
        if evict {
            self.evict();
        } else {
            tracing::debug!(key = %self.key, "deferring eviction until fetch settles");
        }
    }

    fn evict(&self) {
        if self.cache.evict(&self.key, self) {
            tracing::debug!(key = %self.key, "evicted idle query");
        }
    }
}

/// Type-erased view of a record, used by the cache for bulk operations.
pub(crate) trait ErasedRecord: Send + Sync {
    fn invalidate(&self, now: Instant);

    fn cancel(&self) -> bool;

    fn stats(&self) -> QueryStats;

    fn release(self: Arc<Self>, id: SubscriberId, gc_time: Duration);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V> ErasedRecord for QueryRecord<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn invalidate(&self, now: Instant) {
        QueryRecord::invalidate(self, now);
    }

    fn cancel(&self) -> bool {
        QueryRecord::cancel(self)
    }

    fn stats(&self) -> QueryStats {
        let inner = self.inner.lock();
        QueryStats {
            subscriber_count: inner.subscribers.len(),
            status: inner.status,
            has_data: inner.data.is_some(),
            data_updated_at: inner.data_updated_at,
            is_fetching: inner.in_flight.is_some(),
        }
    }

    fn release(self: Arc<Self>, id: SubscriberId, gc_time: Duration) {
        self.remove_subscriber(id, gc_time);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
