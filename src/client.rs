//! The query client: the entry point that owns the cache and host signals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::QueryCache;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::record::{QueryState, QueryStats};
use crate::refresh::focus::FocusSignal;
use crate::subscription::Subscription;

/// A client for managing the query cache.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Holding every query record
/// - Administrative reads and writes by key
/// - Forwarding host focus and visibility to refresh drivers
///
/// Clones share the same cache and signal.
///
/// # Example
///
/// ```rust
/// use query_signal::client::QueryClient;
/// use query_signal::config::QueryConfig;
/// use query_signal::key::QueryKey;
/// use std::time::Duration;
///
/// let config = QueryConfig::new(
///     Duration::from_secs(30),  // stale_time
///     Duration::from_secs(300), // gc_time
/// );
/// let client = QueryClient::with_config(config);
///
/// let key = QueryKey::from("todos");
/// client.set_query_data(&key, vec!["write docs".to_string()]).unwrap();
/// assert_eq!(client.get_query_data::<Vec<String>>(&key).unwrap().unwrap().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct QueryClient {
    cache: QueryCache,
    focus: FocusSignal,
    config: QueryConfig,
}

/// A view of cached data together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheState<V> {
    pub data: Option<V>,
    pub is_stale: bool,
    pub is_fresh: bool,
    pub has_active_fetch: bool,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client whose queries start from `config`.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            cache: QueryCache::new(),
            focus: FocusSignal::new(),
            config,
        }
    }

    /// Uses `focus` as the host signal instead of a private one.
    #[must_use]
    pub fn with_focus(mut self, focus: FocusSignal) -> Self {
        self.focus = focus;
        self
    }

    /// The default policy for queries created from this client.
    #[must_use]
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The host focus and visibility signal.
    #[must_use]
    pub const fn focus(&self) -> &FocusSignal {
        &self.focus
    }

    /// Marks matching queries stale and notifies their subscribers.
    ///
    /// With `exact` unset, every query whose key starts with `key` matches.
    /// Returns the number of queries matched.
    pub fn invalidate(&self, key: &QueryKey, exact: bool) -> usize {
        self.cache.invalidate(key, exact)
    }

    /// Cancels in-flight fetches of matching queries.
    ///
    /// Returns the number of fetches cancelled.
    pub fn cancel(&self, key: &QueryKey, exact: bool) -> usize {
        self.cache.cancel(key, exact)
    }

    /// Stores `data` for `key` as if a fetch had just returned it.
    ///
    /// Creates the record if needed. A fetch in flight keeps running and
    /// overwrites the value when it succeeds.
    pub fn set_query_data<V>(&self, key: &QueryKey, data: V) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.update_query_data(key, |_| data)
    }

    /// Computes new data from the current data and stores it.
    ///
    /// The updater sees a snapshot and may read the client, including this key.
    pub fn update_query_data<V>(
        &self,
        key: &QueryKey,
        updater: impl FnOnce(Option<&V>) -> V,
    ) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let data = self.cache.ensure::<V>(key)?.set_data(Instant::now(), updater);
        tracing::debug!(key = %key, "query data set");
        Ok(data)
    }

    /// Returns the cached data for `key`, if any.
    pub fn get_query_data<V>(&self, key: &QueryKey) -> Result<Option<V>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        Ok(self.get_state::<V>(key)?.and_then(|state| state.data))
    }

    /// Returns a snapshot of the record for `key`, if one exists.
    pub fn get_state<V>(&self, key: &QueryKey) -> Result<Option<QueryState<V>>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        Ok(self.cache.get::<V>(key)?.map(|record| record.state()))
    }

    /// Reports cached data and its freshness under `stale_time`.
    pub fn cache_state<V>(
        &self,
        key: &QueryKey,
        stale_time: Duration,
    ) -> Result<Option<CacheState<V>>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        Ok(self.get_state::<V>(key)?.map(|state| {
            let is_stale = state.is_stale(now, stale_time);
            CacheState {
                is_fresh: state.data.is_some() && !is_stale,
                is_stale,
                has_active_fetch: state.is_fetching,
                data: state.data,
            }
        }))
    }

    /// Removes the query for `key`, cancelling its in-flight fetch.
    ///
    /// Existing subscriptions stay valid but observe the removed record; a later
    /// access through the key starts from an empty record.
    pub fn remove_query(&self, key: &QueryKey) -> bool {
        self.cache.remove(key)
    }

    /// Summarizes every query, keyed by encoded key.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, QueryStats> {
        self.cache.stats()
    }

    /// Observes the record for `key` without a [`Query`](crate::query::Query).
    ///
    /// Uses the client's `gc_time` once the last observer leaves.
    pub fn subscribe<V>(
        &self,
        key: &QueryKey,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        Ok(Subscription::attach(
            self.cache.ensure::<V>(key)?,
            Arc::new(listener),
            self.config.gc_time,
        ))
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::QueryStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_client_creation() {
        let client = QueryClient::new();
        assert_eq!(client.config(), &QueryConfig::default());
        assert!(client.cache().is_empty());
        assert!(client.focus().is_visible());
    }

    #[test]
    fn test_clones_share_cache() {
        let client = QueryClient::new();
        let clone = client.clone();
        let key = QueryKey::from("shared");

        clone.set_query_data(&key, 1).unwrap();
        assert_eq!(client.get_query_data::<i32>(&key).unwrap(), Some(1));
    }

    #[test]
    fn test_update_query_data() {
        let client = QueryClient::new();
        let key = QueryKey::from("counter");

        assert_eq!(client.update_query_data(&key, |old: Option<&i32>| old.map_or(1, |n| n + 1)).unwrap(), 1);
        assert_eq!(client.update_query_data(&key, |old: Option<&i32>| old.map_or(1, |n| n + 1)).unwrap(), 2);

        let state = client.get_state::<i32>(&key).unwrap().unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.data_updated_at.is_some());
    }

    #[test]
    fn test_updater_reads_same_key() {
        let client = QueryClient::new();
        let key = QueryKey::from("reentrant");
        client.set_query_data(&key, 1).unwrap();

        let data = client
            .update_query_data(&key, |old: Option<&i32>| {
                let state = client.get_state::<i32>(&key).unwrap().unwrap();
                state.data.unwrap_or(0) + old.copied().unwrap_or(0)
            })
            .unwrap();

        assert_eq!(data, 2);
        assert_eq!(client.get_query_data::<i32>(&key).unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_state() {
        let client = QueryClient::new();
        let key = QueryKey::from("fresh");
        let stale_time = Duration::from_secs(10);

        assert!(client.cache_state::<i32>(&key, stale_time).unwrap().is_none());

        client.set_query_data(&key, 3).unwrap();
        let state = client.cache_state::<i32>(&key, stale_time).unwrap().unwrap();
        assert_eq!(state.data, Some(3));
        assert!(state.is_fresh);
        assert!(!state.is_stale);
        assert!(!state.has_active_fetch);

        tokio::time::advance(Duration::from_secs(11)).await;
        let state = client.cache_state::<i32>(&key, stale_time).unwrap().unwrap();
        assert!(state.is_stale);
        assert!(!state.is_fresh);
    }

    #[test]
    fn test_invalidate_notifies_subscribers() {
        let client = QueryClient::new();
        let key = QueryKey::from("todos").with(1);
        client.set_query_data(&key, 1).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = client
            .subscribe::<i32>(&key, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(client.invalidate(&QueryKey::from("todos"), false), 1);
        assert_eq!(client.invalidate(&QueryKey::from("todos"), true), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_and_stats() {
        let client = QueryClient::new();
        let key = QueryKey::from("a");
        client.set_query_data(&key, "x".to_string()).unwrap();

        let stats = client.stats();
        assert_eq!(stats[key.encoded()].status, QueryStatus::Success);

        assert!(client.remove_query(&key));
        assert!(client.stats().is_empty());
        assert_eq!(client.get_query_data::<String>(&key).unwrap(), None);
    }

    #[test]
    fn test_cancel_without_fetch() {
        let client = QueryClient::new();
        client.set_query_data(&QueryKey::from("idle"), 0).unwrap();
        assert_eq!(client.cancel(&QueryKey::from("idle"), true), 0);
    }
}
