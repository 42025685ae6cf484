//! Query registrations.
//!
//! A [`Query`] ties a key to a producer, a refresh policy and optional callbacks.
//! It holds no state of its own: every operation resolves the key's record in the
//! client's cache, creating it if needed, so a query stays usable after its
//! record was evicted.
//!
//! # Example
//!
//! ```rust
//! use query_signal::client::QueryClient;
//! use query_signal::error::QueryError;
//! use query_signal::fetch::FetchOutcome;
//! use query_signal::key::QueryKey;
//! use query_signal::query::Query;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let user = Query::new(QueryKey::from("user").with(123), &client, |_token| async {
//!     Ok::<_, QueryError>("Ada".to_string())
//! })
//! .stale_time(Duration::from_secs(60));
//!
//! assert_eq!(user.fetch().await?, FetchOutcome::Fetched("Ada".to_string()));
//! // Fresh data is served from the cache.
//! assert_eq!(user.fetch().await?, FetchOutcome::Cached("Ada".to_string()));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::QueryClient;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::fetch::{self, Callbacks, FetchOutcome, Producer, SharedFetch};
use crate::key::QueryKey;
use crate::record::{QueryRecord, QueryState};
use crate::refresh::{self, RefreshHandle, Trigger};
use crate::subscription::Subscription;

/// A query registration: key, producer, policy and callbacks.
pub struct Query<V> {
    key: QueryKey,
    producer: Option<Producer<V>>,
    callbacks: Callbacks<V>,
    config: QueryConfig,
    client: QueryClient,
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            producer: self.producer.clone(),
            callbacks: self.callbacks.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
        }
    }
}

impl<V> fmt::Debug for Query<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("has_producer", &self.producer.is_some())
            .field("callbacks", &self.callbacks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a query with the given key, client and producer.
    ///
    /// The policy starts from the client's default configuration.
    ///
    /// # Arguments
    ///
    /// * `key` - Identifies the cached record
    /// * `client` - The client whose cache holds the record
    /// * `producer` - Produces the value; receives a token that fires when the fetch is cancelled
    pub fn new<F, Fut>(key: impl Into<QueryKey>, client: &QueryClient, producer: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let producer: Producer<V> = Arc::new(move |token| producer(token).boxed());
        Self {
            producer: Some(producer),
            ..Self::passive(key, client)
        }
    }

    /// Creates a query without a producer.
    ///
    /// It can observe and read a record that is filled through
    /// [`QueryClient::set_query_data`], but never fetches.
    pub fn passive(key: impl Into<QueryKey>, client: &QueryClient) -> Self {
        Self {
            key: key.into(),
            producer: None,
            callbacks: Callbacks::default(),
            config: client.config().clone(),
            client: client.clone(),
        }
    }

    /// Replaces the whole policy.
    #[must_use]
    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.config.stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.config.gc_time = gc_time;
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.config.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.config.refetch_on_window_focus = enabled;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: u32) -> Self {
        self.config.retry = retry;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Called with the new value after each successful fetch.
    #[must_use]
    pub fn on_success(mut self, callback: impl Fn(&V) + Send + Sync + 'static) -> Self {
        self.callbacks.on_success = Some(Arc::new(callback));
        self
    }

    /// Called with the failure after each failed fetch. Not called for cancellations.
    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Returns the record for this query's key, creating it if necessary.
    pub fn record(&self) -> Result<Arc<QueryRecord<V>>, QueryError> {
        self.client.cache().ensure(&self.key)
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> Result<QueryState<V>, QueryError> {
        Ok(self.record()?.state())
    }

    pub fn is_stale(&self) -> Result<bool, QueryError> {
        Ok(self.record()?.is_stale(Instant::now(), self.config.stale_time))
    }

    /// Evaluates the refresh gate without fetching.
    pub fn can_fetch(&self) -> Result<bool, QueryError> {
        let probe = self.record()?.probe(Instant::now(), self.config.stale_time);
        Ok(refresh::can_fetch(&self.config, self.producer.is_some(), &probe))
    }

    /// Returns data, fetching only when needed.
    ///
    /// Joins a fetch already in flight. Otherwise fresh data is returned as
    /// [`FetchOutcome::Cached`] without calling the producer, and stale or missing
    /// data starts a fetch. Unlike [`refresh`](Self::refresh), this ignores the
    /// `enabled` switch and the retry budget.
    pub async fn fetch(&self) -> Result<FetchOutcome<V>, QueryError> {
        let record = self.record()?;
        if let Some(running) = record.in_flight_result() {
            return Ok(running.await);
        }
        if let Some(data) = record.fresh_data(Instant::now(), self.config.stale_time) {
            tracing::trace!(key = %self.key, "serving fresh data");
            return Ok(FetchOutcome::Cached(data));
        }
        let producer = self.producer()?;
        Ok(fetch::start(&record, producer, &self.callbacks, true).await)
    }

    /// Fetches unconditionally, cancelling any fetch in flight.
    ///
    /// This is the manual refetch: it bypasses the refresh gate, so it also
    /// fetches after the retry budget is exhausted.
    pub async fn refetch(&self) -> Result<FetchOutcome<V>, QueryError> {
        let record = self.record()?;
        let producer = self.producer()?;
        Ok(fetch::start(&record, producer, &self.callbacks, false).await)
    }

    /// Fetches if the refresh gate allows it, otherwise returns [`FetchOutcome::Skipped`].
    pub async fn refresh(&self) -> Result<FetchOutcome<V>, QueryError> {
        self.record()?;
        match self.try_refresh(Trigger::Manual) {
            Some(running) => Ok(running.await),
            None => Ok(FetchOutcome::Skipped),
        }
    }

    /// Starts a gated refresh without waiting for it.
    pub(crate) fn try_refresh(&self, trigger: Trigger) -> Option<SharedFetch<V>> {
        let record = match self.record() {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "refresh skipped");
                return None;
            }
        };
        let probe = record.probe(Instant::now(), self.config.stale_time);
        let producer = match &self.producer {
            Some(producer) if refresh::can_fetch(&self.config, true, &probe) => producer,
            _ => {
                tracing::trace!(key = %self.key, ?trigger, ?probe, "refresh gated");
                return None;
            }
        };
        tracing::debug!(key = %self.key, ?trigger, "refreshing");
        Some(fetch::start(&record, producer, &self.callbacks, true))
    }

    /// Cancels the fetch in flight, if any.
    pub fn cancel(&self) -> Result<bool, QueryError> {
        Ok(self
            .client
            .cache()
            .get::<V>(&self.key)?
            .is_some_and(|record| record.cancel()))
    }

    /// Marks this query's data stale.
    pub fn invalidate(&self) -> usize {
        self.client.invalidate(&self.key, true)
    }

    /// Registers an observer of this query's record.
    ///
    /// The record is evicted `gc_time` after the last observer leaves.
    pub fn subscribe(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription, QueryError> {
        Ok(Subscription::attach(
            self.record()?,
            Arc::new(listener),
            self.config.gc_time,
        ))
    }

    /// Starts driving automatic refreshes: one attempt now, then one per interval
    /// tick and one per debounced focus signal, each subject to the refresh gate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_refresh(&self) -> RefreshHandle {
        refresh::spawn(self.clone())
    }

    fn producer(&self) -> Result<&Producer<V>, QueryError> {
        self.producer
            .as_ref()
            .ok_or_else(|| QueryError::MissingProducer(self.key.to_string()))
    }
}
