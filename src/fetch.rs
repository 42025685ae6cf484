//! Running a producer against a record.
//!
//! A fetch claims the record's in-flight slot, runs the producer on a tokio task
//! and settles the record when the producer resolves. Starting a fetch cancels
//! the one it replaces. The replaced fetch's completion is discarded by the
//! record's generation check even if its producer ignores the token.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::record::{Begin, QueryRecord, Settled};

/// The asynchronous function that produces a query's value.
///
/// It receives a token that is cancelled when the fetch is superseded or
/// cancelled; a well-behaved producer stops and returns
/// [`QueryError::Cancelled`] once that happens.
pub type Producer<V> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<V, QueryError>> + Send + Sync>;

/// The pending result of a running fetch, awaitable by any number of callers.
pub type SharedFetch<V> = Shared<BoxFuture<'static, FetchOutcome<V>>>;

/// How a fetch request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<V> {
    /// The producer resolved and the record now holds this value.
    Fetched(V),
    /// The data was fresh, so the producer was not called.
    Cached(V),
    /// The producer failed; the failure was recorded on the record.
    Failed(QueryError),
    /// The fetch was superseded or cancelled before it could settle.
    Cancelled,
    /// The refresh gate declined to fetch.
    Skipped,
}

impl<V> FetchOutcome<V> {
    /// Returns the value for [`Fetched`](Self::Fetched) and [`Cached`](Self::Cached).
    pub const fn data(&self) -> Option<&V> {
        match self {
            Self::Fetched(data) | Self::Cached(data) => Some(data),
            _ => None,
        }
    }

    /// Returns `true` if the producer was called and its value committed.
    pub const fn is_fetched(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }

    /// Converts into a `Result`, mapping outcomes without a value to their error.
    ///
    /// [`Skipped`](Self::Skipped) and [`Cancelled`](Self::Cancelled) both become
    /// [`QueryError::Cancelled`].
    pub fn into_result(self) -> Result<V, QueryError> {
        match self {
            Self::Fetched(data) | Self::Cached(data) => Ok(data),
            Self::Failed(error) => Err(error),
            Self::Cancelled | Self::Skipped => Err(QueryError::Cancelled),
        }
    }
}

type SuccessCallback<V> = Arc<dyn Fn(&V) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;

/// Callbacks invoked after a fetch settles and subscribers were notified.
pub struct Callbacks<V> {
    pub(crate) on_success: Option<SuccessCallback<V>>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl<V> Default for Callbacks<V> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

impl<V> Clone for Callbacks<V> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<V> fmt::Debug for Callbacks<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Starts a fetch for `record` and returns its pending result.
///
/// With `join` set, an already running fetch is joined instead of replaced. The
/// fetch runs on its own task, so dropping the returned future does not stop it.
///
/// Must be called from within a tokio runtime.
pub(crate) fn start<V>(
    record: &Arc<QueryRecord<V>>,
    producer: &Producer<V>,
    callbacks: &Callbacks<V>,
    join: bool,
) -> SharedFetch<V>
where
    V: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let result: SharedFetch<V> = rx
        .map(|outcome| outcome.unwrap_or(FetchOutcome::Cancelled))
        .boxed()
        .shared();

    let (generation, token) = match record.begin_fetch(result.clone(), join) {
        Begin::Started { generation, token } => (generation, token),
        Begin::Joined(running) => {
            tracing::trace!(key = record.key(), "joining in-flight fetch");
            return running;
        }
    };

    tracing::debug!(key = record.key(), generation, "starting fetch");
    let record = Arc::clone(record);
    let call = guard(record.key(), producer, token.clone());
    let callbacks = callbacks.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(QueryError::Cancelled),
            result = call => result,
        };

        let outcome = match record.settle(generation, result, Instant::now()) {
            Settled::Applied(outcome) => outcome,
            Settled::Discarded => FetchOutcome::Cancelled,
        };
        match &outcome {
            FetchOutcome::Fetched(data) => {
                tracing::debug!(key = record.key(), generation, "fetch succeeded");
                if let Some(on_success) = &callbacks.on_success {
                    on_success(data);
                }
            }
            FetchOutcome::Failed(error) => {
                tracing::debug!(key = record.key(), generation, %error, "fetch failed");
                if let Some(on_error) = &callbacks.on_error {
                    on_error(error);
                }
            }
            _ => tracing::trace!(key = record.key(), generation, "fetch cancelled"),
        }

        // No receiver means nobody awaited the result.
        let _ = tx.send(outcome);
    });

    result
}

/// Calls `producer`, turning a panic in the call or in the returned future into a
/// [`QueryError::FetchError`] so the record is always settled.
fn guard<V>(
    key: &str,
    producer: &Producer<V>,
    token: CancellationToken,
) -> BoxFuture<'static, Result<V, QueryError>>
where
    V: Send + 'static,
{
    let key = key.to_string();
    match panic::catch_unwind(AssertUnwindSafe(|| producer(token))) {
        Ok(call) => AssertUnwindSafe(call)
            .catch_unwind()
            .map(move |result| result.unwrap_or_else(|payload| Err(panicked(&key, &*payload))))
            .boxed(),
        Err(payload) => future::ready(Err(panicked(&key, &*payload))).boxed(),
    }
}

fn panicked(key: &str, payload: &(dyn Any + Send)) -> QueryError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::warn!(key, %message, "producer panicked");
    QueryError::FetchError(format!("producer panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::key::QueryKey;
    use crate::record::QueryStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn producer<F, Fut>(f: F) -> Producer<i32>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i32, QueryError>> + Send + 'static,
    {
        Arc::new(move |token| f(token).boxed())
    }

    fn record() -> (QueryCache, Arc<QueryRecord<i32>>) {
        let cache = QueryCache::new();
        let record = cache.ensure(&QueryKey::from("k")).unwrap();
        (cache, record)
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(FetchOutcome::Fetched(1).data(), Some(&1));
        assert_eq!(FetchOutcome::Cached(2).data(), Some(&2));
        assert_eq!(FetchOutcome::<i32>::Skipped.data(), None);
        assert!(FetchOutcome::Fetched(1).is_fetched());
        assert!(!FetchOutcome::Cached(1).is_fetched());
        assert_eq!(
            FetchOutcome::<i32>::Failed(QueryError::FetchError("x".into())).into_result(),
            Err(QueryError::FetchError("x".into()))
        );
        assert_eq!(FetchOutcome::<i32>::Cancelled.into_result(), Err(QueryError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_success_invokes_callback() {
        let (_cache, record) = record();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        let callbacks = Callbacks {
            on_success: Some(Arc::new(move |v: &i32| {
                sink.store(usize::try_from(*v).unwrap(), Ordering::SeqCst);
            })),
            on_error: None,
        };

        let outcome = start(&record, &producer(|_| async { Ok(7) }), &callbacks, false).await;

        assert_eq!(outcome, FetchOutcome::Fetched(7));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(record.state().status, QueryStatus::Success);
        assert!(!record.is_fetching());
    }

    #[tokio::test]
    async fn test_fetch_failure_invokes_callback() {
        let (_cache, record) = record();
        let errors = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&errors);
        let callbacks = Callbacks {
            on_success: None,
            on_error: Some(Arc::new(move |_: &QueryError| {
                sink.fetch_add(1, Ordering::SeqCst);
            })),
        };

        let outcome = start(
            &record,
            &producer(|_| async { Err(QueryError::FetchError("nope".into())) }),
            &callbacks,
            false,
        )
        .await;

        assert_eq!(outcome, FetchOutcome::Failed(QueryError::FetchError("nope".into())));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let state = record.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.failure_count, 1);
    }

    #[tokio::test]
    async fn test_superseded_fetch_never_mutates() {
        let (_cache, record) = record();
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        // Ignores its token and resolves late with a value that must be dropped.
        let slow = producer(move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(1)
            }
        });
        let callbacks = Callbacks::default();

        let first = start(&record, &slow, &callbacks, false);
        let second = start(&record, &producer(|_| async { Ok(2) }), &callbacks, false);

        assert_eq!(second.await, FetchOutcome::Fetched(2));
        release.notify_waiters();
        assert_eq!(first.await, FetchOutcome::Cancelled);
        assert_eq!(record.state().data, Some(2));
    }

    #[tokio::test]
    async fn test_join_shares_one_producer_call() {
        let (_cache, record) = record();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let counting = producer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(3)
            }
        });
        let callbacks = Callbacks::default();

        let a = start(&record, &counting, &callbacks, true);
        let b = start(&record, &counting, &callbacks, true);

        assert_eq!(a.await, FetchOutcome::Fetched(3));
        assert_eq!(b.await, FetchOutcome::Fetched(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_settles_promptly() {
        let (_cache, record) = record();
        let never = producer(|_| futures::future::pending());

        let fetch = start(&record, &never, &Callbacks::default(), false);
        assert!(record.is_fetching());
        assert!(record.cancel());

        let outcome = tokio::time::timeout(Duration::from_millis(100), fetch)
            .await
            .expect("cancelled fetch should settle");
        assert_eq!(outcome, FetchOutcome::Cancelled);
        assert_eq!(record.state().status, QueryStatus::Idle);
        assert_eq!(record.state().failure_count, 0);
    }

    #[tokio::test]
    async fn test_panicking_future_settles_as_failure() {
        let (cache, record) = record();
        let key = QueryKey::from("k");
        let exploding = producer(|_| async {
            if true {
                panic!("exploded while fetching");
            }
            Ok(1)
        });

        let sub = crate::subscription::Subscription::attach(
            Arc::clone(&record),
            Arc::new(|| {}),
            Duration::ZERO,
        );
        let outcome = start(&record, &exploding, &Callbacks::default(), false).await;

        let FetchOutcome::Failed(QueryError::FetchError(message)) = outcome else {
            panic!("expected a fetch failure, got {outcome:?}");
        };
        assert!(message.contains("exploded while fetching"));
        let state = record.state();
        assert!(!state.is_fetching);
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.failure_count, 1);

        // Nothing is in flight any more, so the record can be evicted.
        sub.unsubscribe();
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn test_panicking_call_settles_as_failure() {
        let (_cache, record) = record();
        let errors = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&errors);
        let callbacks = Callbacks {
            on_success: None,
            on_error: Some(Arc::new(move |_: &QueryError| {
                sink.fetch_add(1, Ordering::SeqCst);
            })),
        };
        let exploding = producer(|_| -> future::Ready<Result<i32, QueryError>> {
            panic!("exploded before returning a future")
        });

        let outcome = start(&record, &exploding, &callbacks, false).await;

        assert!(matches!(outcome, FetchOutcome::Failed(QueryError::FetchError(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!record.is_fetching());
        assert!(!record.cancel());
    }

    #[tokio::test]
    async fn test_producer_reporting_cancelled_is_not_a_failure() {
        let (_cache, record) = record();
        let aborting = producer(|_| async { Err(QueryError::Cancelled) });

        let outcome = start(&record, &aborting, &Callbacks::default(), false).await;

        assert_eq!(outcome, FetchOutcome::Cancelled);
        let state = record.state();
        assert_eq!(state.failure_count, 0);
        assert!(state.error.is_none());
        assert!(!state.is_fetching);
    }
}
