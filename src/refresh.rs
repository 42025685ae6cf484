//! Automatic refresh scheduling.
//!
//! Refreshes are attempted on three occasions: once when a query starts being
//! driven, on every tick of its refetch interval, and when the host becomes
//! visible again. Each attempt first asks the refresh gate whether a fetch is
//! currently permitted. A denied attempt is a no-op and does not disarm anything.
//!
//! # Example
//!
//! ```rust,no_run
//! use query_signal::{client::QueryClient, key::QueryKey, query::Query};
//! use query_signal::refresh::focus::HostEvent;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let client = QueryClient::new();
//! let query = Query::new(QueryKey::from("clock"), &client, |_token| async {
//!     Ok::<_, query_signal::error::QueryError>(std::time::SystemTime::now())
//! })
//! .refetch_interval(Duration::from_secs(10));
//!
//! let handle = query.spawn_refresh();
//! client.focus().emit(HostEvent::Focus);
//! handle.cancel().await;
//! # }
//! ```

pub mod debounce;
pub mod focus;
mod interval;

use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueryConfig;
use crate::query::Query;
use crate::record::Probe;

/// How often a query refetches on its own, derived from its refetch interval.
///
/// The tier only decides the order in which the gate evaluates its conditions;
/// every tier requires all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefetchFrequency {
    /// An interval of at most five seconds.
    High,
    /// An interval above five and at most thirty seconds.
    Medium,
    /// No interval, or one above thirty seconds.
    Low,
}

const HIGH_FREQUENCY_LIMIT: Duration = Duration::from_secs(5);
const MEDIUM_FREQUENCY_LIMIT: Duration = Duration::from_secs(30);

impl RefetchFrequency {
    #[must_use]
    pub fn classify(refetch_interval: Option<Duration>) -> Self {
        match refetch_interval {
            Some(interval) if !interval.is_zero() && interval <= HIGH_FREQUENCY_LIMIT => Self::High,
            Some(interval) if interval > HIGH_FREQUENCY_LIMIT && interval <= MEDIUM_FREQUENCY_LIMIT => {
                Self::Medium
            }
            _ => Self::Low,
        }
    }

    /// Gate conditions in evaluation order.
    const fn checks(self) -> [Check; 5] {
        use Check::{Enabled, HasProducer, NotFetching, RetryBudget, Stale};
        match self {
            Self::High => [NotFetching, Stale, Enabled, RetryBudget, HasProducer],
            Self::Medium => [Enabled, HasProducer, Stale, NotFetching, RetryBudget],
            Self::Low => [Enabled, HasProducer, NotFetching, RetryBudget, Stale],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Check {
    Enabled,
    HasProducer,
    NotFetching,
    RetryBudget,
    Stale,
}

impl Check {
    const fn passes(self, config: &QueryConfig, has_producer: bool, probe: &Probe) -> bool {
        match self {
            Self::Enabled => config.enabled,
            Self::HasProducer => has_producer,
            Self::NotFetching => !probe.is_fetching,
            Self::RetryBudget => !(probe.has_error && probe.failure_count >= config.retry),
            Self::Stale => probe.is_stale,
        }
    }
}

/// Decides whether an automatic refresh may start.
///
/// All of the following must hold: the query is enabled, it has a producer, no
/// fetch is in flight, it has not used up its retry budget, and its data is stale.
pub(crate) fn can_fetch(config: &QueryConfig, has_producer: bool, probe: &Probe) -> bool {
    RefetchFrequency::classify(config.refetch_interval)
        .checks()
        .into_iter()
        .all(|check| check.passes(config, has_producer, probe))
}

/// What prompted a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Mount,
    Interval,
    Focus,
    Manual,
}

/// Handle for a running refresh driver.
///
/// Dropping the handle stops the driver; [`cancel`](Self::cancel) also waits for it.
#[derive(Debug)]
pub struct RefreshHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RefreshHandle {
    /// Stop the driver and wait for its task to finish.
    pub async fn cancel(mut self) {
        self.token.cancel();
        let _ = (&mut self.join).await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns the task that drives automatic refreshes for `query`.
///
/// Fetches started by the driver run on their own tasks; stopping the driver does
/// not cancel them.
pub(crate) fn spawn<V>(query: Query<V>) -> RefreshHandle
where
    V: Clone + Send + Sync + 'static,
{
    let config = query.config().clone();
    let mut ticks: BoxStream<'static, ()> = match config.refetch_interval {
        Some(period) if !period.is_zero() => interval::ticks(period),
        _ => stream::pending().boxed(),
    };

    let signal = query.client().focus().clone();
    let mut focus = if config.refetch_on_window_focus {
        debounce::debounce(signal.events(), config.focus_debounce)
    } else {
        stream::pending().boxed()
    };

    let token = CancellationToken::new();
    let stop = token.clone();
    let join = tokio::spawn(async move {
        query.try_refresh(Trigger::Mount);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                Some(()) = ticks.next() => {
                    query.try_refresh(Trigger::Interval);
                }
                Some(_) = focus.next() => {
                    if signal.is_visible() {
                        query.try_refresh(Trigger::Focus);
                    }
                }
            }
        }
        tracing::trace!(key = %query.key(), "refresh driver stopped");
    });

    RefreshHandle { token, join }
}
