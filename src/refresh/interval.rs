//! Periodic refresh ticks.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::wrappers::IntervalStream;

/// A stream that yields once per `period`, starting one period from now.
///
/// Uses `tokio::time::interval` with `MissedTickBehavior::Skip`: a tick that could
/// not be delivered on time is dropped rather than replayed, so a slow consumer
/// sees at most one tick per period. The stream never ends, which keeps the timer
/// armed whether or not a tick led to a fetch.
pub(crate) fn ticks(period: Duration) -> BoxStream<'static, ()> {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    IntervalStream::new(interval)
        .skip(1) // Skip the first immediate tick
        .map(|_| ())
        .boxed()
}
