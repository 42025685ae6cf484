//! Trailing-edge debouncing for host event streams.

use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::time::timeout;

/// Coalesces bursts of items into one.
///
/// An item is emitted once `window` has passed without another item arriving; it
/// is the last item of the burst. When the input ends, a pending item is flushed
/// before the output ends.
pub fn debounce<S>(input: S, window: Duration) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    stream::unfold(Some(input.boxed()), move |input| async move {
        let mut input = input?;
        let mut latest = input.next().await?;
        loop {
            match timeout(window, input.next()).await {
                Ok(Some(item)) => latest = item,
                Ok(None) => return Some((latest, None)),
                Err(_) => return Some((latest, Some(input))),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{Instant, sleep};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_last_item_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut debounced = debounce(UnboundedReceiverStream::new(rx), Duration::from_millis(200));
        let start = Instant::now();

        tokio::spawn(async move {
            for n in 1..=5 {
                tx.send(n).unwrap();
                sleep(Duration::from_millis(50)).await;
            }
            sleep(Duration::from_secs(10)).await;
        });

        assert_eq!(debounced.next().await, Some(5));
        // Last item at 200ms, emitted one window later.
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_emit_separately() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut debounced = debounce(UnboundedReceiverStream::new(rx), Duration::from_millis(100));

        tx.send("a").unwrap();
        assert_eq!(debounced.next().await, Some("a"));
        tx.send("b").unwrap();
        tx.send("c").unwrap();
        assert_eq!(debounced.next().await, Some("c"));
    }

    #[tokio::test]
    async fn test_flushes_on_end() {
        let debounced = debounce(stream::iter([1, 2, 3]), Duration::from_secs(60));
        let items: Vec<_> = debounced.collect().await;
        assert_eq!(items, vec![3]);
    }
}
