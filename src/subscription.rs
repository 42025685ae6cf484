//! Observer registration and the eviction lifecycle.
//!
//! Every [`Subscription`] counts as one observer of a record. When the last
//! observer leaves, the record is evicted after the query's `gc_time`, unless an
//! observer returns first. A record with a fetch in flight is never evicted; if its
//! grace period runs out during the fetch, eviction happens when the fetch settles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::record::{ErasedRecord, Listener, QueryRecord, SubscriberId};

/// An active observer of a record.
///
/// Dropping the subscription unsubscribes it. Listeners receive no payload and
/// are expected to read the current state from the query or client.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    record: Option<Arc<dyn ErasedRecord>>,
    id: SubscriberId,
    gc_time: Duration,
    key: String,
}

impl Subscription {
    pub(crate) fn attach<V>(record: Arc<QueryRecord<V>>, listener: Listener, gc_time: Duration) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        let id = record.add_subscriber(listener);
        tracing::trace!(key = record.key(), ?id, "subscribed");
        Self {
            key: record.key().to_string(),
            record: Some(record),
            id,
            gc_time,
        }
    }

    /// The encoded key of the observed record.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stops observing. Equivalent to dropping the subscription.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(record) = self.record.take() {
            tracing::trace!(key = %self.key, id = ?self.id, "unsubscribed");
            record.release(self.id, self.gc_time);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("gc_time", &self.gc_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::key::QueryKey;

    #[test]
    fn test_zero_gc_time_evicts_synchronously() {
        let cache = QueryCache::new();
        let key = QueryKey::from("a");
        let record = cache.ensure::<i32>(&key).unwrap();

        let sub = Subscription::attach(record, Arc::new(|| {}), Duration::ZERO);
        assert_eq!(sub.key(), key.encoded());
        assert!(cache.contains(&key));

        sub.unsubscribe();
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_remaining_observer_keeps_record() {
        let cache = QueryCache::new();
        let key = QueryKey::from("b");
        let record = cache.ensure::<i32>(&key).unwrap();

        let first = Subscription::attach(Arc::clone(&record), Arc::new(|| {}), Duration::ZERO);
        let second = Subscription::attach(Arc::clone(&record), Arc::new(|| {}), Duration::ZERO);
        assert_eq!(record.subscriber_count(), 2);

        drop(first);
        assert!(cache.contains(&key));
        assert_eq!(record.subscriber_count(), 1);

        drop(second);
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_no_runtime_keeps_record() {
        let cache = QueryCache::new();
        let key = QueryKey::from("c");
        let record = cache.ensure::<i32>(&key).unwrap();

        drop(Subscription::attach(record, Arc::new(|| {}), Duration::from_secs(1)));
        assert!(cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_gc_time() {
        let cache = QueryCache::new();
        let key = QueryKey::from("d");
        let record = cache.ensure::<i32>(&key).unwrap();

        drop(Subscription::attach(record, Arc::new(|| {}), Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(cache.contains(&key));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!cache.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_cancels_eviction() {
        let cache = QueryCache::new();
        let key = QueryKey::from("e");
        let record = cache.ensure::<i32>(&key).unwrap();

        drop(Subscription::attach(Arc::clone(&record), Arc::new(|| {}), Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        let again = Subscription::attach(Arc::clone(&record), Arc::new(|| {}), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(cache.contains(&key));

        // The timer from the first departure must not fire early for the second.
        drop(again);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(cache.contains(&key));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!cache.contains(&key));
    }
}
