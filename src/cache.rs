//! The query store: a map from encoded key to [`QueryRecord`].
//!
//! Records of different value types share one map, so entries are stored
//! type-erased and recovered with a checked downcast. Bulk operations collect the
//! matching records first and only then act on them, so no map shard lock is held
//! while records notify their subscribers.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::key::{QueryKey, matches_encoded};
use crate::record::{ErasedRecord, QueryRecord, QueryStats};

type Records = DashMap<String, Arc<dyn ErasedRecord>>;

/// Shared, cheaply clonable query store.
#[derive(Clone, Default)]
pub struct QueryCache {
    records: Arc<Records>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("records", &self.records.len())
            .finish()
    }
}

impl QueryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `key`, creating an empty one if none exists.
    pub fn ensure<V>(&self, key: &QueryKey) -> Result<Arc<QueryRecord<V>>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let erased = Arc::clone(
            self.records
                .entry(key.encoded().to_string())
                .or_insert_with(|| {
                    tracing::trace!(key = %key, "creating query record");
                    Arc::new(QueryRecord::<V>::new(
                        key.encoded().to_string(),
                        self.downgrade(),
                    ))
                })
                .value(),
        );
        downcast(key.encoded(), erased)
    }

    /// Returns the record for `key` if one exists.
    pub fn get<V>(&self, key: &QueryKey) -> Result<Option<Arc<QueryRecord<V>>>, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let Some(erased) = self.records.get(key.encoded()).map(|r| Arc::clone(r.value())) else {
            return Ok(None);
        };
        downcast(key.encoded(), erased).map(Some)
    }

    /// Removes the record for `key`, cancelling its in-flight fetch.
    ///
    /// Returns `true` if a record was removed.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let Some((_, record)) = self.records.remove(key.encoded()) else {
            return false;
        };
        record.cancel();
        tracing::debug!(key = %key, "removed query");
        true
    }

    /// Marks matching records stale. Returns the number of records matched.
    ///
    /// With `exact`, only the record for `key` matches; otherwise every record whose
    /// key starts with `key`'s segments does.
    pub fn invalidate(&self, key: &QueryKey, exact: bool) -> usize {
        let now = Instant::now();
        let matched = self.matching(key, exact);
        for record in &matched {
            record.invalidate(now);
        }
        tracing::debug!(key = %key, exact, count = matched.len(), "invalidated queries");
        matched.len()
    }

    /// Cancels in-flight fetches of matching records.
    ///
    /// Returns the number of fetches actually cancelled.
    pub fn cancel(&self, key: &QueryKey, exact: bool) -> usize {
        let cancelled = self
            .matching(key, exact)
            .iter()
            .filter(|record| record.cancel())
            .count();
        tracing::debug!(key = %key, exact, count = cancelled, "cancelled queries");
        cancelled
    }

    /// Summarizes every record, keyed by encoded key.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, QueryStats> {
        let records: Vec<_> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        records
            .into_iter()
            .map(|(key, record)| (key, record.stats()))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.records.contains_key(key.encoded())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Arc::downgrade(&self.records))
    }

    fn matching(&self, key: &QueryKey, exact: bool) -> Vec<Arc<dyn ErasedRecord>> {
        if exact {
            return self
                .records
                .get(key.encoded())
                .map(|r| vec![Arc::clone(r.value())])
                .unwrap_or_default();
        }
        self.records
            .iter()
            .filter(|entry| matches_encoded(entry.key(), key.encoded(), false))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn downcast<V>(key: &str, erased: Arc<dyn ErasedRecord>) -> Result<Arc<QueryRecord<V>>, QueryError>
where
    V: Clone + Send + Sync + 'static,
{
    erased
        .into_any()
        .downcast::<QueryRecord<V>>()
        .map_err(|_| QueryError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<V>(),
        })
}

/// A handle records use to evict themselves without keeping the cache alive.
#[derive(Clone)]
pub(crate) struct WeakQueryCache(Weak<Records>);

impl WeakQueryCache {
    /// Removes `record` if it is still the entry stored under `key`.
    pub(crate) fn evict<V>(&self, key: &str, record: &QueryRecord<V>) -> bool {
        let Some(records) = self.0.upgrade() else {
            return false;
        };
        records
            .remove_if(key, |_, stored| {
                std::ptr::addr_eq(Arc::as_ptr(stored), std::ptr::from_ref(record))
            })
            .is_some()
    }
}
