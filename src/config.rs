use std::time::Duration;

use serde::Deserialize;

/// Refresh and retention policy for a query.
///
/// A [`QueryClient`](crate::client::QueryClient) carries one as the default for
/// every query it creates; [`Query`](crate::query::Query) builders override
/// individual fields per registration.
///
/// Durations deserialize from human-readable strings:
///
/// ```
/// use query_signal::config::QueryConfig;
/// use std::time::Duration;
///
/// let config: QueryConfig =
///     serde_json::from_str(r#"{ "stale_time": "30s", "refetch_interval": "1m" }"#).unwrap();
/// assert_eq!(config.stale_time, Duration::from_secs(30));
/// assert_eq!(config.refetch_interval, Some(Duration::from_secs(60)));
/// assert_eq!(config.retry, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, queries will refetch in the background while still showing cached data.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,

    /// How long a record without subscribers is retained before being evicted.
    ///
    /// Zero evicts as soon as the last subscriber leaves.
    #[serde(with = "humantime_serde")]
    pub gc_time: Duration,

    /// Period of the background refetch timer, or `None` to disable it.
    #[serde(with = "humantime_serde")]
    pub refetch_interval: Option<Duration>,

    /// Whether focus and visibility signals from the host trigger a refetch.
    pub refetch_on_window_focus: bool,

    /// Consecutive failures after which automatic refetches stop.
    pub retry: u32,

    /// Master switch for automatic refetches.
    ///
    /// Only gated refreshes are affected: mount, interval ticks, focus signals and
    /// `Query::refresh`. Explicit `Query::fetch` and `Query::refetch` calls still run.
    pub enabled: bool,

    /// Window over which bursts of focus and visibility signals are coalesced.
    #[serde(with = "humantime_serde")]
    pub focus_debounce: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),    // immediately stale
            gc_time: Duration::from_secs(5 * 60), // 5 minutes
            refetch_interval: None,
            refetch_on_window_focus: true,
            retry: 3,
            enabled: true,
            focus_debounce: Duration::from_millis(200),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and gc times.
    #[must_use]
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_time, Duration::from_secs(0));
        assert_eq!(config.gc_time, Duration::from_secs(5 * 60));
        assert_eq!(config.refetch_interval, None);
        assert!(config.refetch_on_window_focus);
        assert_eq!(config.retry, 3);
        assert!(config.enabled);
        assert_eq!(config.focus_debounce, Duration::from_millis(200));
    }

    #[test]
    fn test_new_config() {
        let config = QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300));
        assert_eq!(config.stale_time, Duration::from_secs(30));
        assert_eq!(config.gc_time, Duration::from_secs(300));
        assert_eq!(config.retry, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: QueryConfig = serde_json::from_str(
            r#"{ "gc_time": "0s", "retry": 1, "enabled": false, "refetch_on_window_focus": false }"#,
        )
        .unwrap();
        assert_eq!(config.gc_time, Duration::ZERO);
        assert_eq!(config.retry, 1);
        assert!(!config.enabled);
        assert!(!config.refetch_on_window_focus);
        assert_eq!(config.stale_time, Duration::ZERO);
    }

    #[test]
    fn test_deserialize_rejects_bad_duration() {
        let result = serde_json::from_str::<QueryConfig>(r#"{ "stale_time": "soon" }"#);
        assert!(result.is_err());
    }
}
