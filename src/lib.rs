//! # Query Signal - Asynchronous Query Cache
//!
//! Query Signal caches the results of asynchronous fetches by key. It fetches each
//! key at most once at a time, tracks how fresh the cached data is, refreshes it on
//! a schedule or when the host regains focus, and evicts data nobody observes.
//!
//! ## Architecture
//!
//! 1. **Key**: a list of JSON segments, encoded canonically so equal keys match
//! 2. **Record**: the state machine holding one key's data, error and timestamps
//! 3. **Cache**: the map from encoded key to record
//! 4. **Fetch**: runs a producer against a record, single-flight and cancellable
//! 5. **Refresh**: decides when an automatic refetch may run and drives it
//! 6. **Subscription**: counts observers and evicts records after `gc_time`
//!
//! ## Core Components
//!
//! - [`QueryClient`](client::QueryClient): Owns the cache and the host focus signal
//! - [`Query`](query::Query): A key bound to a producer and a refresh policy
//! - [`QueryRecord`](record::QueryRecord): The state of one cache entry
//! - [`Subscription`](subscription::Subscription): An observer of one record
//!
//! ## Example
//!
//! ```rust
//! use query_signal::{client::QueryClient, error::QueryError, key::QueryKey, query::Query};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let todos = Query::new(QueryKey::from("todos"), &client, |_token| async {
//!     Ok::<_, QueryError>(vec!["write docs".to_string()])
//! })
//! .stale_time(Duration::from_secs(30));
//!
//! let _subscription = todos.subscribe(|| println!("todos changed"))?;
//! let data = todos.fetch().await?.into_result()?;
//! assert_eq!(data.len(), 1);
//!
//! // Mark every query under "todos" stale.
//! client.invalidate(&QueryKey::from("todos"), false);
//! assert!(todos.is_stale()?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod query;
pub mod record;
pub mod refresh;
pub mod subscription;

pub use client::QueryClient;
pub use config::QueryConfig;
pub use error::QueryError;
pub use fetch::FetchOutcome;
pub use key::QueryKey;
pub use query::Query;
