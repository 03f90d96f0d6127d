//! Typed document access where every read is a dual-mode subscription future.
//!
//! The [`subscription`] module holds the core primitive: a
//! [`SubscriptionFuture`](subscription::SubscriptionFuture) can be awaited once
//! or listened to by any number of listeners sharing one upstream
//! subscription, and [`with_retry`](subscription::with_retry) re-establishes a
//! failed subscription following a backoff pattern. The [`store`] module builds
//! typed collections, queries and write batches on top of it.
//!
//! ```
//! use std::sync::Arc;
//!
//! use serde_json::Value;
//! use typed_docstore::store::{Collection, Doc, InMemorySource, QueryMeta, StoreError};
//! use typed_docstore::subscription::{with_retry, Listen, RetryOptions};
//!
//! let cities: Collection<Value> =
//!     Collection::new(Arc::new(InMemorySource::new()), "cities").unwrap();
//!
//! let live = with_retry(cities.all(), RetryOptions::default());
//! let registration = live
//!     .listen(|docs: &Vec<Doc<Value>>, meta: &QueryMeta<Value>| {
//!         println!("{} cities ({} changes)", docs.len(), meta.changes.len());
//!     })
//!     .unwrap();
//! registration.catch(|err: &StoreError| eprintln!("gave up: {err}"));
//! registration.detach();
//! ```

pub mod logger;
pub mod platform;
pub mod store;
pub mod subscription;
