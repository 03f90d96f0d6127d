//! Typed document access built on [`SubscriptionFuture`](crate::subscription::SubscriptionFuture).
//!
//! A [`Collection`] turns reads into subscription futures over a
//! [`DocumentSource`], so the same read can be awaited once or listened to:
//!
//! ```
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use typed_docstore::store::{Collection, InMemorySource};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct City {
//!     name: String,
//! }
//!
//! # futures::executor::block_on(async {
//! let cities: Collection<City> = Collection::new(Arc::new(InMemorySource::new()), "cities")?;
//! cities.set("sf", &City { name: "San Francisco".into() }).await?;
//!
//! let sf = cities.get("sf").await?.expect("document exists");
//! assert_eq!(sf.data().name, "San Francisco");
//! # Ok::<(), typed_docstore::store::StoreError>(())
//! # }).unwrap();
//! ```

mod collection;
mod error;
pub mod model;
mod query;
mod query_evaluator;
mod snapshot;
pub mod source;
mod write_batch;

pub use collection::{Collection, QueryFuture};
pub use error::{
    aborted, failed_precondition, internal_error, invalid_argument, not_found, permission_denied,
    unavailable, StoreError, StoreErrorCode, StoreResult,
};
pub use model::{DocumentKey, FieldPath, IntoFieldPath, ResourcePath};
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
pub use snapshot::{ChangeKind, Doc, DocChange, QueryMeta, QuerySnapshot, RawChange, RawDocument};
pub use source::{DocumentSink, DocumentSource, InMemorySource, QuerySink, WriteOperation};
pub use write_batch::WriteBatch;
