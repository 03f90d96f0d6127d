//! Dual-mode read results.
//!
//! A [`SubscriptionFuture`] is either awaited once or listened to for live
//! updates, never both. [`with_retry`] wraps the listen side so that upstream
//! failures resubscribe with backoff before they reach the caller.

mod error;
mod future;
mod registration;
mod request;
mod retry;

pub use error::UsageError;
pub use future::{
    ErrorSink, FetchFn, RawTeardown, ResultSink, SubscribeFn, SubscriptionFuture,
};
pub use registration::{ErrorCallback, Listen, ListenerRegistration, ResultCallback};
pub use request::RequestDescriptor;
pub use retry::{with_retry, RetryOptions, RetryingListen, DEFAULT_RETRY_PATTERN_MILLIS};
