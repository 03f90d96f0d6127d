use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::logger::Logger;

use super::error::UsageError;
use super::registration::{ErrorCallback, Listen, ListenerRegistration, ResultCallback};
use super::request::RequestDescriptor;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@docstore/subscription"));

/// Callback handed to a subscribe function for every upstream result.
pub type ResultSink<T, M> = Arc<dyn Fn(T, M) + Send + Sync + 'static>;
/// Callback handed to a subscribe function for upstream errors.
pub type ErrorSink<E> = Arc<dyn Fn(E) + Send + Sync + 'static>;
/// Closes an upstream subscription.
pub type RawTeardown = Box<dyn FnOnce() + Send + 'static>;
/// Performs a single round-trip read.
pub type FetchFn<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send + 'static>;
/// Opens a live upstream subscription.
pub type SubscribeFn<T, M, E> =
    Arc<dyn Fn(ResultSink<T, M>, ErrorSink<E>) -> RawTeardown + Send + Sync + 'static>;

type SharedFetch<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// The eventual, or continuously updating, result of a read operation.
///
/// Consumed either once through [`resolve`](Self::resolve) (or `.await`), or
/// repeatedly through [`Listen::listen`]. Using both on the same instance is a
/// [`UsageError`]. Any number of listeners share a single upstream
/// subscription, which is opened by the first listener and closed when the
/// last result or error listener detaches.
pub struct SubscriptionFuture<T, E, M = ()> {
    inner: Arc<Inner<T, E, M>>,
}

struct Inner<T, E, M> {
    request: RequestDescriptor,
    subscribe: SubscribeFn<T, M, E>,
    state: Mutex<State<T, E, M>>,
}

enum Phase<T, E> {
    Unresolved,
    Resolving(SharedFetch<T, E>),
    Resolved(Result<T, E>),
    Subscribing { generation: u64, cancelled: bool },
    Subscribed { generation: u64, teardown: RawTeardown },
    /// Listen mode with no upstream subscription open.
    Unsubscribed,
}

struct Notification<T, M> {
    value: T,
    meta: M,
}

struct State<T, E, M> {
    phase: Phase<T, E>,
    fetch: Option<FetchFn<T, E>>,
    generation: u64,
    next_listener_id: u64,
    result_listeners: Vec<(u64, ResultCallback<T, M>)>,
    error_listeners: Vec<(u64, ErrorCallback<E>)>,
    latest: Option<Arc<Notification<T, M>>>,
    latest_error: Option<Arc<E>>,
}

impl<T, E, M> State<T, E, M> {
    fn next_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }

    fn is_current(&self, generation: u64) -> bool {
        match &self.phase {
            Phase::Subscribing {
                generation: current,
                cancelled,
            } => *current == generation && !cancelled,
            Phase::Subscribed {
                generation: current,
                ..
            } => *current == generation,
            _ => false,
        }
    }

    fn is_listening(&self) -> bool {
        matches!(
            self.phase,
            Phase::Subscribing {
                cancelled: false,
                ..
            } | Phase::Subscribed { .. }
        )
    }

    /// Closes the upstream subscription once no listener of either kind remains.
    fn release_if_unobserved(&mut self) -> Option<RawTeardown> {
        if !self.result_listeners.is_empty() || !self.error_listeners.is_empty() {
            return None;
        }
        self.latest = None;
        self.latest_error = None;
        match std::mem::replace(&mut self.phase, Phase::Unsubscribed) {
            Phase::Subscribed { teardown, .. } => Some(teardown),
            Phase::Subscribing { generation, .. } => {
                self.phase = Phase::Subscribing {
                    generation,
                    cancelled: true,
                };
                None
            }
            other => {
                self.phase = other;
                None
            }
        }
    }
}

impl<T, E, M> SubscriptionFuture<T, E, M>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    pub fn new<F, S>(request: RequestDescriptor, fetch: F, subscribe: S) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>> + Send + 'static,
        S: Fn(ResultSink<T, M>, ErrorSink<E>) -> RawTeardown + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                request,
                subscribe: Arc::new(subscribe),
                state: Mutex::new(State {
                    phase: Phase::Unresolved,
                    fetch: Some(Box::new(fetch)),
                    generation: 0,
                    next_listener_id: 0,
                    result_listeners: Vec::new(),
                    error_listeners: Vec::new(),
                    latest: None,
                    latest_error: None,
                }),
            }),
        }
    }

    /// The descriptor of the operation that produced this future.
    pub fn request(&self) -> &RequestDescriptor {
        &self.inner.request
    }

    /// Resolves the operation once.
    ///
    /// The fetch function runs on the first call only; later calls, including
    /// concurrent ones, observe the same outcome. Fails with
    /// [`UsageError::ResolveAfterListen`] if the instance has been listened to.
    pub fn resolve(&self) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        E: From<UsageError>,
    {
        let pending = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            match &state.phase {
                Phase::Resolved(outcome) => Err(outcome.clone()),
                Phase::Resolving(shared) => Ok(shared.clone()),
                Phase::Unresolved => match state.fetch.take() {
                    Some(fetch) => {
                        let shared = async move { fetch().await }.boxed().shared();
                        state.phase = Phase::Resolving(shared.clone());
                        Ok(shared)
                    }
                    None => Err(Err(E::from(UsageError::ResolveAfterListen))),
                },
                _ => Err(Err(E::from(UsageError::ResolveAfterListen))),
            }
        };

        let inner = Arc::clone(&self.inner);
        async move {
            let shared = match pending {
                Ok(shared) => shared,
                Err(settled) => return settled,
            };
            let outcome = shared.await;
            let mut state = inner.state.lock().unwrap();
            if matches!(state.phase, Phase::Resolving(_)) {
                state.phase = Phase::Resolved(outcome.clone());
            }
            outcome
        }
    }

    fn start_subscription(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        let on_result: ResultSink<T, M> = {
            let weak = Weak::clone(&weak);
            Arc::new(move |value, meta| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_result(generation, value, meta);
                }
            })
        };
        let on_error: ErrorSink<E> = Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_error(generation, error);
            }
        });

        LOGGER.debug(format!("opening subscription for {}", self.inner.request.kind()));
        let teardown = (self.inner.subscribe)(on_result, on_error);

        let stale = {
            let mut state = self.inner.state.lock().unwrap();
            let pending = match &state.phase {
                Phase::Subscribing {
                    generation: current,
                    cancelled,
                } if *current == generation => Some(*cancelled),
                _ => None,
            };
            match pending {
                Some(false) => {
                    state.phase = Phase::Subscribed {
                        generation,
                        teardown,
                    };
                    None
                }
                Some(true) => {
                    state.phase = Phase::Unsubscribed;
                    Some(teardown)
                }
                None => Some(teardown),
            }
        };

        // Every listener detached while the subscribe call was still running.
        if let Some(teardown) = stale {
            LOGGER.debug("closing subscription abandoned during subscribe");
            teardown();
        }
    }

    fn registration(&self, id: u64, kind: ListenerKind) -> ListenerRegistration<E> {
        let detach = {
            let inner = Arc::clone(&self.inner);
            move || inner.remove_listener(id, kind)
        };
        let attach = {
            let inner = Arc::clone(&self.inner);
            move |on_error: ErrorCallback<E>| Self::attach_error(&inner, on_error)
        };
        ListenerRegistration::new(detach, attach)
    }

    fn attach_error(inner: &Arc<Inner<T, E, M>>, on_error: ErrorCallback<E>) -> ListenerRegistration<E> {
        let (id, catch_up) = {
            let mut state = inner.state.lock().unwrap();
            let id = state.next_id();
            state.error_listeners.push((id, Arc::clone(&on_error)));
            (id, state.latest_error.clone())
        };
        if let Some(error) = catch_up {
            on_error(&error);
        }
        let future = SubscriptionFuture {
            inner: Arc::clone(inner),
        };
        future.registration(id, ListenerKind::Error)
    }
}

impl<T, E, M> Listen<T, M, E> for SubscriptionFuture<T, E, M>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    M: Send + Sync + 'static,
{
    fn request(&self) -> &RequestDescriptor {
        &self.inner.request
    }

    fn listen_with(
        &self,
        on_result: ResultCallback<T, M>,
    ) -> Result<ListenerRegistration<E>, UsageError> {
        let (id, catch_up, subscribe_generation) = {
            let mut state = self.inner.state.lock().unwrap();
            let needs_subscribe = match &mut state.phase {
                Phase::Resolving(_) | Phase::Resolved(_) => {
                    return Err(UsageError::ListenAfterResolve)
                }
                Phase::Unresolved | Phase::Unsubscribed => true,
                Phase::Subscribing { cancelled, .. } => {
                    *cancelled = false;
                    false
                }
                Phase::Subscribed { .. } => false,
            };

            let subscribe_generation = if needs_subscribe {
                state.fetch = None;
                state.generation += 1;
                let generation = state.generation;
                state.phase = Phase::Subscribing {
                    generation,
                    cancelled: false,
                };
                Some(generation)
            } else {
                None
            };

            let id = state.next_id();
            state.result_listeners.push((id, Arc::clone(&on_result)));
            let catch_up = if state.is_listening() {
                state.latest.clone()
            } else {
                None
            };
            (id, catch_up, subscribe_generation)
        };

        if let Some(notification) = catch_up {
            on_result(&notification.value, &notification.meta);
        }
        if let Some(generation) = subscribe_generation {
            self.start_subscription(generation);
        }
        Ok(self.registration(id, ListenerKind::Result))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerKind {
    Result,
    Error,
}

impl<T, E, M> Inner<T, E, M> {
    fn dispatch_result(&self, generation: u64, value: T, meta: M) {
        let (notification, listeners) = {
            let mut state = self.state.lock().unwrap();
            if !state.is_current(generation) {
                return;
            }
            let notification = Arc::new(Notification { value, meta });
            state.latest = Some(Arc::clone(&notification));
            let listeners: Vec<_> = state
                .result_listeners
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (notification, listeners)
        };
        for listener in listeners {
            listener(&notification.value, &notification.meta);
        }
    }

    fn dispatch_error(&self, generation: u64, error: E) {
        let (error, listeners) = {
            let mut state = self.state.lock().unwrap();
            if !state.is_current(generation) {
                return;
            }
            let error = Arc::new(error);
            state.latest_error = Some(Arc::clone(&error));
            let listeners: Vec<_> = state
                .error_listeners
                .iter()
                .map(|(_, callback)| Arc::clone(callback))
                .collect();
            (error, listeners)
        };
        if listeners.is_empty() {
            LOGGER.debug(format!(
                "subscription error for {} cached with no error listener attached",
                self.request.kind()
            ));
        }
        for listener in listeners {
            listener(&error);
        }
    }

    fn remove_listener(&self, id: u64, kind: ListenerKind) {
        let teardown = {
            let mut state = self.state.lock().unwrap();
            match kind {
                ListenerKind::Result => state.result_listeners.retain(|(entry, _)| *entry != id),
                ListenerKind::Error => state.error_listeners.retain(|(entry, _)| *entry != id),
            }
            state.release_if_unobserved()
        };
        if let Some(teardown) = teardown {
            LOGGER.debug(format!("closing subscription for {}", self.request.kind()));
            teardown();
        }
    }
}

impl<T, E, M> IntoFuture for SubscriptionFuture<T, E, M>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<UsageError> + 'static,
    M: Send + Sync + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = BoxFuture<'static, Result<T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        self.resolve().boxed()
    }
}

impl<T, E, M> fmt::Debug for SubscriptionFuture<T, E, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFuture")
            .field("request", &self.inner.request)
            .finish_non_exhaustive()
    }
}
