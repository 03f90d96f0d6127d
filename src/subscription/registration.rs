use std::fmt;
use std::sync::{Arc, Mutex};

use super::error::UsageError;
use super::request::RequestDescriptor;

/// Receives every result (and its subscription metadata) delivered to a listener.
pub type ResultCallback<T, M> = Arc<dyn Fn(&T, &M) + Send + Sync + 'static>;
/// Receives errors reported while listening.
pub type ErrorCallback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

type Detach = Box<dyn FnOnce() + Send + 'static>;
type AttachError<E> = Arc<dyn Fn(ErrorCallback<E>) -> ListenerRegistration<E> + Send + Sync>;

/// The listen contract shared by [`SubscriptionFuture`](super::SubscriptionFuture)
/// and the retry decorator.
pub trait Listen<T, M, E>: Send + Sync {
    /// The descriptor of the operation behind this listener.
    fn request(&self) -> &RequestDescriptor;

    /// Attaches a result listener and returns its teardown handle.
    fn listen_with(
        &self,
        on_result: ResultCallback<T, M>,
    ) -> Result<ListenerRegistration<E>, UsageError>;

    /// Closure flavour of [`Listen::listen_with`].
    fn listen<F>(&self, on_result: F) -> Result<ListenerRegistration<E>, UsageError>
    where
        F: Fn(&T, &M) + Send + Sync + 'static,
        Self: Sized,
    {
        self.listen_with(Arc::new(on_result))
    }
}

/// Teardown handle returned by [`Listen::listen`].
///
/// Detaching is explicit: dropping the registration leaves the listener
/// attached, so a handle may be discarded once `catch` has been chained.
pub struct ListenerRegistration<E> {
    detach: Arc<Mutex<Option<Detach>>>,
    attach_error: AttachError<E>,
}

impl<E> ListenerRegistration<E> {
    pub fn new<D, A>(detach: D, attach_error: A) -> Self
    where
        D: FnOnce() + Send + 'static,
        A: Fn(ErrorCallback<E>) -> ListenerRegistration<E> + Send + Sync + 'static,
    {
        Self {
            detach: Arc::new(Mutex::new(Some(Box::new(detach)))),
            attach_error: Arc::new(attach_error),
        }
    }

    /// Removes the listener this handle was created for. Calling it again is a no-op.
    pub fn detach(&self) {
        let detach = self.detach.lock().unwrap().take();
        if let Some(detach) = detach {
            detach();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detach.lock().unwrap().is_none()
    }

    /// Registers an error listener. The returned handle removes only that listener.
    pub fn catch<F>(&self, on_error: F) -> ListenerRegistration<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.catch_with(Arc::new(on_error))
    }

    pub fn catch_with(&self, on_error: ErrorCallback<E>) -> ListenerRegistration<E> {
        (self.attach_error)(on_error)
    }
}

impl<E> Clone for ListenerRegistration<E> {
    fn clone(&self) -> Self {
        Self {
            detach: Arc::clone(&self.detach),
            attach_error: Arc::clone(&self.attach_error),
        }
    }
}

impl<E> fmt::Debug for ListenerRegistration<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("detached", &self.is_detached())
            .finish()
    }
}
