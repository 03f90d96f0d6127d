use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use futures::future::{abortable, AbortHandle};

use serde_json::json;

use crate::logger::{LogArgument, LogLevel, Logger};
use crate::platform::runtime::{next_tick, sleep, spawn_detached};

use super::error::UsageError;
use super::registration::{ErrorCallback, Listen, ListenerRegistration, ResultCallback};
use super::request::RequestDescriptor;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@docstore/retry"));

/// Delays, in milliseconds, used by [`RetryOptions::default`].
pub const DEFAULT_RETRY_PATTERN_MILLIS: [u64; 7] = [250, 500, 1_000, 2_000, 4_000, 8_000, 16_000];

/// Configures [`with_retry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryOptions {
    /// One delay per consecutive failure, consumed left to right.
    pub pattern: Vec<Duration>,
    /// When set, listening goes straight to the wrapped source.
    pub bypass: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_RETRY_PATTERN_MILLIS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            bypass: false,
        }
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: Vec<Duration>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_pattern_millis<I>(self, pattern: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.with_pattern(pattern.into_iter().map(Duration::from_millis).collect())
    }

    pub fn bypass(mut self) -> Self {
        self.bypass = true;
        self
    }
}

/// Wraps the listen side of `source` so that upstream errors resubscribe
/// following the configured backoff pattern.
///
/// Every call to [`Listen::listen`] on the result gets its own copy of the
/// pattern. An error is forwarded to the listeners registered with
/// [`ListenerRegistration::catch`] only once the copy is exhausted.
pub fn with_retry<L>(source: L, options: RetryOptions) -> RetryingListen<L> {
    RetryingListen {
        source: Arc::new(source),
        options,
    }
}

/// A listen entry point that recovers from upstream errors. See [`with_retry`].
pub struct RetryingListen<L> {
    source: Arc<L>,
    options: RetryOptions,
}

impl<L> RetryingListen<L> {
    /// The wrapped listen source.
    pub fn source(&self) -> &L {
        &self.source
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }
}

impl<L, T, M, E> Listen<T, M, E> for RetryingListen<L>
where
    L: Listen<T, M, E> + 'static,
    T: Send + Sync + 'static,
    M: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn request(&self) -> &RequestDescriptor {
        self.source.request()
    }

    fn listen_with(
        &self,
        on_result: ResultCallback<T, M>,
    ) -> Result<ListenerRegistration<E>, UsageError> {
        if self.options.bypass {
            return self.source.listen_with(on_result);
        }
        let backoff = self.options.pattern.iter().copied().collect();
        RetryListener::start(Arc::clone(&self.source), on_result, backoff)
    }
}

struct Attempt<E> {
    id: u64,
    registration: ListenerRegistration<E>,
    errors: ListenerRegistration<E>,
}

impl<E> Attempt<E> {
    fn detach(self) {
        self.errors.detach();
        self.registration.detach();
    }
}

struct RetryState<E> {
    backoff: VecDeque<Duration>,
    attempt: u64,
    /// Attempt whose failure already has a resubscription scheduled.
    retrying: Option<u64>,
    /// Delay for an attempt that failed before `subscribe` stored its handle.
    deferred: Option<Duration>,
    current: Option<Attempt<E>>,
    timer: Option<AbortHandle>,
    stopped: bool,
    next_listener_id: u64,
    error_listeners: Vec<(u64, ErrorCallback<E>)>,
    final_error: Option<Arc<E>>,
}

enum Recovery<E> {
    Retry(Duration),
    Forward(Arc<E>, Vec<ErrorCallback<E>>),
}

struct RetryListener<L, T, M, E> {
    source: Arc<L>,
    on_result: ResultCallback<T, M>,
    state: Mutex<RetryState<E>>,
}

impl<L, T, M, E> RetryListener<L, T, M, E>
where
    L: Listen<T, M, E> + 'static,
    T: Send + Sync + 'static,
    M: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn start(
        source: Arc<L>,
        on_result: ResultCallback<T, M>,
        backoff: VecDeque<Duration>,
    ) -> Result<ListenerRegistration<E>, UsageError> {
        let listener = Arc::new(Self {
            source,
            on_result,
            state: Mutex::new(RetryState {
                backoff,
                attempt: 0,
                retrying: None,
                deferred: None,
                current: None,
                timer: None,
                stopped: false,
                next_listener_id: 0,
                error_listeners: Vec::new(),
                final_error: None,
            }),
        });
        listener.subscribe()?;

        let stop = {
            let listener = Arc::clone(&listener);
            move || listener.stop()
        };
        let attach = {
            let listener = Arc::clone(&listener);
            move |on_error| listener.attach_error(on_error)
        };
        Ok(ListenerRegistration::new(stop, attach))
    }

    fn subscribe(self: &Arc<Self>) -> Result<(), UsageError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return Ok(());
            }
            state.attempt += 1;
            state.retrying = None;
            state.deferred = None;
            state.attempt
        };

        let forward: ResultCallback<T, M> = {
            let listener = Arc::clone(self);
            Arc::new(move |value: &T, meta: &M| listener.deliver(id, value, meta))
        };
        let registration = self.source.listen_with(forward)?;
        let errors = {
            let listener = Arc::clone(self);
            registration.catch(move |error: &E| listener.handle_error(id, error))
        };

        let attempt = Attempt {
            id,
            registration,
            errors,
        };
        let (superseded, deferred) = {
            let mut state = self.state.lock().unwrap();
            if state.stopped || state.attempt != id {
                (Some(attempt), None)
            } else if let Some(delay) = state.deferred.take() {
                (Some(attempt), Some(delay))
            } else {
                (state.current.replace(attempt), None)
            }
        };
        if let Some(attempt) = superseded {
            attempt.detach();
        }
        if let Some(delay) = deferred {
            self.schedule_retry(id, delay);
        }
        Ok(())
    }

    fn deliver(&self, id: u64, value: &T, meta: &M) {
        {
            let state = self.state.lock().unwrap();
            if state.stopped || state.attempt != id {
                return;
            }
        }
        (self.on_result)(value, meta);
    }

    fn handle_error(self: &Arc<Self>, id: u64, error: &E) {
        let recovery = {
            let mut state = self.state.lock().unwrap();
            if state.stopped || state.attempt != id || state.retrying == Some(id) {
                return;
            }
            match state.backoff.pop_front() {
                Some(delay) => {
                    state.retrying = Some(id);
                    let stored = matches!(&state.current, Some(current) if current.id == id);
                    if !stored {
                        // Still inside `subscribe`; it schedules the retry once
                        // the attempt's handle exists and has been detached.
                        state.deferred = Some(delay);
                        return;
                    }
                    Recovery::Retry(delay)
                }
                None => {
                    let error = Arc::new(error.clone());
                    state.final_error = Some(Arc::clone(&error));
                    let listeners = state
                        .error_listeners
                        .iter()
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect();
                    Recovery::Forward(error, listeners)
                }
            }
        };

        match recovery {
            Recovery::Retry(delay) => self.schedule_retry(id, delay),
            Recovery::Forward(error, listeners) => {
                LOGGER.warn(format!(
                    "retries exhausted for {} subscription",
                    self.source.request().kind()
                ));
                if listeners.is_empty() {
                    LOGGER.warn("final error cached with no error listener attached");
                }
                for listener in listeners {
                    listener(&error);
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: u64, delay: Duration) {
        LOGGER.log_with(
            LogLevel::Debug,
            [
                LogArgument::Text(format!(
                    "{} subscription failed, resubscribing",
                    self.source.request().kind()
                )),
                LogArgument::Value(json!({
                    "attempt": id,
                    "delay_ms": delay_millis(delay),
                })),
            ],
        );

        let listener = Arc::clone(self);
        let (task, handle) = abortable(async move {
            // Let the failing dispatch unwind before its subscription is torn down.
            next_tick().await;
            listener.teardown_attempt(id);
            sleep(delay).await;
            listener.resubscribe();
        });

        {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return;
            }
            if let Some(previous) = state.timer.replace(handle) {
                previous.abort();
            }
        }
        spawn_detached(async move {
            let _ = task.await;
        });
    }

    fn teardown_attempt(&self, id: u64) {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            match &state.current {
                Some(current) if current.id == id => state.current.take(),
                _ => None,
            }
        };
        if let Some(attempt) = attempt {
            attempt.detach();
        }
    }

    fn resubscribe(self: &Arc<Self>) {
        let leftover = {
            let mut state = self.state.lock().unwrap();
            state.timer = None;
            state.current.take()
        };
        if let Some(attempt) = leftover {
            attempt.detach();
        }
        if let Err(err) = self.subscribe() {
            LOGGER.warn(format!("resubscription rejected: {err}"));
        }
    }

    fn stop(&self) {
        let (attempt, timer) = {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            (state.current.take(), state.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(attempt) = attempt {
            attempt.detach();
        }
    }

    fn attach_error(self: &Arc<Self>, on_error: ErrorCallback<E>) -> ListenerRegistration<E> {
        let (id, catch_up) = {
            let mut state = self.state.lock().unwrap();
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.error_listeners.push((id, Arc::clone(&on_error)));
            (id, state.final_error.clone())
        };
        if let Some(error) = catch_up {
            on_error(&error);
        }

        let detach = {
            let listener = Arc::clone(self);
            move || {
                listener
                    .state
                    .lock()
                    .unwrap()
                    .error_listeners
                    .retain(|(entry, _)| *entry != id);
            }
        };
        let attach = {
            let listener = Arc::clone(self);
            move |on_error| listener.attach_error(on_error)
        };
        ListenerRegistration::new(detach, attach)
    }
}

fn delay_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionFuture;
    use futures::future::{self, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Clone, Debug, PartialEq)]
    struct Offline(usize);

    /// A source whose first `failures` subscriptions fail synchronously.
    fn flaky_source(
        failures: usize,
        subscribes: Arc<AtomicUsize>,
    ) -> SubscriptionFuture<&'static str, Offline> {
        SubscriptionFuture::new(
            RequestDescriptor::Get {
                path: "users/ada".into(),
            },
            || future::ready(Ok("fetched")).boxed(),
            move |on_result, on_error| {
                let attempt = subscribes.fetch_add(1, Ordering::SeqCst);
                if attempt < failures {
                    on_error(Offline(attempt));
                } else {
                    on_result("live", ());
                }
                Box::new(|| {})
            },
        )
    }

    #[test]
    fn default_pattern_doubles() {
        let options = RetryOptions::default();
        assert_eq!(options.pattern.len(), 7);
        assert_eq!(options.pattern[0], Duration::from_millis(250));
        assert_eq!(options.pattern[6], Duration::from_millis(16_000));
        assert!(!options.bypass);
    }

    #[test]
    fn delay_millis_saturates() {
        assert_eq!(delay_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(delay_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn request_is_forwarded() {
        let source = flaky_source(0, Arc::new(AtomicUsize::new(0)));
        let expected = source.request().clone();
        let retried = with_retry(source, RetryOptions::default());
        assert_eq!(
            <RetryingListen<_> as Listen<&str, (), Offline>>::request(&retried),
            &expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let retried = with_retry(
            flaky_source(2, subscribes.clone()),
            RetryOptions::new().with_pattern_millis([250, 500, 1_000]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let registration = retried
            .listen(move |value: &&'static str, _: &()| {
                let _ = tx.send(*value);
            })
            .unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = errors.clone();
        let _errors = registration.catch(move |_: &Offline| {
            error_count.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(rx.recv().await, Some("live"));
        assert!(start.elapsed() >= Duration::from_millis(750));
        assert_eq!(subscribes.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        registration.detach();
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_final_error_after_pattern_is_exhausted() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let retried = with_retry(
            flaky_source(usize::MAX, subscribes.clone()),
            RetryOptions::new().with_pattern_millis([100]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let registration = retried.listen(|_: &&'static str, _: &()| {}).unwrap();
        let _errors = registration.catch(move |error: &Offline| {
            let _ = tx.send(error.clone());
        });

        assert_eq!(rx.recv().await, Some(Offline(1)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        registration.detach();
    }

    #[tokio::test]
    async fn bypass_forwards_first_error() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let retried = with_retry(
            flaky_source(usize::MAX, subscribes.clone()),
            RetryOptions::default().bypass(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();

        let registration = retried.listen(|_: &&'static str, _: &()| {}).unwrap();
        let _errors = registration.catch(move |error: &Offline| {
            captured.lock().unwrap().push(error.clone());
        });

        assert_eq!(seen.lock().unwrap().as_slice(), &[Offline(0)]);
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
        registration.detach();
    }

    #[tokio::test(start_paused = true)]
    async fn detach_cancels_pending_retry() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let retried = with_retry(
            flaky_source(usize::MAX, subscribes.clone()),
            RetryOptions::new().with_pattern_millis([1_000, 1_000]),
        );

        let registration = retried.listen(|_: &&'static str, _: &()| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        registration.detach();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_listen_call_gets_its_own_pattern() {
        let subscribes = Arc::new(AtomicUsize::new(0));
        let retried = with_retry(
            flaky_source(usize::MAX, subscribes.clone()),
            RetryOptions::new().with_pattern_millis([50]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = retried.listen(|_: &&'static str, _: &()| {}).unwrap();
        let first_tx = tx.clone();
        let _first_errors = first.catch(move |_: &Offline| {
            let _ = first_tx.send("first");
        });
        let second = retried.listen(|_: &&'static str, _: &()| {}).unwrap();
        let _second_errors = second.catch(move |_: &Offline| {
            let _ = tx.send("second");
        });

        let mut reported = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        reported.sort();
        assert_eq!(reported, ["first", "second"]);
        first.detach();
        second.detach();
    }
}
