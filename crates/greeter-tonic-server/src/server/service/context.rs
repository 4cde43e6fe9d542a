//! Per-call execution context.
//!
//! Every accepted call gets a [`RequestContext`] that is passed explicitly to
//! whatever runs on the call's behalf: timers scheduled with
//! [`RequestContext::schedule_after`], stream coordinators spawned with
//! [`RequestContext::spawn`], and blocking work offloaded with
//! [`RequestContext::spawn_blocking`]. Nothing is looked up from thread-local
//! state.
//!
//! The context also owns the call's [`CallGuard`], so in-flight accounting
//! ends exactly when the last clone of the context is dropped, whichever way
//! the call terminates.

use crate::server::telemetry::{
    decrement_calls_inflight, increment_calls, increment_calls_inflight, record_call_duration,
};
use core::{fmt, future::Future, time::Duration};
use greeter_tonic_core::Error;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Tracks accepted calls so shutdown can refuse new ones and wait for the rest.
#[derive(Debug)]
pub struct CallRegistry {
    next_id: AtomicU64,
    inflight: AtomicUsize,
    accepting: AtomicBool,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inflight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        }
    }
}

impl CallRegistry {
    /// Registers a new call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once [`CallRegistry::refuse_new`]
    /// has been called.
    pub fn begin(self: &Arc<Self>, method: &'static str) -> Result<CallGuard, Error> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::AcqRel);
        increment_calls(method);
        increment_calls_inflight(method);

        Ok(CallGuard {
            registry: Arc::clone(self),
            id,
            method,
            started: Instant::now(),
        })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Makes every later [`CallRegistry::begin`] fail.
    pub fn refuse_new(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Waits until no call is in flight, for at most `limit`.
    ///
    /// Returns `true` if every call finished in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Marks one call as in flight until dropped.
pub struct CallGuard {
    registry: Arc<CallRegistry>,
    id: u64,
    method: &'static str,
    started: Instant,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_calls_inflight(self.method);
        record_call_duration(self.method, self.started.elapsed().as_secs_f64() * 1_000.0);
        tracing::trace!(call_id = self.id, method = self.method, "call finished");
    }
}

/// The execution context of a single call.
///
/// Cheap to clone; all clones refer to the same call.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    guard: CallGuard,
    handle: Handle,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    span: Span,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id())
            .field("method", &self.method())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl RequestContext {
    /// Creates the context of a newly accepted call.
    ///
    /// Must be called from within a Tokio runtime. The runtime's handle
    /// provides both executors: its scheduler for non-blocking work and its
    /// blocking thread pool for everything else. The call is cancelled when
    /// `shutdown` is.
    pub fn new(guard: CallGuard, shutdown: &CancellationToken) -> Self {
        let span = tracing::info_span!("call", call_id = guard.id, method = guard.method);
        Self {
            inner: Arc::new(ContextInner {
                guard,
                handle: Handle::current(),
                cancel: shutdown.child_token(),
                shutdown: shutdown.clone(),
                span,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.guard.id
    }

    pub fn method(&self) -> &'static str {
        self.inner.guard.method
    }

    /// Token cancelled when the call is abandoned or the service shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// The error a cancelled call should report: [`Error::ServiceShutdown`]
    /// if the whole service is stopping, [`Error::RequestCancelled`]
    /// otherwise.
    pub fn cancellation_error(&self) -> Error {
        if self.inner.shutdown.is_cancelled() {
            Error::ServiceShutdown
        } else {
            Error::RequestCancelled
        }
    }

    /// Runs `f` on the runtime's blocking thread pool, inside the call's span.
    ///
    /// The pool grows with demand, so concurrent blocking calls do not queue
    /// behind each other and never occupy a scheduler thread. A started
    /// closure cannot be interrupted; callers race the returned handle
    /// against [`RequestContext::cancellation`].
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let span = self.inner.span.clone();
        self.inner.handle.spawn_blocking(move || span.in_scope(f))
    }

    /// Runs `fut` on this call's executor, inside the call's span.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(fut.instrument(self.inner.span.clone()))
    }

    /// Runs `callback` on this call's executor once `delay` has elapsed.
    ///
    /// The callback receives the context explicitly. If the call is cancelled
    /// first, the callback never runs and the task resolves to
    /// [`RequestContext::cancellation_error`].
    pub fn schedule_after<C, Fut>(
        &self,
        delay: Duration,
        callback: C,
    ) -> JoinHandle<Result<Fut::Output, Error>>
    where
        C: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let ctx = self.clone();
        let cancel = self.inner.cancel.clone();
        self.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ctx.cancellation_error()),
                () = sleep(delay) => Ok(callback(ctx).await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_inflight_calls() {
        let registry = Arc::new(CallRegistry::default());
        let first = registry.begin("Greet").unwrap();
        let second = registry.begin("GreetMany").unwrap();
        assert_eq!(registry.inflight(), 2);
        assert!(second.id > first.id);

        drop(first);
        assert_eq!(registry.inflight(), 1);
        drop(second);
        assert_eq!(registry.inflight(), 0);
    }

    #[test]
    fn refuses_calls_after_shutdown_starts() {
        let registry = Arc::new(CallRegistry::default());
        registry.refuse_new();
        assert!(!registry.is_accepting());
        assert!(matches!(registry.begin("Greet"), Err(Error::ServiceShutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_outstanding_calls() {
        let registry = Arc::new(CallRegistry::default());
        let guard = registry.begin("GreetLazy").unwrap();
        assert!(!registry.drain(Duration::from_secs(1)).await);

        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            drop(guard);
        });
        assert!(registry.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_callback_receives_its_context() {
        let registry = Arc::new(CallRegistry::default());
        let shutdown = CancellationToken::new();
        let ctx = RequestContext::new(registry.begin("GreetLazy").unwrap(), &shutdown);
        let expected = ctx.id();

        let started = tokio::time::Instant::now();
        let seen = ctx
            .schedule_after(Duration::from_secs(3), |ctx| async move { ctx.id() })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(seen, expected);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preempts_scheduled_callback() {
        let registry = Arc::new(CallRegistry::default());
        let shutdown = CancellationToken::new();
        let ctx = RequestContext::new(registry.begin("GreetLazy").unwrap(), &shutdown);

        let task = ctx.schedule_after(Duration::from_secs(3), |_| async { unreachable!() });
        ctx.cancellation().cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), Error::RequestCancelled);

        let ctx = RequestContext::new(registry.begin("GreetLazy").unwrap(), &shutdown);
        let task = ctx.schedule_after(Duration::from_secs(3), |_| async {});
        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap_err(), Error::ServiceShutdown);
    }

    #[tokio::test]
    async fn guard_released_with_last_context_clone() {
        let registry = Arc::new(CallRegistry::default());
        let ctx = RequestContext::new(
            registry.begin("GreetMany").unwrap(),
            &CancellationToken::new(),
        );
        let task_ctx = ctx.clone();
        let task = ctx.spawn(async move { task_ctx.id() });
        drop(ctx);

        task.await.unwrap();
        assert_eq!(registry.inflight(), 0);
    }

    #[tokio::test]
    async fn blocking_work_leaves_the_runtime_free() {
        // Single-threaded runtime: if the sleep ran on it, the timer below
        // could not fire before the closure returned.
        let registry = Arc::new(CallRegistry::default());
        let ctx = RequestContext::new(
            registry.begin("GreetBlocking").unwrap(),
            &CancellationToken::new(),
        );
        let delay = Duration::from_millis(300);
        let started = Instant::now();

        let (slept, ticked_after) = tokio::join!(
            ctx.spawn_blocking(move || {
                std::thread::sleep(delay);
                std::thread::current().id()
            }),
            async {
                sleep(Duration::from_millis(10)).await;
                started.elapsed()
            }
        );

        assert_ne!(slept.unwrap(), std::thread::current().id());
        assert!(ticked_after < delay);
        assert!(started.elapsed() >= delay);
    }
}
