//! Single-threaded event loop.
//!
//! Every component in this crate schedules its watches, timers and
//! callbacks on an [`EventLoop`]. The loop is a current-thread tokio runtime
//! paired with a [`LocalSet`], so scheduled work may hold `Rc`/`RefCell`
//! state and only runs while the owning thread is iterating the loop.
//!
//! Blocking work (system name lookups) goes to the runtime's blocking pool
//! through [`EventLoop::spawn_blocking`]; its results are handed back to the
//! loop before any connection state is touched.

use crate::base::neterror::NetError;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEFAULT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Handle to a single-threaded event loop.
///
/// Cloning is cheap and yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    local: LocalSet,
    // Taken in `Drop` so the runtime can shut down without joining
    // blocking workers.
    runtime: Option<Runtime>,
    handle: Handle,
    running: Cell<bool>,
    quit_requested: Cell<bool>,
    quit: Notify,
    id: u64,
}

/// Clears the running flag even if the driven future panics.
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl EventLoop {
    /// Create a new, independent loop.
    pub fn new() -> Result<Self, NetError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("netloop-worker")
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build event loop runtime");
                NetError::Failed
            })?;

        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(loop_id = id, "event loop created");

        Ok(Self {
            inner: Rc::new(LoopInner {
                local: LocalSet::new(),
                handle: runtime.handle().clone(),
                runtime: Some(runtime),
                running: Cell::new(false),
                quit_requested: Cell::new(false),
                quit: Notify::new(),
                id,
            }),
        })
    }

    /// The calling thread's default loop, created on first use.
    pub fn thread_default() -> Result<Self, NetError> {
        DEFAULT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                return Ok(existing.clone());
            }
            let created = EventLoop::new()?;
            *slot = Some(created.clone());
            Ok(created)
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether the loop is currently being iterated.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &EventLoop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Schedule `!Send` work on this loop.
    ///
    /// The future is only polled while the loop is iterating, never from
    /// inside this call.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.inner.local.spawn_local(future)
    }

    /// Run blocking work on a worker thread.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.handle.spawn_blocking(f)
    }

    /// Enter the runtime context without iterating, e.g. to adopt a
    /// `std::net::TcpStream`.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.inner.handle.enter()
    }

    /// Iterate the loop until `future` completes and return its output.
    ///
    /// Fails with [`NetError::Unexpected`] when called while this loop (or
    /// any other tokio runtime) is already being driven on this thread.
    pub fn run_until<F: Future>(&self, future: F) -> Result<F::Output, NetError> {
        if self.inner.running.get() {
            debug_assert!(false, "event loop {} re-entered", self.inner.id);
            tracing::warn!(loop_id = self.inner.id, "event loop re-entered");
            return Err(NetError::Unexpected);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            tracing::warn!(
                loop_id = self.inner.id,
                "cannot iterate an event loop from inside another runtime"
            );
            return Err(NetError::Unexpected);
        }
        let Some(runtime) = self.inner.runtime.as_ref() else {
            return Err(NetError::Unexpected);
        };

        self.inner.running.set(true);
        let _guard = RunningGuard(&self.inner.running);
        Ok(self.inner.local.block_on(runtime, future))
    }

    /// Iterate until [`EventLoop::quit`] is called.
    pub fn run(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        inner.quit_requested.set(false);
        self.run_until(async move {
            while !inner.quit_requested.replace(false) {
                inner.quit.notified().await;
            }
        })
    }

    /// Iterate for at most `duration`.
    pub fn run_for(&self, duration: Duration) -> Result<(), NetError> {
        self.run_until(async move { tokio::time::sleep(duration).await })
    }

    /// One pass over whatever work is ready right now.
    pub fn iterate(&self) -> Result<(), NetError> {
        self.run_until(tokio::task::yield_now())
    }

    /// Stop a running [`EventLoop::run`]. Has no effect when idle.
    pub fn quit(&self) {
        if self.inner.running.get() {
            self.inner.quit_requested.set(true);
            self.inner.quit.notify_one();
        }
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        // Local tasks go first so the sockets and timers they own
        // deregister from a live driver.
        drop(std::mem::replace(&mut self.local, LocalSet::new()));
        // A lookup stuck in the system resolver must not hold up the caller.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        tracing::debug!(loop_id = self.id, "event loop dropped");
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.get())
            .finish_non_exhaustive()
    }
}
