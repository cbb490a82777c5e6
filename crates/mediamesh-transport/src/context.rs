//! Hierarchical cancellation contexts with bounded wait primitives.
//!
//! Every blocking operation in the connection core takes a [`Context`] and
//! returns promptly once it is cancelled. Cancellation is monotonic: a
//! cancelled context stays cancelled, and cancelling a parent reaches all
//! descendants before [`CancelHandle::cancel`] returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Outcome of a cancellation-aware sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Completed,
    /// The context was cancelled before the duration elapsed.
    Cancelled,
}

/// Outcome of a cancellation-aware condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate was satisfied.
    Signalled,
    /// The context was cancelled while waiting.
    Cancelled,
}

struct CtxInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
    children: Mutex<Vec<Weak<CtxInner>>>,
}

impl CtxInner {
    fn new(cancelled: bool) -> Arc<Self> {
        Arc::new(CtxInner {
            cancelled: AtomicBool::new(cancelled),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = {
            let mut slots = self.children.lock().unwrap();
            let alive: Vec<Arc<CtxInner>> = slots.iter().filter_map(Weak::upgrade).collect();
            slots.clear();
            alive
        };
        for child in children {
            child.cancel();
        }
        let _g = self.lock.lock().unwrap();
        self.cv.notify_all();
    }
}

/// A cheaply clonable cancellation token threaded through every blocking call.
#[derive(Clone)]
pub struct Context {
    inner: Arc<CtxInner>,
}

/// The handle that triggers cancellation of a [`Context`] and its descendants.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CtxInner>,
}

impl CancelHandle {
    /// Cancel the associated context. All descendant contexts are cancelled
    /// before this call returns. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl Context {
    /// The root context. Never cancelled.
    pub fn background() -> Context {
        Context {
            inner: CtxInner::new(false),
        }
    }

    /// Create a child context cancelled by either the returned handle or by
    /// cancellation of `parent`.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let inner = CtxInner::new(parent.cancelled());
        parent
            .inner
            .children
            .lock()
            .unwrap()
            .push(Arc::downgrade(&inner));
        (
            Context {
                inner: inner.clone(),
            },
            CancelHandle { inner },
        )
    }

    /// Non-blocking cancellation check.
    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early if the context is cancelled.
    pub fn sleep(&self, duration: Duration) -> SleepOutcome {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.cancelled() {
                return SleepOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return SleepOutcome::Completed;
            }
            let (g, _) = self.inner.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Wait on `cv` until `signalled` returns true or the context is
    /// cancelled. The wait wakes at least every `tick` to observe
    /// cancellation, so a cancelled waiter returns within one tick.
    pub fn wait<'a, T, F>(
        &self,
        cv: &Condvar,
        mut guard: MutexGuard<'a, T>,
        tick: Duration,
        mut signalled: F,
    ) -> (MutexGuard<'a, T>, WaitOutcome)
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if self.cancelled() {
                return (guard, WaitOutcome::Cancelled);
            }
            if signalled(&mut guard) {
                return (guard, WaitOutcome::Signalled);
            }
            let (g, _) = cv.wait_timeout(guard, tick).unwrap();
            guard = g;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}
