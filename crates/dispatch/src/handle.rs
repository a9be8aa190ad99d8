//! The completion handle: one state machine, two retrieval conventions.
//!
//! Results are assembled into fixed, originally-ordered slots as worker
//! completions arrive; the batch turns terminal when the completing
//! worker finalizes it, strictly after the backend's `on_batch_end` hook.
//! A blocking caller parks on a condvar ([`BatchHandle::wait`]); an async
//! caller awaits a [`BatchFuture`], which registers its waker and is woken
//! by the completing worker. Multiple independent awaiters are permitted
//! and all resolve at readiness.
//!
//! Cancellation is not supported mid-flight: dropping a waiter detaches
//! it, but already-submitted task units run to completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use spindle_core::Value;

use crate::error::TaskError;

/// Which retrieval convention the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Caller blocks until every slot is filled.
    Normal,
    /// Caller receives an awaitable aggregate.
    Future,
}

/// Ordered per-slot outcomes of a batch.
pub type SlotResults = Vec<Result<Value, TaskError>>;

/// Collapse slot results to the ordered value sequence, surfacing the
/// first failed slot (in original order) as the error.
pub fn collect_ordered(slots: SlotResults) -> Result<Vec<Value>, TaskError> {
    slots.into_iter().collect()
}

enum Slot {
    Pending,
    Done(Result<Value, TaskError>),
}

struct BatchInner {
    slots: Vec<Slot>,
    remaining: usize,
    /// Set by [`BatchState::finalize`]; the only readiness signal waiters
    /// observe, so completion never becomes visible before the batch-end
    /// bookkeeping has run.
    finalized: bool,
    wakers: Vec<Waker>,
}

/// Shared batch state filled by worker completion callbacks.
pub(crate) struct BatchState {
    inner: Mutex<BatchInner>,
    ready: Condvar,
}

impl BatchState {
    pub(crate) fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BatchInner {
                slots: (0..len).map(|_| Slot::Pending).collect(),
                remaining: len,
                finalized: len == 0,
                wakers: Vec::new(),
            }),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill one slot. Returns `true` when this fill emptied the batch;
    /// the caller must then invoke [`BatchState::finalize`] once its
    /// completion bookkeeping is done.
    pub(crate) fn fill(&self, index: usize, result: Result<Value, TaskError>) -> bool {
        let mut inner = self.lock();
        debug_assert!(matches!(inner.slots[index], Slot::Pending));
        inner.slots[index] = Slot::Done(result);
        inner.remaining -= 1;
        inner.remaining == 0
    }

    /// Mark the batch terminal and release every waiter.
    pub(crate) fn finalize(&self) {
        let wakers = {
            let mut inner = self.lock();
            debug_assert_eq!(inner.remaining, 0);
            inner.finalized = true;
            std::mem::take(&mut inner.wakers)
        };
        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    fn is_ready(&self) -> bool {
        self.lock().finalized
    }

    /// Clone the ordered results out. Only valid once finalized.
    fn results(&self) -> SlotResults {
        let inner = self.lock();
        debug_assert!(inner.finalized);
        inner
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Done(r) => r.clone(),
                Slot::Pending => Err(TaskError::Failed("slot still pending".into())),
            })
            .collect()
    }

    fn wait_ready(&self) {
        let mut inner = self.lock();
        while !inner.finalized {
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// The result-bearing object returned by a dispatch call.
pub struct BatchHandle {
    state: Arc<BatchState>,
    mode: Mode,
}

impl BatchHandle {
    pub(crate) fn new(state: Arc<BatchState>, mode: Mode) -> Self {
        Self { state, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of result slots.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the batch is terminal.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Block the calling thread until ready, then return the ordered
    /// values, or the first failed slot in original order.
    pub fn wait(self) -> Result<Vec<Value>, TaskError> {
        collect_ordered(self.wait_all())
    }

    /// Block until ready and return every slot, preserving partial
    /// successes alongside failures.
    pub fn wait_all(self) -> SlotResults {
        self.state.wait_ready();
        self.state.results()
    }

    /// The awaitable aggregate over the same state. May be cloned for
    /// multiple independent awaiters.
    pub fn future(self) -> BatchFuture {
        BatchFuture { state: self.state }
    }
}

/// Awaitable aggregate: resolves to the ordered slot results once every
/// constituent task unit has completed.
///
/// Wakers are woken on a worker thread; the resumed task continues on its
/// own scheduler, so caller-visible state stays on the caller's side.
#[derive(Clone)]
pub struct BatchFuture {
    state: Arc<BatchState>,
}

impl Future for BatchFuture {
    type Output = SlotResults;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.lock();
        if inner.finalized {
            drop(inner);
            return Poll::Ready(self.state.results());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
