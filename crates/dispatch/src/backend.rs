//! Pluggable dispatch backends: named strategy objects owning the
//! call-accounting hooks and the effective worker-count policy.
//!
//! Registration is process-wide and duplicate names are rejected —
//! re-registering under a new name is the supported override path.
//! Activation is stack-scoped: [`parallel_backend`] returns a guard, and
//! dropping it (normally or during unwind) restores the previous backend.
//! Nested activation from the owning thread stacks; activation from a
//! second thread while a guard is held is detected and rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::error::DispatchError;

/// A dispatch-bookkeeping strategy.
///
/// Implementations may carry instrumentation state, but must keep
/// `effective_jobs` stable for the duration of a batch — changing the
/// worker count mid-batch is disallowed.
pub trait ParallelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Effective worker budget for a caller-requested job count.
    /// The default backend uses the caller's count unchanged.
    fn effective_jobs(&self, requested: usize) -> usize {
        requested.max(1)
    }

    /// Called once per dispatch, before any task unit is submitted.
    fn on_batch_start(&self) {}

    /// Called once per dispatch, after every task unit has completed.
    fn on_batch_end(&self) {}
}

/// The stock backend: caller-supplied budget, batch counting.
#[derive(Default)]
pub struct DefaultBackend {
    batches_started: AtomicU64,
    batches_finished: AtomicU64,
}

impl DefaultBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches_started(&self) -> u64 {
        self.batches_started.load(Ordering::Relaxed)
    }

    pub fn batches_finished(&self) -> u64 {
        self.batches_finished.load(Ordering::Relaxed)
    }
}

impl ParallelBackend for DefaultBackend {
    fn name(&self) -> &str {
        "default"
    }

    fn on_batch_start(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_batch_end(&self) {
        self.batches_finished.fetch_add(1, Ordering::Relaxed);
    }
}

/// Constructor for a registered backend variant.
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn ParallelBackend> + Send + Sync>;

struct ActivationFrame {
    previous: Arc<dyn ParallelBackend>,
    previous_jobs: usize,
}

struct BackendState {
    factories: HashMap<String, BackendFactory>,
    active: Arc<dyn ParallelBackend>,
    worker_budget: usize,
    /// Thread holding the live activation stack, if any.
    owner: Option<ThreadId>,
    stack: Vec<ActivationFrame>,
}

/// Named backend table plus the activation stack.
pub struct BackendRegistry {
    state: Mutex<BackendState>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// A registry with the default backend registered and active.
    pub fn new() -> Self {
        let default: Arc<dyn ParallelBackend> = Arc::new(DefaultBackend::new());
        let mut factories: HashMap<String, BackendFactory> = HashMap::new();
        factories.insert(
            "default".to_string(),
            Arc::new(|| Arc::new(DefaultBackend::new()) as Arc<dyn ParallelBackend>),
        );
        Self {
            state: Mutex::new(BackendState {
                factories,
                active: default,
                worker_budget: 1,
                owner: None,
                stack: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a backend constructor under a unique name.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: BackendFactory,
    ) -> Result<(), DispatchError> {
        let name = name.into();
        let mut state = self.lock();
        if state.factories.contains_key(&name) {
            return Err(DispatchError::DuplicateBackend(name));
        }
        debug!(backend = %name, "registered parallel backend");
        state.factories.insert(name, factory);
        Ok(())
    }

    /// Activate a registered backend for the scope of the returned guard,
    /// with the given worker budget.
    ///
    /// Nested activation from the same thread stacks; activation from a
    /// different thread while a guard is held is a misuse and is rejected
    /// without touching the current activation.
    pub fn activate(
        self: &Arc<Self>,
        name: &str,
        worker_budget: usize,
    ) -> Result<BackendGuard, DispatchError> {
        let mut state = self.lock();
        let current = thread::current().id();
        if let Some(owner) = state.owner {
            if owner != current {
                return Err(DispatchError::BackendMisuse(format!(
                    "backend '{}' is active on another thread",
                    state.active.name()
                )));
            }
        }
        let factory = state
            .factories
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::BackendMisuse(format!("unknown backend: {name}")))?;
        let backend = factory();
        let frame = ActivationFrame {
            previous: state.active.clone(),
            previous_jobs: state.worker_budget,
        };
        state.stack.push(frame);
        state.owner = Some(current);
        state.active = backend.clone();
        state.worker_budget = worker_budget.max(1);
        drop(state);
        debug!(backend = %name, worker_budget, "activated parallel backend");
        Ok(BackendGuard {
            registry: self.clone(),
            backend,
            worker_budget: worker_budget.max(1),
        })
    }

    /// The active backend and its worker budget.
    pub fn active(&self) -> (Arc<dyn ParallelBackend>, usize) {
        let state = self.lock();
        (state.active.clone(), state.worker_budget)
    }

    fn deactivate(&self) {
        let mut state = self.lock();
        if let Some(frame) = state.stack.pop() {
            state.active = frame.previous;
            state.worker_budget = frame.previous_jobs;
        }
        if state.stack.is_empty() {
            state.owner = None;
        }
    }
}

/// Scoped activation: while held, the named backend is the active one;
/// dropping restores the previous backend, including on unwind.
pub struct BackendGuard {
    registry: Arc<BackendRegistry>,
    backend: Arc<dyn ParallelBackend>,
    worker_budget: usize,
}

impl BackendGuard {
    /// The backend activated by this guard.
    pub fn backend(&self) -> Arc<dyn ParallelBackend> {
        self.backend.clone()
    }

    pub fn worker_budget(&self) -> usize {
        self.worker_budget
    }
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        self.registry.deactivate();
    }
}

static GLOBAL: OnceLock<Arc<BackendRegistry>> = OnceLock::new();

/// The process-wide backend registry.
pub fn global_backends() -> Arc<BackendRegistry> {
    GLOBAL
        .get_or_init(|| Arc::new(BackendRegistry::new()))
        .clone()
}

/// Register a backend constructor process-wide.
pub fn register_parallel_backend(
    name: impl Into<String>,
    factory: BackendFactory,
) -> Result<(), DispatchError> {
    global_backends().register(name, factory)
}

/// Activate a registered backend process-wide for the guard's scope.
pub fn parallel_backend(name: &str, worker_budget: usize) -> Result<BackendGuard, DispatchError> {
    global_backends().activate(name, worker_budget)
}

/// The process-wide active backend and worker budget.
pub fn get_active_backend() -> (Arc<dyn ParallelBackend>, usize) {
    global_backends().active()
}
