//! The opaque execution seam: the dispatcher only ever submits boxed jobs
//! and never awaits them directly — completion flows back through the
//! handle's slot callbacks.

use crate::error::DispatchError;

/// Submit-only executor. The worker pool behind it is an external
/// collaborator; the engine assumes nothing beyond "the job runs".
pub trait Executor: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() + Send>);
}

/// Default executor: a fixed-size rayon thread pool, one pool per
/// dispatch, sized to the worker budget.
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
}

impl RayonExecutor {
    pub fn new(workers: usize) -> Result<Self, DispatchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .map_err(|e| DispatchError::Executor(e.to_string()))?;
        Ok(Self { pool })
    }
}

impl Executor for RayonExecutor {
    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        self.pool.spawn(job);
    }
}

/// Runs every job on the submitting thread, in submission order.
/// Deterministic; used by tests and as a degenerate single-worker mode.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}
