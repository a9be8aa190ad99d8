//! The dispatcher: turns a normalized batch plus a worker budget and an
//! optional performance model into submitted task units and an ordered
//! completion handle.
//!
//! Partitioning groups contiguous elements that share a (callable,
//! size class) signature. The target group size grows with predicted
//! per-element cost and shrinks with the worker budget; a cold model
//! falls back to [`DispatchConfig::default_group_size`], making the first
//! batch for a signature a calibration pass that seeds later predictions.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use spindle_core::{DispatchConfig, Value};

use crate::backend::{global_backends, BackendRegistry, ParallelBackend};
use crate::error::{DispatchError, TaskError};
use crate::executor::{Executor, RayonExecutor};
use crate::handle::{BatchHandle, BatchState, Mode};
use crate::normalize::{normalize, CallElement, DispatchInput};
use crate::perfmodel::{global_registry, PerfRegistry, SizeClass};

/// Configured dispatch entry point.
///
/// ```no_run
/// use spindle_dispatch::{delayed, Callable, Parallel};
/// use spindle_core::Value;
///
/// let square = Callable::new("square", |args| {
///     let x = args.int(0)?;
///     Ok(Value::Int(x * x))
/// });
/// let results = Parallel::new(3)
///     .perfmodel("square")
///     .run((0..5).map(|i| delayed(&square).arg(i).build()).collect::<Vec<_>>())
///     .unwrap();
/// assert_eq!(results[4], Value::Int(16));
/// ```
pub struct Parallel {
    n_jobs: usize,
    mode: Mode,
    perfmodel: Option<String>,
    config: DispatchConfig,
    registry: Arc<PerfRegistry>,
    backends: Arc<BackendRegistry>,
    executor: Option<Arc<dyn Executor>>,
}

impl Parallel {
    /// A dispatcher with the given worker budget, the process-wide
    /// registries, and the blocking retrieval convention.
    pub fn new(n_jobs: usize) -> Self {
        Self {
            n_jobs: n_jobs.max(1),
            mode: Mode::Normal,
            perfmodel: None,
            config: DispatchConfig::default(),
            registry: global_registry(),
            backends: global_backends(),
            executor: None,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Name the performance model consulted for grouping and updated with
    /// observed durations. Without one, grouping uses the fixed default.
    pub fn perfmodel(mut self, name: impl Into<String>) -> Self {
        self.perfmodel = Some(name.into());
        self
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute a performance-model registry (tests; defaults to the
    /// process-wide one).
    pub fn registry(mut self, registry: Arc<PerfRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Substitute a backend registry (tests; defaults to the process-wide
    /// one).
    pub fn backends(mut self, backends: Arc<BackendRegistry>) -> Self {
        self.backends = backends;
        self
    }

    /// Substitute the executor. Defaults to a fresh fixed-size pool per
    /// dispatch, sized to the effective worker budget.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Blocking convention: dispatch and wait for the ordered results,
    /// surfacing the first failed slot in original order.
    pub fn run(&self, input: impl Into<DispatchInput>) -> Result<Vec<Value>, DispatchError> {
        Ok(self.submit(input)?.wait()?)
    }

    /// Dispatch and return the completion handle; the caller chooses
    /// between [`BatchHandle::wait`] and [`BatchHandle::future`].
    pub fn submit(&self, input: impl Into<DispatchInput>) -> Result<BatchHandle, DispatchError> {
        let elements = normalize(input.into())?;
        let (backend, _) = self.backends.active();
        let jobs = backend.effective_jobs(self.n_jobs);

        let batch_id = Uuid::new_v4();
        let state = BatchState::new(elements.len());
        let handle = BatchHandle::new(state.clone(), self.mode);

        backend.on_batch_start();
        if elements.is_empty() {
            debug!(batch = %batch_id, "empty batch, immediately ready");
            backend.on_batch_end();
            return Ok(handle);
        }

        let total = elements.len();
        let units = partition(
            &self.config,
            elements,
            jobs,
            self.perfmodel.as_deref(),
            &self.registry,
        );
        info!(
            batch = %batch_id,
            elements = total,
            units = units.len(),
            jobs,
            backend = backend.name(),
            model = self.perfmodel.as_deref().unwrap_or("-"),
            "dispatching batch"
        );

        let executor: Arc<dyn Executor> = match &self.executor {
            Some(executor) => executor.clone(),
            None => Arc::new(RayonExecutor::new(jobs)?),
        };
        for unit in units {
            let state = state.clone();
            let backend = backend.clone();
            let registry = self.registry.clone();
            let model = self.perfmodel.clone();
            executor.submit(Box::new(move || {
                run_unit(unit, &state, &registry, model.as_deref(), &*backend, batch_id);
            }));
        }
        Ok(handle)
    }
}

/// One or more contiguous elements grouped for single submission.
struct TaskUnit {
    start: usize,
    class: SizeClass,
    elements: Vec<CallElement>,
    predicted: Option<Duration>,
}

/// Group contiguous elements with identical (callable, size class)
/// signature up to the cost-informed target size.
fn partition(
    config: &DispatchConfig,
    elements: Vec<CallElement>,
    jobs: usize,
    model: Option<&str>,
    registry: &PerfRegistry,
) -> Vec<TaskUnit> {
    let total = elements.len();
    let mut units: Vec<TaskUnit> = Vec::new();

    for element in elements {
        let class = SizeClass::for_element_count(element.args.element_count());
        let extends = units.last().is_some_and(|unit| {
            unit.class == class
                && unit.elements.len() < target_group_size(config, total, jobs, unit.predicted)
                && unit
                    .elements
                    .last()
                    .is_some_and(|prev| prev.callable.same_fn(&element.callable))
        });
        if extends {
            if let Some(unit) = units.last_mut() {
                unit.elements.push(element);
            }
            continue;
        }
        let predicted = model.and_then(|m| registry.predict(m, class));
        units.push(TaskUnit {
            start: element.index,
            class,
            elements: vec![element],
            predicted,
        });
    }
    units
}

/// Target number of elements per task unit.
///
/// Directly related to predicted per-element cost (amortizing dispatch
/// overhead), inversely related to the worker budget; clamped so a batch
/// still yields enough units to occupy every worker. Unknown cost uses
/// the fixed `default_group_size` — the calibration pass.
fn target_group_size(
    config: &DispatchConfig,
    total: usize,
    jobs: usize,
    predicted: Option<Duration>,
) -> usize {
    let per_worker = total.div_ceil(jobs).max(1);
    match predicted {
        None => config.default_group_size.clamp(1, per_worker),
        Some(cost) => {
            let quantum = u128::from(config.cost_quantum_us);
            let multiplier = (cost.as_micros() / quantum.max(1))
                .clamp(1, u128::from(config.max_cost_multiplier))
                as usize;
            (config.default_group_size.saturating_mul(multiplier) / jobs.max(1))
                .clamp(1, per_worker)
        }
    }
}

/// Execute one task unit on a worker: run each element, attribute the
/// unit's wall time per element into the model, fill the slots, and fire
/// `on_batch_end` if this unit completed the batch.
fn run_unit(
    unit: TaskUnit,
    state: &BatchState,
    registry: &PerfRegistry,
    model: Option<&str>,
    backend: &dyn ParallelBackend,
    batch_id: Uuid,
) {
    let started = Instant::now();
    let mut results = Vec::with_capacity(unit.elements.len());
    for element in &unit.elements {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| element.callable.invoke(&element.args)));
        results.push(outcome.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(&payload)))));
    }
    let wall = started.elapsed();

    if let Some(model) = model {
        let per_element = wall / unit.elements.len() as u32;
        for _ in &unit.elements {
            registry.record(model, unit.class, per_element);
        }
    }

    debug!(
        batch = %batch_id,
        unit_start = unit.start,
        unit_len = unit.elements.len(),
        wall_us = wall.as_micros() as u64,
        "task unit completed"
    );

    let mut completed = false;
    for (element, result) in unit.elements.iter().zip(results) {
        completed |= state.fill(element.index, result);
    }
    if completed {
        // Bookkeeping runs before finalize, so waiters never observe a
        // terminal batch whose batch-end hook has not fired yet.
        backend.on_batch_end();
        state.finalize();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{delayed, Arg, Callable};
    use crate::executor::InlineExecutor;
    use spindle_core::ArrayBuffer;

    fn square() -> Callable {
        Callable::new("square", |args| {
            let x = args.int(0)?;
            Ok(Value::Int(x * x))
        })
    }

    fn isolated(n_jobs: usize) -> Parallel {
        Parallel::new(n_jobs)
            .registry(Arc::new(PerfRegistry::new()))
            .backends(Arc::new(BackendRegistry::new()))
    }

    #[test]
    fn squares_come_back_in_order() {
        let f = square();
        let calls: Vec<_> = (0..5).map(|i| delayed(&f).arg(i).build()).collect();
        let results = isolated(3).run(calls).unwrap();
        let expected: Vec<Value> = [0, 1, 4, 9, 16].into_iter().map(Value::Int).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn empty_batch_is_ready_with_no_results() {
        let handle = isolated(2).submit(DispatchInput::Calls(Vec::new())).unwrap();
        assert!(handle.is_ready());
        assert!(handle.wait().unwrap().is_empty());
    }

    #[test]
    fn one_failure_leaves_sibling_slots_valid() {
        let f = Callable::new("sometimes", |args| {
            let x = args.int(0)?;
            if x == 2 {
                Err(TaskError::Failed("element two".into()))
            } else {
                Ok(Value::Int(x))
            }
        });
        let calls: Vec<_> = (0..5).map(|i| delayed(&f).arg(i).build()).collect();
        let slots = isolated(2).submit(calls).unwrap().wait_all();
        assert_eq!(slots.len(), 5);
        for (i, slot) in slots.iter().enumerate() {
            if i == 2 {
                assert!(slot.is_err(), "slot 2 should hold the failure");
            } else {
                assert_eq!(*slot, Ok(Value::Int(i as i64)));
            }
        }
    }

    #[test]
    fn panicking_element_is_captured_not_propagated() {
        let f = Callable::new("boom", |_| panic!("kaboom"));
        let err = isolated(1)
            .executor(Arc::new(InlineExecutor))
            .run(vec![delayed(&f).build()])
            .unwrap_err();
        match err {
            DispatchError::Task(TaskError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn in_place_scaling_mutates_the_shared_buffer() {
        let scal = Callable::new("scal", |args| {
            let factor = args.float(0)?;
            let slice = args.slice(1)?;
            slice.with_mut(|t| {
                for x in t.iter_mut() {
                    *x *= factor;
                }
            })?;
            Ok(Value::Unit)
        });
        let buf = ArrayBuffer::new(vec![1.0, 2.0, 3.0]);
        let call = delayed(&scal).arg(2.0).arg(&buf).build();
        isolated(2).run(call).unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn independent_buffers_scale_independently() {
        let scal = Callable::new("scal", |args| {
            let factor = args.float(0)?;
            let slice = args.slice(1)?;
            slice.with_mut(|t| {
                for x in t.iter_mut() {
                    *x *= factor;
                }
            })?;
            Ok(Value::Unit)
        });
        let a = ArrayBuffer::new(vec![1.0, 2.0, 3.0]);
        let b = ArrayBuffer::new(vec![1.0, 2.0, 3.0]);
        let calls = vec![
            delayed(&scal).arg(2.0).arg(a.slice_all()).build(),
            delayed(&scal).arg(3.0).arg(b.slice_all()).build(),
        ];
        isolated(2).run(calls).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(b.to_vec().unwrap(), vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn dispatch_records_observations_for_named_model() {
        let registry = Arc::new(PerfRegistry::new());
        let f = square();
        let calls: Vec<_> = (0..8).map(|i| delayed(&f).arg(i).build()).collect();
        Parallel::new(2)
            .registry(registry.clone())
            .backends(Arc::new(BackendRegistry::new()))
            .perfmodel("square")
            .run(calls)
            .unwrap();

        let class = SizeClass::for_element_count(1);
        assert_eq!(registry.observation_count("square", class), 8);
        assert!(registry.predict("square", class).is_some());
    }

    #[test]
    fn backend_hooks_fire_once_per_batch() {
        use std::sync::atomic::{AtomicU64, Ordering};

        struct HookCounter {
            starts: Arc<AtomicU64>,
            ends: Arc<AtomicU64>,
        }
        impl ParallelBackend for HookCounter {
            fn name(&self) -> &str {
                "hooks"
            }
            fn on_batch_start(&self) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            fn on_batch_end(&self) {
                self.ends.fetch_add(1, Ordering::SeqCst);
            }
        }

        let starts = Arc::new(AtomicU64::new(0));
        let ends = Arc::new(AtomicU64::new(0));
        let backends = Arc::new(BackendRegistry::new());
        let (s, e) = (starts.clone(), ends.clone());
        backends
            .register(
                "hooks",
                Arc::new(move || {
                    Arc::new(HookCounter {
                        starts: s.clone(),
                        ends: e.clone(),
                    }) as Arc<dyn ParallelBackend>
                }),
            )
            .unwrap();
        let guard = backends.activate("hooks", 2).unwrap();

        let f = square();
        let calls: Vec<_> = (0..10).map(|i| delayed(&f).arg(i).build()).collect();
        Parallel::new(2)
            .registry(Arc::new(PerfRegistry::new()))
            .backends(backends.clone())
            .run(calls)
            .unwrap();
        drop(guard);

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_axis_dispatch_matches_expected_values() {
        let f = square();
        let call = delayed(&f).arg(Arg::stream(0..6i64)).build();
        let results = isolated(3).run(call).unwrap();
        let expected: Vec<Value> = (0..6).map(|i| Value::Int(i * i)).collect();
        assert_eq!(results, expected);
    }

    // ── partitioning policy ──────────────────────────────────────────

    #[test]
    fn cold_model_uses_default_group_size() {
        let config = DispatchConfig::default();
        assert_eq!(target_group_size(&config, 1000, 2, None), 32);
        // Small batches still occupy every worker.
        assert_eq!(target_group_size(&config, 5, 3, None), 2);
    }

    #[test]
    fn expensive_elements_get_larger_groups() {
        let config = DispatchConfig::default();
        let cheap = target_group_size(&config, 10_000, 2, Some(Duration::from_micros(100)));
        let pricey = target_group_size(&config, 10_000, 2, Some(Duration::from_micros(800)));
        assert!(pricey > cheap, "expected {pricey} > {cheap}");
    }

    #[test]
    fn larger_budgets_get_smaller_groups() {
        let config = DispatchConfig::default();
        let few = target_group_size(&config, 10_000, 2, Some(Duration::from_micros(400)));
        let many = target_group_size(&config, 10_000, 8, Some(Duration::from_micros(400)));
        assert!(many < few, "expected {many} < {few}");
    }

    #[test]
    fn partition_splits_at_callable_boundaries() {
        let f = square();
        let g = Callable::new("negate", |args| Ok(Value::Int(-args.int(0)?)));
        let calls: Vec<_> = vec![
            delayed(&f).arg(1i64).build(),
            delayed(&f).arg(2i64).build(),
            delayed(&g).arg(3i64).build(),
            delayed(&f).arg(4i64).build(),
        ];
        let elements = normalize(DispatchInput::Calls(calls)).unwrap();
        let units = partition(
            &DispatchConfig::default(),
            elements,
            1,
            None,
            &PerfRegistry::new(),
        );
        let lens: Vec<usize> = units.iter().map(|u| u.elements.len()).collect();
        assert_eq!(lens, vec![2, 1, 1]);
        assert_eq!(units[0].start, 0);
        assert_eq!(units[1].start, 2);
        assert_eq!(units[2].start, 3);
    }

    #[test]
    fn partition_covers_every_element_exactly_once() {
        let f = square();
        let calls: Vec<_> = (0..100).map(|i| delayed(&f).arg(i).build()).collect();
        let elements = normalize(DispatchInput::Calls(calls)).unwrap();
        let units = partition(
            &DispatchConfig::default(),
            elements,
            4,
            None,
            &PerfRegistry::new(),
        );
        let mut seen: Vec<usize> = units
            .iter()
            .flat_map(|u| u.elements.iter().map(|e| e.index))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
