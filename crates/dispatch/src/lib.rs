//! Cost-model-driven task dispatch.
//!
//! Build deferred calls with [`delayed`], hand them to [`Parallel`] with a
//! worker budget and an optional named performance model, and collect
//! ordered results by blocking ([`BatchHandle::wait`]) or by awaiting
//! ([`BatchHandle::future`]). Buffer arguments are shared and mutated in
//! place; a registered, named [`ParallelBackend`] owns dispatch
//! bookkeeping.
//!
//! See `crates/dispatch/src/bin/spindle-demo.rs` for a tour of the API.

pub mod backend;
pub mod deferred;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handle;
pub mod normalize;
pub mod perfmodel;

pub use backend::{
    get_active_backend, global_backends, parallel_backend, register_parallel_backend,
    BackendFactory, BackendGuard, BackendRegistry, DefaultBackend, ParallelBackend,
};
pub use deferred::{delayed, Arg, CallArg, CallArgs, CallResult, Callable, DeferredCall, Delayed, ValueStream};
pub use dispatcher::Parallel;
pub use error::{DispatchError, TaskError};
pub use executor::{Executor, InlineExecutor, RayonExecutor};
pub use handle::{collect_ordered, BatchFuture, BatchHandle, Mode, SlotResults};
pub use normalize::{CallElement, DispatchInput};
pub use perfmodel::{global_registry, ModelEntry, PerfRegistry, PerfSnapshot, SizeClass, SnapshotEntry};

pub use spindle_core::{ArrayBuffer, BufferSlice, CoreError, DispatchConfig, Value};
