//! Deferred calls: a callable paired with its arguments, executed only by
//! the dispatcher.
//!
//! [`delayed`] returns a builder; applying arguments produces a
//! [`DeferredCall`] with no side effects. Arguments are tagged
//! ([`Arg`]): plain scalars, shared buffer views, single-use value
//! streams (the lazy iteration axis), or nested tuples of scalars.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use spindle_core::{ArrayBuffer, BufferSlice, Value};

use crate::error::TaskError;

/// Result of invoking a callable on one element's arguments.
pub type CallResult = Result<Value, TaskError>;

type CallFn = dyn Fn(&CallArgs) -> CallResult + Send + Sync;

/// A named function handle.
///
/// The name keys performance-model lookups and log lines; the function
/// pointer identity (not the name) is the grouping signature, so two
/// callables built from the same `Callable` clone group together.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    func: Arc<CallFn>,
}

impl Callable {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&CallArgs) -> CallResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into().into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same underlying function? Used as the grouping signature.
    pub fn same_fn(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }

    pub(crate) fn invoke(&self, args: &CallArgs) -> CallResult {
        (self.func)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish()
    }
}

/// A single-use sequence of values: the lazy iteration axis of a call.
///
/// Consumed exactly once, during normalization. Infinite streams are
/// unsupported: the dispatcher drains the stream eagerly to size its
/// ordered result storage.
pub struct ValueStream(Box<dyn Iterator<Item = Value> + Send>);

impl ValueStream {
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self(Box::new(iter.into_iter()))
    }

    pub(crate) fn drain(self) -> Vec<Value> {
        self.0.collect()
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueStream")
    }
}

/// A tagged argument of a deferred call.
#[derive(Debug)]
pub enum Arg {
    /// Held fixed across an axis expansion.
    Scalar(Value),
    /// Shared in-place-mutable view; an iteration axis.
    Buffer(BufferSlice),
    /// Single-use value sequence; an iteration axis.
    Stream(ValueStream),
    /// Nested tuple of scalar arguments.
    Tuple(Vec<Arg>),
}

impl Arg {
    /// Stream over anything convertible to values.
    pub fn stream<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Value> + 'static,
    {
        Arg::Stream(ValueStream::new(iter.into_iter().map(Into::into)))
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Scalar(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Scalar(Value::Int(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Scalar(Value::Float(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Scalar(Value::Bool(v))
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Scalar(Value::Str(v.to_string()))
    }
}

impl From<BufferSlice> for Arg {
    fn from(s: BufferSlice) -> Self {
        Arg::Buffer(s)
    }
}

impl From<&ArrayBuffer> for Arg {
    fn from(b: &ArrayBuffer) -> Self {
        Arg::Buffer(b.slice_all())
    }
}

/// An un-executed record of a callable plus its arguments.
///
/// Immutable once built; owned exclusively by whichever collection
/// currently holds it.
#[derive(Debug)]
pub struct DeferredCall {
    pub(crate) callable: Callable,
    pub(crate) positional: Vec<Arg>,
    pub(crate) keywords: BTreeMap<String, Arg>,
}

impl DeferredCall {
    pub fn callable(&self) -> &Callable {
        &self.callable
    }
}

/// Builder returned by [`delayed`].
#[derive(Debug)]
pub struct Delayed {
    callable: Callable,
    positional: Vec<Arg>,
    keywords: BTreeMap<String, Arg>,
}

/// Wrap a callable for deferred execution; nothing runs until the
/// dispatcher consumes the built call.
pub fn delayed(callable: &Callable) -> Delayed {
    Delayed {
        callable: callable.clone(),
        positional: Vec::new(),
        keywords: BTreeMap::new(),
    }
}

impl Delayed {
    /// Append a positional argument.
    pub fn arg(mut self, a: impl Into<Arg>) -> Self {
        self.positional.push(a.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, a: impl Into<Arg>) -> Self {
        self.keywords.insert(name.into(), a.into());
        self
    }

    pub fn build(self) -> DeferredCall {
        DeferredCall {
            callable: self.callable,
            positional: self.positional,
            keywords: self.keywords,
        }
    }
}

// ── Resolved per-element arguments ───────────────────────────────────

/// A concrete argument handed to a callable: either an owned value or a
/// buffer range view.
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    Slice(BufferSlice),
}

impl CallArg {
    /// Leaf element count, for size-classing.
    pub fn element_count(&self) -> usize {
        match self {
            CallArg::Value(v) => v.element_count(),
            CallArg::Slice(s) => s.len(),
        }
    }
}

/// The fully-resolved arguments for one call element.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<CallArg>,
    keywords: BTreeMap<String, CallArg>,
}

impl CallArgs {
    pub(crate) fn new(positional: Vec<CallArg>, keywords: BTreeMap<String, CallArg>) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    fn get(&self, index: usize) -> Result<&CallArg, TaskError> {
        self.positional
            .get(index)
            .ok_or_else(|| TaskError::BadArgument(index, "missing positional argument".into()))
    }

    /// The `index`-th positional argument as an owned value.
    pub fn value(&self, index: usize) -> Result<&Value, TaskError> {
        match self.get(index)? {
            CallArg::Value(v) => Ok(v),
            CallArg::Slice(_) => Err(TaskError::BadArgument(
                index,
                "expected a value, found a buffer".into(),
            )),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64, TaskError> {
        self.value(index)?
            .as_int()
            .ok_or_else(|| TaskError::BadArgument(index, "expected an integer".into()))
    }

    pub fn float(&self, index: usize) -> Result<f64, TaskError> {
        self.value(index)?
            .as_float()
            .ok_or_else(|| TaskError::BadArgument(index, "expected a number".into()))
    }

    /// The `index`-th positional argument as a buffer view.
    pub fn slice(&self, index: usize) -> Result<&BufferSlice, TaskError> {
        match self.get(index)? {
            CallArg::Slice(s) => Ok(s),
            CallArg::Value(_) => Err(TaskError::BadArgument(
                index,
                "expected a buffer, found a value".into(),
            )),
        }
    }

    pub fn keyword(&self, name: &str) -> Option<&CallArg> {
        self.keywords.get(name)
    }

    /// Total leaf element count across all arguments; the input to
    /// size-classing.
    pub fn element_count(&self) -> usize {
        self.positional
            .iter()
            .chain(self.keywords.values())
            .map(CallArg::element_count)
            .sum()
    }
}
