//! Argument-stream normalization: turn any accepted input shape into a
//! concrete, ordered sequence of call elements.
//!
//! Three input shapes are accepted (see [`DispatchInput`]):
//! an explicit sequence of pre-built calls, a lazy single-pass sequence of
//! them, or a single call whose stream/buffer arguments form the iteration
//! axis. Lazy sequences are drained eagerly — ordered result storage needs
//! a concrete count before anything is submitted, so infinite sequences
//! are unsupported.
//!
//! Axis expansion hands every element an index-aligned, length-1 view of
//! each buffer argument, which makes concurrent in-place mutation ranges
//! disjoint by construction.

use std::collections::BTreeMap;

use spindle_core::Value;

use crate::deferred::{Arg, CallArg, CallArgs, Callable, DeferredCall};
use crate::error::DispatchError;

/// Input accepted by the dispatcher.
#[derive(Debug)]
pub enum DispatchInput {
    /// A finite sequence of independent calls; each becomes one element.
    Calls(Vec<DeferredCall>),
    /// One call whose stream/buffer arguments are the iteration axis.
    Single(DeferredCall),
}

impl DispatchInput {
    /// Materialize a (possibly lazy, single-pass) sequence of calls.
    /// Order is preserved; each element is consumed at most once.
    pub fn calls<I: IntoIterator<Item = DeferredCall>>(iter: I) -> Self {
        DispatchInput::Calls(iter.into_iter().collect())
    }
}

impl From<DeferredCall> for DispatchInput {
    fn from(call: DeferredCall) -> Self {
        DispatchInput::Single(call)
    }
}

impl From<Vec<DeferredCall>> for DispatchInput {
    fn from(calls: Vec<DeferredCall>) -> Self {
        DispatchInput::Calls(calls)
    }
}

impl FromIterator<DeferredCall> for DispatchInput {
    fn from_iter<I: IntoIterator<Item = DeferredCall>>(iter: I) -> Self {
        DispatchInput::calls(iter)
    }
}

/// One fully-resolved invocation, tagged with its original position.
#[derive(Debug)]
pub struct CallElement {
    pub index: usize,
    pub callable: Callable,
    pub args: CallArgs,
}

/// Normalize an input into its ordered element sequence.
///
/// Fails fast with [`DispatchError::ArgumentShape`] before anything is
/// submitted; an empty result is valid and yields an immediately-ready
/// handle downstream.
pub fn normalize(input: DispatchInput) -> Result<Vec<CallElement>, DispatchError> {
    match input {
        DispatchInput::Calls(calls) => calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let callable = call.callable.clone();
                let args = resolve_fixed(call)?;
                Ok(CallElement {
                    index,
                    callable,
                    args,
                })
            })
            .collect(),
        DispatchInput::Single(call) => expand_single(call),
    }
}

/// Resolve a call with no iteration axis: buffers pass whole, tuples
/// collapse to list values, streams are rejected.
fn resolve_fixed(call: DeferredCall) -> Result<CallArgs, DispatchError> {
    let positional = call
        .positional
        .into_iter()
        .map(fixed_arg)
        .collect::<Result<Vec<_>, _>>()?;
    let keywords = call
        .keywords
        .into_iter()
        .map(|(name, arg)| Ok((name, fixed_arg(arg)?)))
        .collect::<Result<BTreeMap<_, _>, DispatchError>>()?;
    Ok(CallArgs::new(positional, keywords))
}

fn fixed_arg(arg: Arg) -> Result<CallArg, DispatchError> {
    match arg {
        Arg::Scalar(v) => Ok(CallArg::Value(v)),
        Arg::Buffer(s) => Ok(CallArg::Slice(s)),
        Arg::Tuple(items) => Ok(CallArg::Value(tuple_value(items)?)),
        Arg::Stream(_) => Err(DispatchError::ArgumentShape(
            "stream arguments require a single-call dispatch".into(),
        )),
    }
}

/// Collapse a tuple argument into a list value. Only scalars (and nested
/// tuples of scalars) are legal inside a tuple.
fn tuple_value(items: Vec<Arg>) -> Result<Value, DispatchError> {
    let values = items
        .into_iter()
        .map(|item| match item {
            Arg::Scalar(v) => Ok(v),
            Arg::Tuple(inner) => tuple_value(inner),
            Arg::Buffer(_) | Arg::Stream(_) => Err(DispatchError::ArgumentShape(
                "tuples may only contain scalar arguments".into(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::List(values))
}

/// Intermediate form of one argument during axis expansion.
enum AxisArg {
    Fixed(CallArg),
    /// Drained stream; contributes its i-th value.
    Values(Vec<Value>),
    /// Buffer view; contributes an index-aligned length-1 slice.
    Slices(spindle_core::BufferSlice),
}

/// Expand a single call over its iteration axes.
fn expand_single(call: DeferredCall) -> Result<Vec<CallElement>, DispatchError> {
    let callable = call.callable.clone();

    let positional = call
        .positional
        .into_iter()
        .map(axis_arg)
        .collect::<Result<Vec<_>, _>>()?;
    let keywords = call
        .keywords
        .into_iter()
        .map(|(name, arg)| Ok((name, axis_arg(arg)?)))
        .collect::<Result<Vec<_>, DispatchError>>()?;

    // Every axis must agree on the expansion length.
    let mut axis_len: Option<usize> = None;
    for (position, arg) in positional
        .iter()
        .map(|a| (None, a))
        .chain(keywords.iter().map(|(n, a)| (Some(n.as_str()), a)))
    {
        let len = match arg {
            AxisArg::Fixed(_) => continue,
            AxisArg::Values(vs) => vs.len(),
            AxisArg::Slices(s) => s.len(),
        };
        match axis_len {
            None => axis_len = Some(len),
            Some(expected) if expected != len => {
                return Err(DispatchError::ArgumentShape(format!(
                    "axis length mismatch: expected {expected}, argument {} has {len}",
                    position.unwrap_or("<positional>"),
                )));
            }
            Some(_) => {}
        }
    }

    // No axis at all: the call is a batch of one.
    let Some(len) = axis_len else {
        let args = CallArgs::new(
            positional.into_iter().map(fixed_only).collect(),
            keywords.into_iter().map(|(n, a)| (n, fixed_only(a))).collect(),
        );
        return Ok(vec![CallElement {
            index: 0,
            callable,
            args,
        }]);
    };

    let mut elements = Vec::with_capacity(len);
    // Drained streams are consumed by value; iterate them as owned vecs.
    let mut positional = positional;
    let mut keywords = keywords;
    for index in 0..len {
        let args = CallArgs::new(
            positional
                .iter_mut()
                .map(|a| element_arg(a, index))
                .collect::<Result<Vec<_>, _>>()?,
            keywords
                .iter_mut()
                .map(|(n, a)| Ok((n.clone(), element_arg(a, index)?)))
                .collect::<Result<BTreeMap<_, _>, DispatchError>>()?,
        );
        elements.push(CallElement {
            index,
            callable: callable.clone(),
            args,
        });
    }
    Ok(elements)
}

fn axis_arg(arg: Arg) -> Result<AxisArg, DispatchError> {
    match arg {
        Arg::Scalar(v) => Ok(AxisArg::Fixed(CallArg::Value(v))),
        Arg::Tuple(items) => Ok(AxisArg::Fixed(CallArg::Value(tuple_value(items)?))),
        Arg::Stream(s) => Ok(AxisArg::Values(s.drain())),
        Arg::Buffer(s) => Ok(AxisArg::Slices(s)),
    }
}

fn fixed_only(arg: AxisArg) -> CallArg {
    match arg {
        AxisArg::Fixed(a) => a,
        // Unreachable: callers only use this when no axis was found.
        AxisArg::Values(vs) => CallArg::Value(Value::List(vs)),
        AxisArg::Slices(s) => CallArg::Slice(s),
    }
}

fn element_arg(arg: &mut AxisArg, index: usize) -> Result<CallArg, DispatchError> {
    match arg {
        AxisArg::Fixed(a) => Ok(a.clone()),
        AxisArg::Values(vs) => Ok(CallArg::Value(std::mem::replace(
            &mut vs[index],
            Value::Unit,
        ))),
        AxisArg::Slices(s) => Ok(CallArg::Slice(s.narrow(index, 1)?)),
    }
}
