//! The scalar universe that flows through deferred calls.
//!
//! A [`Value`] is what a callable receives for scalar arguments and what it
//! returns as its result. Buffers are deliberately not values: they are
//! shared handles (see [`crate::buffer`]) whose mutation is itself the
//! result of a task.

use serde::{Deserialize, Serialize};

/// A plain, owned datum passed into or returned from a callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered collection; also the mapping of tuple arguments.
    List(Vec<Value>),
}

impl Value {
    /// Number of leaf elements, used for size-classing.
    pub fn element_count(&self) -> usize {
        match self {
            Value::List(items) => items.iter().map(Value::element_count).sum(),
            Value::Unit => 0,
            _ => 1,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric coercion: ints widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_counts_leaves() {
        assert_eq!(Value::Int(3).element_count(), 1);
        assert_eq!(Value::Unit.element_count(), 0);
        let nested = Value::List(vec![
            Value::Int(1),
            Value::List(vec![Value::Float(2.0), Value::Float(3.0)]),
        ]);
        assert_eq!(nested.element_count(), 3);
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::Int(2).as_float(), Some(2.0));
        assert_eq!(Value::Float(2.5).as_int(), None);
    }

    #[test]
    fn from_vec_builds_list() {
        let v: Value = vec![1i64, 2, 3].into();
        assert_eq!(v.as_list().unwrap().len(), 3);
    }
}
