//! Shared, in-place-mutable numeric buffers.
//!
//! An [`ArrayBuffer`] is the engine's view of caller-owned array storage:
//! an opaque handle the dispatcher never copies and never deallocates.
//! Tasks receive [`BufferSlice`] range views; a slice written by a task is
//! itself part of that task's result, so callers observe mutations through
//! the handle they already hold.
//!
//! Concurrent tasks may read overlapping ranges freely. Mutating tasks are
//! handed disjoint index ranges by the normalizer, so writer serialization
//! on the inner lock is a correctness backstop, not the partitioning
//! mechanism.

use std::sync::{Arc, RwLock};

use crate::error::CoreError;

/// Shared handle over a mutable `f64` array.
#[derive(Debug, Clone)]
pub struct ArrayBuffer {
    data: Arc<RwLock<Vec<f64>>>,
}

impl ArrayBuffer {
    pub fn new(data: Vec<f64>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Buffer length. Stable for the buffer's lifetime: the engine never
    /// grows or shrinks caller storage.
    pub fn len(&self) -> usize {
        // Length is fixed after construction, so a poisoned lock still
        // holds the correct value.
        match self.data.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the current contents out.
    pub fn to_vec(&self) -> Result<Vec<f64>, CoreError> {
        let guard = self
            .data
            .read()
            .map_err(|e| CoreError::LockPoisoned(format!("buffer read: {e}")))?;
        Ok(guard.clone())
    }

    /// View covering the whole buffer.
    pub fn slice_all(&self) -> BufferSlice {
        BufferSlice {
            buffer: self.clone(),
            start: 0,
            len: self.len(),
        }
    }

    /// View covering `start..start + len`.
    pub fn slice(&self, start: usize, len: usize) -> Result<BufferSlice, CoreError> {
        let buffer_len = self.len();
        if start + len > buffer_len {
            return Err(CoreError::SliceOutOfBounds {
                start,
                end: start + len,
                buffer_len,
            });
        }
        Ok(BufferSlice {
            buffer: self.clone(),
            start,
            len,
        })
    }

    /// Two handles over the same underlying storage?
    pub fn same_storage(&self, other: &ArrayBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// A range view into an [`ArrayBuffer`], usable as a task argument.
///
/// Cloning is cheap and keeps the backing buffer alive.
#[derive(Debug, Clone)]
pub struct BufferSlice {
    buffer: ArrayBuffer,
    start: usize,
    len: usize,
}

impl BufferSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Handle to the backing buffer.
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    /// Narrow this view to `offset..offset + len` relative to itself.
    pub fn narrow(&self, offset: usize, len: usize) -> Result<BufferSlice, CoreError> {
        if offset + len > self.len {
            return Err(CoreError::SliceOutOfBounds {
                start: self.start + offset,
                end: self.start + offset + len,
                buffer_len: self.start + self.len,
            });
        }
        self.buffer.slice(self.start + offset, len)
    }

    /// Copy this range out.
    pub fn to_vec(&self) -> Result<Vec<f64>, CoreError> {
        self.with(|s| s.to_vec())
    }

    /// Read access to the range.
    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> Result<R, CoreError> {
        let guard = self
            .buffer
            .data
            .read()
            .map_err(|e| CoreError::LockPoisoned(format!("buffer read: {e}")))?;
        Ok(f(&guard[self.start..self.start + self.len]))
    }

    /// In-place write access to the range.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> Result<R, CoreError> {
        let mut guard = self
            .buffer
            .data
            .write()
            .map_err(|e| CoreError::LockPoisoned(format!("buffer write: {e}")))?;
        Ok(f(&mut guard[self.start..self.start + self.len]))
    }
}
