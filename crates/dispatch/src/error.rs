use spindle_core::CoreError;
use thiserror::Error;

/// Errors reported synchronously by the dispatch layer, before or instead
/// of task submission.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Argument shape: {0}")]
    ArgumentShape(String),

    #[error("Duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("Backend misuse: {0}")]
    BackendMisuse(String),

    #[error("Executor: {0}")]
    Executor(String),

    /// First failed slot of a batch, surfaced by the blocking convenience
    /// path. Sibling results are still available through the handle API.
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Per-slot failure captured from a task's callable.
///
/// A failing element marks only its own slot; sibling task units keep
/// running and their slots stay valid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Argument {0}: {1}")]
    BadArgument(usize, String),
}

impl From<CoreError> for TaskError {
    fn from(e: CoreError) -> Self {
        TaskError::Failed(e.to_string())
    }
}
