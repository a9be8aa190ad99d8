use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Slice {start}..{end} out of bounds for buffer of length {buffer_len}")]
    SliceOutOfBounds {
        start: usize,
        end: usize,
        buffer_len: usize,
    },

    #[error("{0}")]
    Other(String),
}
