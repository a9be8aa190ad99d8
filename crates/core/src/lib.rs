pub mod buffer;
pub mod config;
pub mod error;
pub mod value;

pub use buffer::{ArrayBuffer, BufferSlice};
pub use config::{load_dotenv, DispatchConfig};
pub use error::CoreError;
pub use value::Value;
