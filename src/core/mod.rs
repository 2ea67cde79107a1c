pub mod error;
pub mod types;

pub use error::{Result, TxError};
pub use types::{AccessMode, DEFAULT_TIMEOUT, ErrorKind, FactoryKey, SessionId, TxTimeout};
