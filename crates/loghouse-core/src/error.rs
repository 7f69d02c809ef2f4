//! Error types for the core crate.
//!
//! There is exactly one hard-rejection condition at this layer: a single
//! line whose serialized size already exceeds the chunk size bound. Such a
//! line can never be split, so the whole append is rejected as a client
//! error before anything is persisted.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("log line of {size} bytes exceeds the maximum chunk size of {max} bytes")]
    LineTooLarge { size: usize, max: usize },
}
