use std::fmt::Display;

use gitaly_error::GitalyError;
use tonic::Status;

pub(crate) mod actors;
pub mod operations;
pub mod ref_;

/// Infrastructure failures surface as `Internal` with the error's text.
pub(crate) fn internal_error(err: impl Display) -> Status {
    GitalyError::internal(err.to_string()).into()
}
