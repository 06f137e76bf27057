//! Transport-level errors returned by the operation services.
//!
//! A [`GitalyError`] carries a gRPC code, a human readable message and a
//! small metadata map. The metadata travels as JSON in the status details so
//! clients can pick out structured context such as the offending reference.

use std::collections::BTreeMap;

use thiserror::Error;
use tonic::{Code, Status};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct GitalyError {
    code: Code,
    message: String,
    metadata: BTreeMap<String, String>,
}

impl GitalyError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attaches the reference the error is about.
    pub fn with_reference(self, reference: impl Into<String>) -> Self {
        self.with_metadata("reference", reference)
    }

    /// Prefixes the message with the name of the RPC that produced it.
    pub fn with_rpc(mut self, rpc: &str) -> Self {
        self.message = format!("{rpc}: {}", self.message);
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl From<GitalyError> for Status {
    fn from(error: GitalyError) -> Self {
        if error.metadata.is_empty() {
            return Status::new(error.code, error.message);
        }

        let details = serde_json::to_vec(&error.metadata).unwrap_or_default();
        Status::with_details(error.code, error.message, details.into())
    }
}
