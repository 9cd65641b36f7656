//! Error taxonomy for pipeline stages.
//!
//! Stage code returns `anyhow::Result` and attaches context freely. The
//! driver recovers the failure class with [`classify`], which walks the
//! error chain looking for a [`StageError`].

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// Invalid or missing configuration. Fatal before any stage runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A long-running engine operation did not finish within its bound.
    #[error("{stage} did not complete within {waited_secs}s")]
    StageTimeout { stage: String, waited_secs: u64 },

    /// An upstream blob the stage depends on does not exist.
    #[error("missing blob: {0}")]
    MissingBlob(String),

    /// An external engine rejected the request.
    #[error("{service} returned {status}: {payload}")]
    Engine {
        service: String,
        status: u16,
        payload: String,
    },

    /// The request body exceeded the engine's size limit.
    #[error("{service} rejected the request: payload too large")]
    PayloadTooLarge { service: String },

    /// A sink reported a partial failure.
    #[error("assertion failure: {0}")]
    AssertionFailure(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Configuration(_) => ErrorKind::Configuration,
            StageError::StageTimeout { .. } => ErrorKind::StageTimeout,
            StageError::MissingBlob(_) => ErrorKind::MissingBlob,
            StageError::Engine { .. } => ErrorKind::Engine,
            StageError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            StageError::AssertionFailure(_) => ErrorKind::AssertionFailure,
        }
    }

    pub fn engine(service: impl Into<String>, status: u16, payload: impl Into<String>) -> Self {
        StageError::Engine {
            service: service.into(),
            status,
            payload: payload.into(),
        }
    }
}

/// Failure class used for logging, state records, and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    StageTimeout,
    MissingBlob,
    Engine,
    PayloadTooLarge,
    AssertionFailure,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::StageTimeout => "stage_timeout",
            ErrorKind::MissingBlob => "missing_blob",
            ErrorKind::Engine => "engine",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::AssertionFailure => "assertion_failure",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Find the first [`StageError`] in the chain of `err`.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StageError>())
        .map(StageError::kind)
        .unwrap_or(ErrorKind::Other)
}
