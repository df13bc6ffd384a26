use thiserror::Error;

/// Recipient-specification evaluation failure, produced by the external
/// evaluator behind the engine. Fatal to the session: no job exists.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ResolutionError {
    pub message: String,
}

impl ResolutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failures the delivery engine can report when asked to start a job.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to evaluate recipient specification: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("failed to construct delivery engine: {message}")]
    Provider { message: String },
}

/// Per-recipient delivery failure. Never fatal to a job; relayed as an
/// outcome event and the job moves on.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("telegram request failed: {0}")]
    Request(String),
    #[error("telegram rejected by backend: {0}")]
    Rejected(String),
}
