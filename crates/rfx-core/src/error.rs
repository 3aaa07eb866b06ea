use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::CycleFailure;

/// Core error type for configuration and wiring.
#[derive(Debug, Error)]
pub enum RfxError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RfxError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Failure of a language-model call. Always absorbed into a not-approved outcome.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be parsed: {0}")]
    Malformed(String),
    #[error("model returned no content")]
    Empty,
    #[error("model call exceeded {0} ms")]
    Timeout(u64),
}

impl GenerationError {
    /// Transport failures and throttling are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Transport(_) | GenerationError::Timeout(_) => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            GenerationError::Malformed(_) | GenerationError::Empty => false,
        }
    }
}

/// Failure of the search provider. The Answerer proceeds without results.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("web search is unavailable: {0}")]
    Unavailable(String),
    #[error("search request failed: {0}")]
    Transport(String),
    #[error("search endpoint returned status {0}")]
    Status(u16),
    #[error("search response could not be parsed: {0}")]
    Malformed(String),
    #[error("search returned no results")]
    NoResults,
}

/// Terminal outcomes of a question cycle that propagate to the caller.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no approved answer after {} iteration(s): {}", .0.iterations, .0.objections.join("; "))]
    IterationExhausted(Box<CycleFailure>),
    #[error("question cancelled before a terminal state was reached")]
    Cancelled,
}

impl CycleError {
    pub fn failure(&self) -> Option<&CycleFailure> {
        match self {
            CycleError::IterationExhausted(failure) => Some(failure),
            CycleError::Cancelled => None,
        }
    }
}
