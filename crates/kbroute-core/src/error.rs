use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single adapter call produced no answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection or transport error. The only kind the coordinator retries.
    Unreachable,
    /// The per-call deadline passed before the backend answered.
    Timeout,
    /// The backend answered with something that could not be used.
    BadResponse,
}

/// Typed failure returned by an `IndexAdapter`.
///
/// An empty hit list is not a failure; adapters return `Ok(vec![])` for it.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct AdapterFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl AdapterFailure {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Unreachable, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Timeout, message: message.into() }
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::BadResponse, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Unreachable
    }
}
