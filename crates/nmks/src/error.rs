//! Kill switch error taxonomy.

use crate::config::ConfigError;
use nmks_loop::LoopError;
use std::time::Duration;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, KillSwitchError>;

/// Kill switch errors
///
/// "Already present" and "not found" are not errors: they are absorbed by
/// the connection handler and only logged.
#[derive(Debug, thiserror::Error)]
pub enum KillSwitchError {
    /// The network service rejected a request, or a device ended up in a
    /// state other than the one being waited for.
    #[error("{operation} failed: {reason}")]
    ActivationFailure { operation: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("no IPv4 gateway found for interface {0}")]
    GatewayNotFound(String),

    #[error("network service unavailable: {0}")]
    BackendUnavailable(String),

    #[error("network service object touched outside its event loop thread")]
    ThreadingViolation,

    #[error("invalid address {value:?}: {reason}")]
    InvalidAddressFormat { value: String, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KillSwitchError {
    pub(crate) fn activation(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::ActivationFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_address(value: &str, reason: impl ToString) -> Self {
        Self::InvalidAddressFormat {
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Map a loop failure, naming the operation that was waiting.
    pub(crate) fn from_loop(operation: &str, err: LoopError) -> Self {
        match err {
            LoopError::Timeout(after) => Self::Timeout {
                operation: operation.to_string(),
                after,
            },
            other => other.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::GatewayNotFound(_))
    }
}

impl From<LoopError> for KillSwitchError {
    fn from(err: LoopError) -> Self {
        match err {
            LoopError::Timeout(after) => Self::Timeout {
                operation: "event loop call".to_string(),
                after,
            },
            LoopError::ThreadingViolation => Self::ThreadingViolation,
            LoopError::Spawn(e) => Self::BackendUnavailable(e.to_string()),
            LoopError::Init(msg) => Self::BackendUnavailable(msg),
            LoopError::Abandoned => {
                Self::BackendUnavailable("event loop dropped the request".to_string())
            }
        }
    }
}
