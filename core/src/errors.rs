/// Error types for the Parley messaging bridge.
use crate::transport::StrategyKind;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One strategy's failure inside an exhausted fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// Strategy that failed
    pub strategy: StrategyKind,
    /// Human-readable failure reason
    pub reason: String,
    /// Whether the failure was structural (the strategy cannot do this at all)
    pub capability: bool,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn join_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Core error type for bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{strategy} delivery to '{target}' failed: {reason}")]
    Delivery {
        strategy: StrategyKind,
        target: String,
        reason: String,
    },

    #[error("{strategy} strategy cannot {operation}")]
    Capability {
        strategy: StrategyKind,
        operation: &'static str,
    },

    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout { waited: Duration, operation: String },

    #[error(
        "All strategies failed for '{target}' after {attempts} attempt(s): {}",
        join_failures(.failures)
    )]
    AggregateDelivery {
        target: String,
        attempts: u32,
        failures: Vec<StrategyFailure>,
    },

    #[error("Request id already pending: {0}")]
    DuplicateRequestId(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Invalid target name: {0:?}")]
    InvalidTarget(String),

    #[error("Message {0} is not a request")]
    NotARequest(String),

    #[error("Remote error: {0}")]
    Remote(serde_json::Value),

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Build a delivery error for a strategy/target pair.
    pub fn delivery(
        strategy: StrategyKind,
        target: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        BridgeError::Delivery {
            strategy,
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the strategy structurally cannot perform the operation.
    pub fn is_capability(&self) -> bool {
        matches!(self, BridgeError::Capability { .. })
    }

    /// True when re-running the same strategy later could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Delivery { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::AggregateDelivery { .. }
                | BridgeError::Runtime(_)
                | BridgeError::Io(_)
        )
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
