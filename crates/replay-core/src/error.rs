//! Error types for the replay engine
//!
//! All fallible operations return `Result<T, Error>`. Contract-level
//! failures (business rejections, runtime faults) are not errors: they are
//! recorded in the evaluation result. An `Error` means the evaluation itself
//! could not produce a trustworthy state.

use crate::FailureKind;

/// Replay engine error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed ledger data (bad identifiers, missing or misordered sort keys)
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// The definition loader has no contract (or source) under this id
    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    /// A fault aborted the evaluation because exceptions are not ignored
    #[error("Execution fault in {contract_id} at {interaction_id} ({kind}): {message}")]
    ExecutionFault {
        contract_id: String,
        interaction_id: String,
        kind: FailureKind,
        message: String,
    },

    /// A cache record does not agree with the interactions it claims to cover
    #[error("Cache inconsistency: {0}")]
    CacheInconsistency(String),

    /// Contract source could not be turned into an executor
    #[error("Invalid contract source: {0}")]
    Source(String),

    /// Persistent cache I/O failure
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Loader backend failure (gateway, node or database unreachable).
    /// Raised by external [`InteractionLoader`](crate::loader::InteractionLoader)
    /// and [`DefinitionLoader`](crate::loader::DefinitionLoader) implementations;
    /// the in-memory ledger never fails this way.
    #[error("Loader error: {0}")]
    Loader(String),
}

impl Error {
    /// Failure kind to record when this error surfaces inside a nested call.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::ExecutionFault { kind, .. } => *kind,
            _ => FailureKind::Runtime,
        }
    }
}

/// Result type alias for replay operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_of_nested_errors() {
        let fault = Error::ExecutionFault {
            contract_id: "c".into(),
            interaction_id: "tx".into(),
            kind: FailureKind::OutOfGas,
            message: "gas".into(),
        };
        assert_eq!(fault.failure_kind(), FailureKind::OutOfGas);
        assert_eq!(
            Error::ContractNotFound("c".into()).failure_kind(),
            FailureKind::Runtime
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::DataIntegrity("bad block hash".into());
        assert!(err.to_string().contains("bad block hash"));
    }
}
