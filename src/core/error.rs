use super::types::ErrorKind;
use crate::transaction::Propagation;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Read-only violation: cannot {operation} inside a READ_ONLY transaction")]
    ReadOnlyViolation { operation: String },

    #[error("Transaction timed out after {budget:?}")]
    Timeout { budget: Duration },

    #[error("Unexpected rollback: {0}")]
    UnexpectedRollback(String),

    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("Execution context affinity violated: session belongs to worker {expected}, called from {actual}")]
    ExecutionContextAffinity { expected: String, actual: String },

    #[error("Unsupported propagation: {0:?}")]
    UnsupportedPropagation(Propagation),

    #[error("No transaction is active for the current call chain")]
    NoTransaction,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TxError>;

impl TxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxError::ReadOnlyViolation { .. } => ErrorKind::ReadOnlyViolation,
            TxError::Timeout { .. } => ErrorKind::Timeout,
            TxError::UnexpectedRollback(_) => ErrorKind::UnexpectedRollback,
            TxError::IllegalTransactionState(_) => ErrorKind::IllegalTransactionState,
            TxError::ExecutionContextAffinity { .. } => ErrorKind::ExecutionContextAffinity,
            TxError::UnsupportedPropagation(_) => ErrorKind::UnsupportedPropagation,
            TxError::NoTransaction => ErrorKind::NoTransaction,
            TxError::SessionClosed => ErrorKind::SessionClosed,
            TxError::Driver(_) => ErrorKind::Driver,
            TxError::WorkerUnavailable(_) => ErrorKind::WorkerUnavailable,
            TxError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            TxError::Application(_) => ErrorKind::Application,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TxError::Timeout { .. })
    }

    /// Programming errors that callers are not expected to recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TxError::ExecutionContextAffinity { .. })
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        TxError::IllegalTransactionState(message.into())
    }

    pub fn driver(message: impl Into<String>) -> Self {
        TxError::Driver(message.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Driver(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = TxError::ReadOnlyViolation {
            operation: "persist".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ReadOnlyViolation);
        assert!(err.to_string().contains("READ_ONLY"));

        let err: TxError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Application);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_timeout_is_distinct_from_business_errors() {
        let timeout = TxError::Timeout {
            budget: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());

        let business: TxError = anyhow::anyhow!("insufficient funds").into();
        assert!(!business.is_timeout());
    }

    #[test]
    fn test_affinity_is_fatal() {
        let err = TxError::ExecutionContextAffinity {
            expected: "worker-1".into(),
            actual: "worker-2".into(),
        };
        assert!(err.is_fatal());
        assert!(!TxError::NoTransaction.is_fatal());
    }
}
