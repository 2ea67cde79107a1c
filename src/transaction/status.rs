// ============================================================================
// Transaction Status
// ============================================================================
//
// Tracks one pass through a transaction boundary:
//
// ```text
// NoTransaction ──begin──> Active ──commit────> Committing  ──┐
//                            │                                ├──> Completed
//                            └─────rollback──> RollingBack ───┘
// ```
//
// ============================================================================

use crate::core::{Result, TxError};

/// Phase of a transaction boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// Boundary runs without a transaction
    NoTransaction,

    /// Transaction begun or joined, body running
    Active,

    /// Commit in progress
    Committing,

    /// Rollback in progress
    RollingBack,

    /// Boundary finished
    Completed,
}

impl TransactionPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionPhase::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionPhase::Completed)
    }
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionPhase::NoTransaction => write!(f, "NO_TRANSACTION"),
            TransactionPhase::Active => write!(f, "ACTIVE"),
            TransactionPhase::Committing => write!(f, "COMMITTING"),
            TransactionPhase::RollingBack => write!(f, "ROLLING_BACK"),
            TransactionPhase::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// State of one pass through a boundary, generic over the manager's
/// transaction object `T` and suspended-resources type `S`.
#[derive(Debug)]
pub struct TransactionStatus<T, S> {
    transaction: Option<T>,
    new_transaction: bool,
    read_only: bool,
    suspended: Option<S>,
    phase: TransactionPhase,
}

impl<T, S> TransactionStatus<T, S> {
    /// Status for a transaction this boundary started.
    pub fn new_transaction(transaction: T, read_only: bool) -> Self {
        Self {
            transaction: Some(transaction),
            new_transaction: true,
            read_only,
            suspended: None,
            phase: TransactionPhase::Active,
        }
    }

    /// Status for a boundary that joins an existing transaction.
    pub fn participating(transaction: T, read_only: bool) -> Self {
        Self {
            transaction: Some(transaction),
            new_transaction: false,
            read_only,
            suspended: None,
            phase: TransactionPhase::Active,
        }
    }

    /// Status for a boundary that runs without a transaction.
    pub fn without_transaction(read_only: bool, suspended: Option<S>) -> Self {
        Self {
            transaction: None,
            new_transaction: false,
            read_only,
            suspended,
            phase: TransactionPhase::NoTransaction,
        }
    }

    pub fn transaction(&self) -> Option<&T> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut T> {
        self.transaction.as_mut()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_new_transaction(&self) -> bool {
        self.has_transaction() && self.new_transaction
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn has_suspended_resources(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn take_suspended(&mut self) -> Option<S> {
        self.suspended.take()
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn is_completed(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Moves into `Committing` or `RollingBack`.
    ///
    /// # Errors
    /// Returns error if the boundary already completed
    pub fn enter(&mut self, phase: TransactionPhase) -> Result<()> {
        if self.is_completed() {
            return Err(TxError::illegal_state(format!(
                "transaction is already completed, cannot move to {}",
                phase
            )));
        }
        self.phase = phase;
        Ok(())
    }

    pub fn complete(&mut self) {
        self.phase = TransactionPhase::Completed;
    }
}
