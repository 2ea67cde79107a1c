use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Budget applied when neither the caller nor the transaction definition
/// asks for a specific timeout.
pub const DEFAULT_TIMEOUT: TxTimeout = TxTimeout::Bounded(Duration::from_secs(30));

/// Access mode of a session scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "READ_ONLY"),
            AccessMode::ReadWrite => write!(f, "READ_WRITE"),
        }
    }
}

/// A timeout budget: either unbounded or a concrete duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxTimeout {
    Unbounded,
    Bounded(Duration),
}

impl TxTimeout {
    pub const fn seconds(secs: u64) -> Self {
        TxTimeout::Bounded(Duration::from_secs(secs))
    }

    pub const fn millis(millis: u64) -> Self {
        TxTimeout::Bounded(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TxTimeout::Unbounded => None,
            TxTimeout::Bounded(duration) => Some(*duration),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, TxTimeout::Unbounded)
    }

    /// The tighter of two budgets. `Unbounded` never wins over a bounded one.
    pub fn tightest(self, other: TxTimeout) -> TxTimeout {
        match (self, other) {
            (TxTimeout::Unbounded, other) => other,
            (this, TxTimeout::Unbounded) => this,
            (TxTimeout::Bounded(a), TxTimeout::Bounded(b)) => TxTimeout::Bounded(a.min(b)),
        }
    }

    /// Budget left after `elapsed`, clamped at zero.
    pub fn remaining_after(self, elapsed: Duration) -> TxTimeout {
        match self {
            TxTimeout::Unbounded => TxTimeout::Unbounded,
            TxTimeout::Bounded(budget) => TxTimeout::Bounded(budget.saturating_sub(elapsed)),
        }
    }
}

impl From<Duration> for TxTimeout {
    fn from(duration: Duration) -> Self {
        TxTimeout::Bounded(duration)
    }
}

impl From<Option<Duration>> for TxTimeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(TxTimeout::Unbounded, TxTimeout::Bounded)
    }
}

impl std::fmt::Display for TxTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxTimeout::Unbounded => write!(f, "unbounded"),
            TxTimeout::Bounded(duration) => write!(f, "{:?}", duration),
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a driver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn new() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Stable identity of a session factory; the key resource holders are
/// registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryKey(Uuid);

impl FactoryKey {
    pub fn new() -> Self {
        FactoryKey(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FactoryKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FactoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "factory_{}", self.0)
    }
}

/// Fieldless view of `TxError`, used by rollback rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ReadOnlyViolation,
    Timeout,
    UnexpectedRollback,
    IllegalTransactionState,
    ExecutionContextAffinity,
    UnsupportedPropagation,
    NoTransaction,
    SessionClosed,
    Driver,
    WorkerUnavailable,
    InvalidConfig,
    Application,
}
