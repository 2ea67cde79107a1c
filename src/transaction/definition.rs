use crate::core::{ErrorKind, Result, TxError, TxTimeout};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Propagation behaviour of a transaction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Propagation {
    /// Join the current transaction, or start one.
    #[default]
    Required,
    /// Join the current transaction, or run without one.
    Supports,
    /// Suspend the current transaction and run without one.
    NotSupported,
    /// Join the current transaction; fail if there is none.
    Mandatory,
    /// Fail if a transaction is active.
    Never,
    /// Not supported: would open a second session for the same call chain.
    RequiresNew,
    /// Not supported.
    Nested,
}

impl Propagation {
    pub fn is_supported(&self) -> bool {
        !matches!(self, Propagation::RequiresNew | Propagation::Nested)
    }
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Propagation::Required => "REQUIRED",
            Propagation::Supports => "SUPPORTS",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Never => "NEVER",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
        };
        write!(f, "{}", name)
    }
}

/// Attributes of a declarative transaction boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDefinition {
    pub name: Option<String>,
    pub propagation: Propagation,
    pub read_only: bool,
    /// `None` means "use the manager's default".
    pub timeout: Option<TxTimeout>,
    /// Error kinds that commit instead of rolling back.
    pub no_rollback_for: Vec<ErrorKind>,
}

impl TransactionDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn timeout(mut self, timeout: TxTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_secs(self, seconds: u64) -> Self {
        self.timeout(TxTimeout::Bounded(Duration::from_secs(seconds)))
    }

    pub fn no_rollback_for(mut self, kind: ErrorKind) -> Self {
        if !self.no_rollback_for.contains(&kind) {
            self.no_rollback_for.push(kind);
        }
        self
    }

    /// Timeout to apply, falling back to `default`.
    pub fn timeout_or(&self, default: TxTimeout) -> TxTimeout {
        self.timeout.unwrap_or(default)
    }

    /// Whether `err` raised by the body should roll the transaction back.
    pub fn rollback_on(&self, err: &TxError) -> bool {
        !self.no_rollback_for.contains(&err.kind())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.propagation.is_supported() {
            return Err(TxError::UnsupportedPropagation(self.propagation));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}
