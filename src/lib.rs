// ============================================================================
// sessiontx Library
// ============================================================================
//
// Session and transaction lifecycle on top of a database driver whose
// sessions are bound to the worker that opened them.
//
// - core:        error type, timeouts, access modes, identifiers
// - connection:  driver contracts, workers, in-memory reference driver
// - context:     the ambient `SessionContext` of a call chain
// - transaction: holders, registry, declarative manager, executor
// - query:       `SessionTemplate`, the data-access side of the context
// - facade:      `Database`, wiring everything together
//
// ============================================================================

pub mod connection;
pub mod context;
pub mod core;
pub mod facade;
pub mod query;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{AccessMode, DEFAULT_TIMEOUT, ErrorKind, Result, TxError, TxTimeout};
pub use facade::Database;

pub use connection::{
    Session, SessionFactory, SessionHandle,
    config::SessionConfig,
    memory::{DriverStats, MemoryDriver},
    pool::WorkerPool,
};
pub use context::{
    SessionContext, current_context_for, current_context_or_null, current_session_or_null,
    propagate,
};
pub use query::SessionTemplate;
pub use transaction::{
    Propagation, ReactiveTransactionManager, ResourceRegistry, SessionResourceHolder,
    SessionTransactionManager, TransactionDefinition, TransactionExecutor, TransactionalOperator,
};
