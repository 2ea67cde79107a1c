// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Session-per-transaction lifecycle on top of a driver whose sessions are
// bound to the worker that opened them.
//
// - definition: propagation, read-only flag, timeout, rollback rules
// - holder:     the resource record owning a session for one call chain
// - registry:   scope-local map of bound holders, keyed by factory identity
// - manager:    begin/commit/rollback/suspend/resume against holders
// - operator:   generic driver of the declarative state machine
// - executor:   programmatic `transactional` / `read_only` entry points
//
// ============================================================================

pub mod definition;
pub mod executor;
pub mod holder;
pub mod manager;
pub mod operator;
pub mod registry;
pub mod status;

pub use definition::{Propagation, TransactionDefinition};
pub use executor::TransactionExecutor;
pub use holder::SessionResourceHolder;
pub use manager::{
    ReactiveTransactionManager, SessionTransactionManager, SessionTransactionObject,
    SuspendedResources,
};
pub use operator::TransactionalOperator;
pub use registry::ResourceRegistry;
pub use status::{TransactionPhase, TransactionStatus};
