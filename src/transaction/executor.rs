use super::definition::TransactionDefinition;
use super::manager::{ReactiveTransactionManager, SessionTransactionManager};
use super::operator::TransactionalOperator;
use crate::context::{SessionContext, current_context_for, current_context_or_null, run_with_budget};
use crate::core::{AccessMode, Result, TxTimeout};
use log::debug;
use std::future::Future;
use std::sync::Arc;

/// Programmatic transaction boundaries.
///
/// A call made inside an enclosing scope joins it and shares its session;
/// otherwise it opens a fresh session on a dedicated worker and runs `body`
/// in a new transaction.
///
/// # Example
///
/// ```ignore
/// let total = executor
///     .transactional(|| async {
///         template.persist("order:1", json!({ "total": 10 })).await?;
///         template.count().await
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct TransactionExecutor {
    operator: TransactionalOperator<SessionTransactionManager>,
}

impl TransactionExecutor {
    pub fn new(manager: Arc<SessionTransactionManager>) -> Self {
        Self {
            operator: TransactionalOperator::new(manager),
        }
    }

    pub fn from_operator(operator: TransactionalOperator<SessionTransactionManager>) -> Self {
        Self { operator }
    }

    pub fn operator(&self) -> &TransactionalOperator<SessionTransactionManager> {
        &self.operator
    }

    /// Timeout used by `transactional` and `read_only`: the manager's
    /// default, `DEFAULT_TIMEOUT` unless configured otherwise.
    pub fn default_timeout(&self) -> TxTimeout {
        self.operator.manager().default_timeout()
    }

    /// Read-write scope with the default timeout.
    pub async fn transactional<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(AccessMode::ReadWrite, self.default_timeout(), body).await
    }

    pub async fn transactional_with_timeout<F, Fut, T>(
        &self,
        timeout: TxTimeout,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(AccessMode::ReadWrite, timeout, body).await
    }

    /// Read-only scope with the default timeout. Writes issued through the
    /// query layer fail with `ReadOnlyViolation`.
    pub async fn read_only<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(AccessMode::ReadOnly, self.default_timeout(), body).await
    }

    pub async fn read_only_with_timeout<F, Fut, T>(&self, timeout: TxTimeout, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(AccessMode::ReadOnly, timeout, body).await
    }

    async fn run<F, Fut, T>(&self, mode: AccessMode, timeout: TxTimeout, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ambient = current_context_or_null();
        let effective = SessionContext::effective_timeout(ambient.as_deref(), timeout);

        // A context of another factory still bounds the budget, but is not joined.
        match current_context_for(&self.operator.manager().key()) {
            Some(parent) => {
                debug!(
                    "Joining {} scope on {} (budget {})",
                    parent.mode(),
                    parent.session().id(),
                    effective
                );
                let mut marker = RollbackOnlyUnlessOk {
                    parent: &parent,
                    ok: false,
                };
                let result = run_with_budget(effective, Box::pin(body())).await;
                marker.ok = result.is_ok();
                result
            }
            None => {
                let definition = TransactionDefinition::new()
                    .read_only(mode.is_read_only())
                    .timeout(effective);
                Box::pin(self.operator.execute(&definition, body)).await
            }
        }
    }
}

/// Marks the joined transaction rollback-only when the participant fails or
/// is dropped before finishing.
struct RollbackOnlyUnlessOk<'a> {
    parent: &'a SessionContext,
    ok: bool,
}

impl Drop for RollbackOnlyUnlessOk<'_> {
    fn drop(&mut self) {
        if !self.ok {
            self.parent.set_rollback_only();
        }
    }
}
