// ============================================================================
// Transactional Operator
// ============================================================================
//
// Drives any `ReactiveTransactionManager` through one declarative boundary:
//
//   1. decide by propagation whether to begin, join, suspend or skip
//   2. install the boundary's `SessionContext` and run the body under its
//      effective timeout
//   3. commit, roll back or mark rollback-only depending on the outcome
//   4. clean up and resume whatever was suspended
//
// Step 4 always runs, whatever happened in steps 2 and 3.
//
// ============================================================================

use super::definition::{Propagation, TransactionDefinition};
use super::manager::ReactiveTransactionManager;
use super::registry::ResourceRegistry;
use super::status::{TransactionPhase, TransactionStatus};
use crate::context::{SessionContext, current_context_or_null, run_with_budget};
use crate::core::{AccessMode, Result, TxError, TxTimeout};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

type Status<M> = TransactionStatus<
    <M as ReactiveTransactionManager>::Transaction,
    <M as ReactiveTransactionManager>::Suspended,
>;

pub struct TransactionalOperator<M: ReactiveTransactionManager> {
    manager: Arc<M>,
}

impl<M: ReactiveTransactionManager> Clone for TransactionalOperator<M> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<M: ReactiveTransactionManager> TransactionalOperator<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    /// Runs `body` inside the boundary described by `definition`.
    ///
    /// Errors raised by `body` are returned unchanged after teardown; a
    /// failing rollback is only logged. If no `ResourceRegistry` is
    /// installed for the calling chain, one is created for the duration of
    /// this call.
    ///
    /// Dropping the returned future before it completes still releases the
    /// boundary: a transaction it began is rolled back and its session closed
    /// in the background, and a suspended transaction is bound again.
    pub async fn execute<F, Fut, T>(&self, definition: &TransactionDefinition, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        definition.validate()?;
        match ResourceRegistry::current() {
            Some(registry) => Box::pin(self.execute_in(&registry, definition, body)).await,
            None => {
                let registry = ResourceRegistry::new();
                registry
                    .clone()
                    .scope(async move { Box::pin(self.execute_in(&registry, definition, body)).await })
                    .await
            }
        }
    }

    async fn execute_in<F, Fut, T>(
        &self,
        registry: &ResourceRegistry,
        definition: &TransactionDefinition,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transaction = self.manager.get_transaction_object(registry)?;
        let parent = current_context_or_null();
        let requested = definition.timeout_or(self.manager.default_timeout());
        let timeout = SessionContext::effective_timeout(parent.as_deref(), requested);
        let mode = AccessMode::from_read_only(definition.read_only);

        if self.manager.is_existing_transaction(&transaction) {
            match definition.propagation {
                Propagation::Never => {
                    return Err(TxError::illegal_state(
                        "Existing transaction found for transaction marked with propagation NEVER",
                    ));
                }
                Propagation::NotSupported => {
                    debug!(
                        "Suspending current transaction for '{}'",
                        definition.display_name()
                    );
                    let suspended = self.manager.do_suspend(registry, &mut transaction).await?;
                    let guard = self.guard(
                        registry,
                        TransactionStatus::without_transaction(definition.read_only, Some(suspended)),
                    );
                    return self.run_without_transaction(guard, timeout, body).await;
                }
                _ => {
                    debug!(
                        "Participating in existing transaction for '{}'",
                        definition.display_name()
                    );
                    let context =
                        self.manager
                            .session_context(&transaction, mode, timeout, parent.as_ref());
                    let guard = self.guard(
                        registry,
                        TransactionStatus::participating(transaction, definition.read_only),
                    );
                    return self
                        .run_in_transaction(guard, context, timeout, definition, body)
                        .await;
                }
            }
        }

        match definition.propagation {
            Propagation::Mandatory => Err(TxError::illegal_state(
                "No existing transaction found for transaction marked with propagation MANDATORY",
            )),
            Propagation::Required => {
                let span = tracing::info_span!(
                    "transaction",
                    definition = %definition.display_name(),
                    mode = %mode,
                    timeout = %timeout
                );
                let mut guard = self.guard(
                    registry,
                    TransactionStatus::new_transaction(transaction, definition.read_only),
                );
                Box::pin(
                    async move {
                        let begun = match guard.status.transaction_mut() {
                            Some(transaction) => {
                                self.manager
                                    .do_begin(registry, transaction, definition, timeout)
                                    .await
                            }
                            None => Ok(()),
                        };
                        if let Err(err) = begun {
                            guard.status.complete();
                            return Err(err);
                        }
                        tracing::event!(tracing::Level::DEBUG, "transaction begun");
                        let context = guard
                            .status
                            .transaction()
                            .and_then(|transaction| {
                                self.manager.session_context(transaction, mode, timeout, None)
                            });
                        self.run_in_transaction(guard, context, timeout, definition, body)
                            .await
                    }
                    .instrument(span),
                )
                .await
            }
            _ => {
                let guard = self.guard(
                    registry,
                    TransactionStatus::without_transaction(definition.read_only, None),
                );
                self.run_without_transaction(guard, timeout, body).await
            }
        }
    }

    fn guard<'a>(&'a self, registry: &'a ResourceRegistry, status: Status<M>) -> BoundaryGuard<'a, M> {
        BoundaryGuard {
            manager: &*self.manager,
            registry,
            status,
        }
    }

    async fn run_in_transaction<F, Fut, T>(
        &self,
        mut guard: BoundaryGuard<'_, M>,
        context: Option<Arc<SessionContext>>,
        timeout: TxTimeout,
        definition: &TransactionDefinition,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome =
            SessionContext::scope(context, run_with_budget(timeout, Box::pin(body()))).await;
        let registry = guard.registry;

        match outcome {
            Ok(value) => {
                self.process_commit(registry, &mut guard.status).await?;
                Ok(value)
            }
            Err(err) if definition.rollback_on(&err) => {
                debug!(
                    "'{}' failed ({}), rolling back",
                    definition.display_name(),
                    err
                );
                self.process_rollback(registry, &mut guard.status).await;
                Err(err)
            }
            Err(err) => {
                debug!(
                    "'{}' failed with {:?}, committing per rollback rules",
                    definition.display_name(),
                    err.kind()
                );
                if let Err(commit_err) = self.process_commit(registry, &mut guard.status).await {
                    warn!("Application error overridden by commit error: {}", err);
                    return Err(commit_err);
                }
                Err(err)
            }
        }
    }

    async fn run_without_transaction<F, Fut, T>(
        &self,
        mut guard: BoundaryGuard<'_, M>,
        timeout: TxTimeout,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = SessionContext::scope(None, run_with_budget(timeout, Box::pin(body()))).await;
        let registry = guard.registry;
        self.cleanup_after_completion(registry, &mut guard.status).await;
        outcome
    }

    async fn process_commit(&self, registry: &ResourceRegistry, status: &mut Status<M>) -> Result<()> {
        let result = if status.is_new_transaction() {
            match status.enter(TransactionPhase::Committing) {
                Ok(()) => match status.transaction() {
                    Some(transaction) => self.commit_new(transaction).await,
                    None => Ok(()),
                },
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        };
        self.cleanup_after_completion(registry, status).await;
        result
    }

    async fn commit_new(&self, transaction: &M::Transaction) -> Result<()> {
        match self.manager.do_commit(transaction).await {
            Ok(()) => Ok(()),
            Err(err @ TxError::UnexpectedRollback(_)) => Err(err),
            Err(err) => {
                warn!("Commit failed, rolling back: {}", err);
                if let Err(rollback_err) = self.manager.do_rollback(transaction).await {
                    warn!("Rollback after failed commit also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn process_rollback(&self, registry: &ResourceRegistry, status: &mut Status<M>) {
        let result = if status.is_new_transaction() {
            match status.enter(TransactionPhase::RollingBack) {
                Ok(()) => match status.transaction() {
                    Some(transaction) => self.manager.do_rollback(transaction).await,
                    None => Ok(()),
                },
                Err(err) => Err(err),
            }
        } else if let Some(transaction) = status.transaction() {
            debug!("Participant failed, marking transaction rollback-only");
            self.manager.do_set_rollback_only(transaction)
        } else {
            Ok(())
        };
        if let Err(err) = result {
            warn!("Rollback failed: {}", err);
        }
        self.cleanup_after_completion(registry, status).await;
    }

    async fn cleanup_after_completion(&self, registry: &ResourceRegistry, status: &mut Status<M>) {
        status.complete();
        if let Some(transaction) = status.transaction() {
            if status.is_new_transaction() {
                if let Err(err) = self
                    .manager
                    .do_cleanup_after_completion(registry, transaction)
                    .await
                {
                    warn!("Cleanup after completion failed: {}", err);
                }
            }
        }
        resume(&*self.manager, registry, status);
    }
}

/// Owns a boundary's status while the boundary runs.
///
/// Normal teardown completes the status before the guard goes away. A guard
/// dropped with the status still open means the boundary's future was
/// cancelled mid-flight.
struct BoundaryGuard<'a, M: ReactiveTransactionManager> {
    manager: &'a M,
    registry: &'a ResourceRegistry,
    status: Status<M>,
}

impl<M: ReactiveTransactionManager> Drop for BoundaryGuard<'_, M> {
    fn drop(&mut self) {
        if !self.status.is_completed() {
            warn!(
                "Transaction boundary dropped in phase {}, releasing its resources",
                self.status.phase()
            );
            self.status.complete();
            if let Some(transaction) = self.status.transaction() {
                if self.status.is_new_transaction() {
                    self.manager.do_abandon(self.registry, transaction);
                } else if let Err(err) = self.manager.do_set_rollback_only(transaction) {
                    warn!("Failed to mark dropped participant rollback-only: {}", err);
                }
            }
        }
        // Cleanup may have been cut short after completing the status.
        resume(self.manager, self.registry, &mut self.status);
    }
}

fn resume<M: ReactiveTransactionManager>(
    manager: &M,
    registry: &ResourceRegistry,
    status: &mut Status<M>,
) {
    if let Some(suspended) = status.take_suspended() {
        if let Err(err) = manager.do_resume(registry, suspended) {
            warn!("Failed to resume suspended transaction: {}", err);
        }
    }
}
