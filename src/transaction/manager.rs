// ============================================================================
// Transaction Manager
// ============================================================================
//
// `ReactiveTransactionManager` is the contract `TransactionalOperator` drives:
// it owns the resource-specific half of a declarative transaction (how to
// begin, commit, suspend and release), the operator owns the generic half
// (propagation, rollback rules, timeouts, phase tracking).
//
// `SessionTransactionManager` implements it for driver sessions. The holder
// it binds carries the worker the session was opened on, and every driver
// call goes back through that worker.
//
// ============================================================================

use super::definition::TransactionDefinition;
use super::holder::SessionResourceHolder;
use super::registry::ResourceRegistry;
use crate::connection::SessionFactory;
use crate::context::SessionContext;
use crate::core::{AccessMode, DEFAULT_TIMEOUT, FactoryKey, Result, TxError, TxTimeout};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

#[async_trait]
pub trait ReactiveTransactionManager: Send + Sync {
    /// Resource-specific transaction object, fetched once per boundary
    type Transaction: Send + Sync;

    /// Whatever `do_suspend` took out of the registry
    type Suspended: Send;

    /// Timeout used when a definition leaves it unspecified
    fn default_timeout(&self) -> TxTimeout;

    /// Snapshot of what is currently bound for this manager's resource.
    fn get_transaction_object(&self, registry: &ResourceRegistry) -> Result<Self::Transaction>;

    fn is_existing_transaction(&self, transaction: &Self::Transaction) -> bool;

    async fn do_begin(
        &self,
        registry: &ResourceRegistry,
        transaction: &mut Self::Transaction,
        definition: &TransactionDefinition,
        timeout: TxTimeout,
    ) -> Result<()>;

    async fn do_commit(&self, transaction: &Self::Transaction) -> Result<()>;

    async fn do_rollback(&self, transaction: &Self::Transaction) -> Result<()>;

    fn do_set_rollback_only(&self, transaction: &Self::Transaction) -> Result<()>;

    async fn do_suspend(
        &self,
        registry: &ResourceRegistry,
        transaction: &mut Self::Transaction,
    ) -> Result<Self::Suspended>;

    /// Re-binds what `do_suspend` took. Synchronous, so a boundary dropped
    /// mid-flight can still resume from its `Drop`.
    fn do_resume(&self, registry: &ResourceRegistry, suspended: Self::Suspended) -> Result<()>;

    async fn do_cleanup_after_completion(
        &self,
        registry: &ResourceRegistry,
        transaction: &Self::Transaction,
    ) -> Result<()>;

    /// Releases a transaction whose boundary was dropped before completing.
    ///
    /// Must not block: driver work is queued and left to finish on its own.
    fn do_abandon(&self, registry: &ResourceRegistry, transaction: &Self::Transaction);

    /// Ambient view of `transaction` for the boundary's body.
    ///
    /// Returns `parent` itself when it already views the same transaction.
    fn session_context(
        &self,
        transaction: &Self::Transaction,
        mode: AccessMode,
        timeout: TxTimeout,
        parent: Option<&Arc<SessionContext>>,
    ) -> Option<Arc<SessionContext>>;
}

/// Transaction object of `SessionTransactionManager`
#[derive(Debug, Default)]
pub struct SessionTransactionObject {
    holder: Option<Arc<SessionResourceHolder>>,
    new_holder: bool,
}

impl SessionTransactionObject {
    pub fn holder(&self) -> Option<&Arc<SessionResourceHolder>> {
        self.holder.as_ref()
    }

    /// True when this boundary opened the session and must close it.
    pub fn is_new_holder(&self) -> bool {
        self.new_holder
    }

    fn require_holder(&self) -> Result<&Arc<SessionResourceHolder>> {
        self.holder.as_ref().ok_or(TxError::NoTransaction)
    }
}

/// Holder taken out of the registry while an outer transaction is suspended
#[derive(Debug)]
pub struct SuspendedResources {
    holder: Arc<SessionResourceHolder>,
}

impl SuspendedResources {
    pub fn holder(&self) -> &Arc<SessionResourceHolder> {
        &self.holder
    }
}

/// Session-backed transaction manager
pub struct SessionTransactionManager {
    factory: Arc<dyn SessionFactory>,
    default_timeout: TxTimeout,
}

impl SessionTransactionManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: TxTimeout) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    pub fn key(&self) -> FactoryKey {
        self.factory.key()
    }

    async fn release_failed_begin(
        &self,
        registry: &ResourceRegistry,
        holder: &SessionResourceHolder,
        new_holder: bool,
    ) {
        holder.set_synchronized_with_transaction(false);
        if !new_holder {
            return;
        }
        if let Err(err) = registry.unbind_if_possible(&self.key()) {
            warn!("Failed to unbind {} after failed begin: {}", holder.session().id(), err);
        }
        if let Err(err) = holder.close().await {
            warn!("Failed to close {} after failed begin: {}", holder.session().id(), err);
        }
    }
}

#[async_trait]
impl ReactiveTransactionManager for SessionTransactionManager {
    type Transaction = SessionTransactionObject;
    type Suspended = SuspendedResources;

    fn default_timeout(&self) -> TxTimeout {
        self.default_timeout
    }

    fn get_transaction_object(&self, registry: &ResourceRegistry) -> Result<SessionTransactionObject> {
        Ok(SessionTransactionObject {
            holder: registry.get(&self.key())?,
            new_holder: false,
        })
    }

    fn is_existing_transaction(&self, transaction: &SessionTransactionObject) -> bool {
        transaction
            .holder
            .as_ref()
            .is_some_and(|holder| holder.is_transaction_active())
    }

    async fn do_begin(
        &self,
        registry: &ResourceRegistry,
        transaction: &mut SessionTransactionObject,
        definition: &TransactionDefinition,
        timeout: TxTimeout,
    ) -> Result<()> {
        let prebound = transaction
            .holder
            .as_ref()
            .filter(|holder| !holder.is_synchronized_with_transaction())
            .cloned();

        let holder = match prebound {
            Some(holder) => {
                debug!(
                    "Beginning transaction '{}' on pre-bound {}",
                    definition.display_name(),
                    holder.session().id()
                );
                transaction.new_holder = false;
                holder
            }
            None => {
                let session = self.factory.open_session().await?;
                debug!(
                    "Opened {} on {} for transaction '{}'",
                    session.id(),
                    session.worker().id(),
                    definition.display_name()
                );
                let holder = Arc::new(SessionResourceHolder::new(
                    session,
                    AccessMode::from_read_only(definition.read_only),
                    timeout,
                ));
                if let Err(err) = registry.bind(self.key(), Arc::clone(&holder)) {
                    if let Err(close_err) = holder.close().await {
                        warn!("Failed to close {}: {}", holder.session().id(), close_err);
                    }
                    return Err(err);
                }
                transaction.holder = Some(Arc::clone(&holder));
                transaction.new_holder = true;
                holder
            }
        };

        holder.set_synchronized_with_transaction(true);
        if let Err(err) = holder.begin().await {
            self.release_failed_begin(registry, &holder, transaction.new_holder)
                .await;
            if transaction.new_holder {
                transaction.holder = None;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn do_commit(&self, transaction: &SessionTransactionObject) -> Result<()> {
        let holder = transaction.require_holder()?;
        if holder.is_rollback_only() {
            debug!(
                "{} is rollback-only, rolling back instead of committing",
                holder.session().id()
            );
            if let Err(err) = holder.rollback().await {
                warn!("Rollback of rollback-only {} failed: {}", holder.session().id(), err);
            }
            return Err(TxError::UnexpectedRollback(
                "Transaction silently rolled back because it has been marked as rollback-only"
                    .to_string(),
            ));
        }
        holder.flush_and_commit().await
    }

    async fn do_rollback(&self, transaction: &SessionTransactionObject) -> Result<()> {
        transaction.require_holder()?.rollback().await
    }

    fn do_set_rollback_only(&self, transaction: &SessionTransactionObject) -> Result<()> {
        transaction.require_holder()?.set_rollback_only();
        Ok(())
    }

    async fn do_suspend(
        &self,
        registry: &ResourceRegistry,
        transaction: &mut SessionTransactionObject,
    ) -> Result<SuspendedResources> {
        transaction.holder = None;
        let holder = registry.unbind(&self.key())?;
        debug!("Suspended transaction on {}", holder.session().id());
        Ok(SuspendedResources { holder })
    }

    fn do_resume(&self, registry: &ResourceRegistry, suspended: SuspendedResources) -> Result<()> {
        debug!("Resuming transaction on {}", suspended.holder.session().id());
        registry.bind(self.key(), suspended.holder)
    }

    async fn do_cleanup_after_completion(
        &self,
        registry: &ResourceRegistry,
        transaction: &SessionTransactionObject,
    ) -> Result<()> {
        let holder = transaction.require_holder()?;
        holder.set_synchronized_with_transaction(false);
        if !transaction.new_holder {
            return Ok(());
        }
        registry.unbind_if_possible(&self.key())?;
        holder.close().await?;
        debug!("Closed {} after completion", holder.session().id());
        Ok(())
    }

    fn do_abandon(&self, registry: &ResourceRegistry, transaction: &SessionTransactionObject) {
        let Some(holder) = transaction.holder.as_ref() else {
            return;
        };
        holder.set_synchronized_with_transaction(false);
        if transaction.new_holder {
            if let Err(err) = registry.unbind_if_possible(&self.key()) {
                warn!("Failed to unbind abandoned {}: {}", holder.session().id(), err);
            }
        }
        holder.abandon(transaction.new_holder);
    }

    fn session_context(
        &self,
        transaction: &SessionTransactionObject,
        mode: AccessMode,
        timeout: TxTimeout,
        parent: Option<&Arc<SessionContext>>,
    ) -> Option<Arc<SessionContext>> {
        let holder = transaction.holder.as_ref()?;
        match parent {
            Some(parent) if Arc::ptr_eq(parent.holder(), holder) => Some(Arc::clone(parent)),
            _ => Some(Arc::new(SessionContext::new(Arc::clone(holder), mode, timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryDriver;
    use crate::connection::pool::WorkerPool;

    fn setup() -> (Arc<MemoryDriver>, SessionTransactionManager) {
        let workers = Arc::new(WorkerPool::new(2, "manager-test").unwrap());
        let driver = Arc::new(MemoryDriver::new(workers));
        let manager = SessionTransactionManager::new(driver.clone());
        (driver, manager)
    }

    #[tokio::test]
    async fn test_begin_binds_new_holder() {
        let (driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut tx = manager.get_transaction_object(&registry).unwrap();
        assert!(!manager.is_existing_transaction(&tx));

        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        assert!(tx.is_new_holder());
        assert!(manager.is_existing_transaction(&tx));
        assert!(registry.has(&driver.key()).unwrap());

        manager.do_commit(&tx).await.unwrap();
        manager.do_cleanup_after_completion(&registry, &tx).await.unwrap();
        assert!(registry.is_empty());

        let stats = driver.stats();
        assert_eq!(stats.begun, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_commit_of_rollback_only_fails() {
        let (driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut tx = manager.get_transaction_object(&registry).unwrap();
        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        manager.do_set_rollback_only(&tx).unwrap();
        let err = manager.do_commit(&tx).await.unwrap_err();
        assert!(matches!(err, TxError::UnexpectedRollback(_)));

        manager.do_cleanup_after_completion(&registry, &tx).await.unwrap();
        let stats = driver.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 1);
    }

    #[tokio::test]
    async fn test_rollback_only_commit_reports_unexpected_rollback_even_if_rollback_fails() {
        let (_driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut tx = manager.get_transaction_object(&registry).unwrap();
        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        // Rollback on a closed session fails with SessionClosed.
        tx.holder().unwrap().close().await.unwrap();
        manager.do_set_rollback_only(&tx).unwrap();

        let err = manager.do_commit(&tx).await.unwrap_err();
        assert!(matches!(err, TxError::UnexpectedRollback(_)));
        assert!(!tx.holder().unwrap().is_transaction_active());
    }

    #[tokio::test]
    async fn test_abandon_unbinds_and_releases_new_holder() {
        let (driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut tx = manager.get_transaction_object(&registry).unwrap();
        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        manager.do_abandon(&registry, &tx);
        assert!(registry.is_empty());
        assert!(!manager.is_existing_transaction(&tx));

        for _ in 0..100 {
            if driver.stats().open_sessions() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let stats = driver.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let (driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut outer = manager.get_transaction_object(&registry).unwrap();
        manager
            .do_begin(&registry, &mut outer, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        let mut inner = manager.get_transaction_object(&registry).unwrap();
        let suspended = manager.do_suspend(&registry, &mut inner).await.unwrap();
        assert!(!registry.has(&driver.key()).unwrap());
        assert!(!manager.is_existing_transaction(&inner));

        manager.do_resume(&registry, suspended).unwrap();
        let resumed = registry.get(&driver.key()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&resumed, outer.holder().unwrap()));

        manager.do_rollback(&outer).await.unwrap();
        manager.do_cleanup_after_completion(&registry, &outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_prebound_holder_is_not_closed() {
        let (driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let session = driver.open_session().await.unwrap();
        let holder = Arc::new(SessionResourceHolder::new(
            session,
            AccessMode::ReadWrite,
            TxTimeout::Unbounded,
        ));
        registry.bind(driver.key(), holder.clone()).unwrap();

        let mut tx = manager.get_transaction_object(&registry).unwrap();
        assert!(!manager.is_existing_transaction(&tx));
        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();
        assert!(!tx.is_new_holder());
        assert!(Arc::ptr_eq(tx.holder().unwrap(), &holder));

        manager.do_commit(&tx).await.unwrap();
        manager.do_cleanup_after_completion(&registry, &tx).await.unwrap();

        assert!(registry.has(&driver.key()).unwrap());
        assert_eq!(driver.stats().open_sessions(), 1);
        holder.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_context_reuses_parent_for_same_holder() {
        let (_driver, manager) = setup();
        let registry = ResourceRegistry::new();
        let mut tx = manager.get_transaction_object(&registry).unwrap();
        manager
            .do_begin(&registry, &mut tx, &TransactionDefinition::new(), TxTimeout::Unbounded)
            .await
            .unwrap();

        let parent = manager
            .session_context(&tx, AccessMode::ReadWrite, TxTimeout::Unbounded, None)
            .unwrap();
        let reused = manager
            .session_context(&tx, AccessMode::ReadOnly, TxTimeout::seconds(1), Some(&parent))
            .unwrap();
        assert!(Arc::ptr_eq(&parent, &reused));

        manager.do_rollback(&tx).await.unwrap();
        manager.do_cleanup_after_completion(&registry, &tx).await.unwrap();
    }
}
