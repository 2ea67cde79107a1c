use crate::connection::SessionFactory;
use crate::connection::config::SessionConfig;
use crate::connection::memory::{DriverStats, MemoryDriver};
use crate::connection::pool::{WorkerPool, WorkerPoolStats};
use crate::core::{Result, TxError, TxTimeout};
use crate::query::SessionTemplate;
use crate::transaction::{
    SessionTransactionManager, TransactionDefinition, TransactionExecutor, TransactionalOperator,
};
use log::info;
use std::future::Future;
use std::sync::Arc;

/// Entry point wiring a session factory to the transaction machinery.
///
/// ```ignore
/// let db = Database::open(SessionConfig::new().worker_count(2))?;
/// db.transactional(|| async {
///     db.template().persist("user:1", json!({ "name": "Alice" })).await
/// })
/// .await?;
/// ```
pub struct Database {
    config: SessionConfig,
    driver: Option<Arc<MemoryDriver>>,
    manager: Arc<SessionTransactionManager>,
    operator: TransactionalOperator<SessionTransactionManager>,
    executor: TransactionExecutor,
    template: SessionTemplate,
}

impl Database {
    /// Start workers and an in-memory driver on top of them.
    pub fn open(config: SessionConfig) -> Result<Self> {
        config.validate().map_err(TxError::InvalidConfig)?;

        let workers = Arc::new(WorkerPool::new(
            config.worker_count,
            &config.worker_name_prefix,
        )?);
        let mut driver = MemoryDriver::new(workers);
        if let Some(latency) = config.driver_latency {
            driver = driver.with_latency(latency);
        }
        let driver = Arc::new(driver);

        info!(
            "Opened in-memory database with {} workers, default timeout {}",
            config.worker_count, config.default_timeout
        );

        let mut database = Self::with_factory(driver.clone(), config);
        database.driver = Some(driver);
        Ok(database)
    }

    /// Use an existing session factory. Worker settings in `config` are
    /// ignored; the factory brings its own workers.
    pub fn with_factory(factory: Arc<dyn SessionFactory>, config: SessionConfig) -> Self {
        let manager = Arc::new(
            SessionTransactionManager::new(Arc::clone(&factory))
                .with_default_timeout(config.default_timeout),
        );
        let operator = TransactionalOperator::new(Arc::clone(&manager));

        Self {
            config,
            driver: None,
            executor: TransactionExecutor::from_operator(operator.clone()),
            template: SessionTemplate::new(factory),
            manager,
            operator,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> TxTimeout {
        self.config.default_timeout
    }

    pub fn template(&self) -> &SessionTemplate {
        &self.template
    }

    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    pub fn operator(&self) -> &TransactionalOperator<SessionTransactionManager> {
        &self.operator
    }

    pub fn manager(&self) -> &Arc<SessionTransactionManager> {
        &self.manager
    }

    /// The in-memory driver, when opened through `open`.
    pub fn driver(&self) -> Option<&Arc<MemoryDriver>> {
        self.driver.as_ref()
    }

    pub fn driver_stats(&self) -> Option<DriverStats> {
        self.driver.as_ref().map(|driver| driver.stats())
    }

    pub fn worker_stats(&self) -> Option<WorkerPoolStats> {
        self.driver.as_ref().map(|driver| driver.workers().stats())
    }

    pub async fn transactional<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executor.transactional(body).await
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
        self.executor.transactional_with_timeout(timeout, body).await
    }

    pub async fn read_only<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executor.read_only(body).await
    }

    pub async fn read_only_with_timeout<F, Fut, T>(&self, timeout: TxTimeout, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executor.read_only_with_timeout(timeout, body).await
    }

    /// Declarative boundary
    pub async fn execute<F, Fut, T>(&self, definition: &TransactionDefinition, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.operator.execute(definition, body).await
    }
}
