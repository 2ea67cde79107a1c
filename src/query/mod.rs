// ============================================================================
// Query Template
// ============================================================================
//
// Issues data operations against the ambient session when a scope is active
// and against a short-lived session of its own otherwise. READ_ONLY scopes
// reject writes here, before anything reaches the driver.
//
// ============================================================================

use crate::connection::{Session, SessionFactory};
use crate::context::current_context_for;
use crate::core::{Result, TxError};
use log::{debug, warn};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionTemplate {
    factory: Arc<dyn SessionFactory>,
}

impl SessionTemplate {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }

    pub async fn persist(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.write("persist", move |session| async move {
            session.persist(&key, value).await
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.write("remove", move |session| async move { session.remove(&key).await })
            .await
    }

    pub async fn find(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.read(move |session| async move { session.find(&key).await })
            .await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.read(|session| async move { session.keys().await }).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.read(|session| async move { Ok(session.keys().await?.len()) })
            .await
    }

    async fn write<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        match current_context_for(&self.factory.key()) {
            Some(context) if context.is_read_only() => Err(TxError::ReadOnlyViolation {
                operation: operation.to_string(),
            }),
            Some(context) => context.session().dispatch(f).await,
            None => self.run_detached(f).await,
        }
    }

    async fn read<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        match current_context_for(&self.factory.key()) {
            Some(context) => context.session().dispatch(f).await,
            None => self.run_detached(f).await,
        }
    }

    /// One operation in its own session and transaction.
    async fn run_detached<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let handle = self.factory.open_session().await?;
        debug!("Running detached operation on {}", handle.id());

        let result = handle
            .dispatch(|session| async move {
                session.begin_transaction().await?;
                match f(Arc::clone(&session)).await {
                    Ok(value) => {
                        session.flush().await?;
                        session.commit().await?;
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = session.rollback().await {
                            warn!("Rollback of {} failed: {}", session.id(), rollback_err);
                        }
                        Err(err)
                    }
                }
            })
            .await;

        if let Err(err) = handle.close().await {
            warn!("Failed to close {}: {}", handle.id(), err);
        }
        result
    }
}
