pub mod config;
pub mod memory;
pub mod pool;
pub mod worker;

use crate::core::{FactoryKey, Result, SessionId, TxError};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use worker::{WorkerHandle, WorkerId};

/// Driver session
///
/// Stateful handle to one database connection plus its tracked changes.
/// Every method must be called on the worker the session was opened on;
/// implementations reject foreign callers with `ExecutionContextAffinity`.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Worker the session was opened on
    fn worker_id(&self) -> WorkerId;

    fn is_open(&self) -> bool;

    fn in_transaction(&self) -> bool;

    async fn begin_transaction(&self) -> Result<()>;

    /// Push tracked changes to the database inside the current transaction
    async fn flush(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn persist(&self, key: &str, value: Value) -> Result<()>;

    async fn find(&self, key: &str) -> Result<Option<Value>>;

    async fn remove(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;
}

/// Source of driver sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Stable identity used as the resource registry key
    fn key(&self) -> FactoryKey;

    /// Open a session on a freshly picked worker.
    ///
    /// The returned handle carries the worker so later calls can be routed
    /// back onto it.
    async fn open_session(&self) -> Result<SessionHandle>;
}

/// Fails unless the caller runs on `owner`.
pub fn ensure_affinity(owner: WorkerId) -> Result<()> {
    match WorkerId::current() {
        Some(current) if current == owner => Ok(()),
        Some(current) => Err(TxError::ExecutionContextAffinity {
            expected: owner.to_string(),
            actual: current.to_string(),
        }),
        None => Err(TxError::ExecutionContextAffinity {
            expected: owner.to_string(),
            actual: format!("{:?}", std::thread::current().name().unwrap_or("unnamed thread")),
        }),
    }
}

/// A session paired with the worker it lives on.
///
/// Dispatched calls against one session run strictly one after another, in
/// submission order, even when the caller that submitted one has gone away.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<dyn Session>,
    worker: WorkerHandle,
    sequencer: Arc<tokio::sync::Mutex<()>>,
}

impl SessionHandle {
    pub fn new(session: Arc<dyn Session>, worker: WorkerHandle) -> Self {
        Self {
            session,
            worker,
            sequencer: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Direct access to the session. Only safe to call driver methods on it
    /// from inside `dispatch`.
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Identity comparison: true when both handles point at one session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.session), Arc::as_ptr(&other.session))
    }

    /// Run `f` against the session on its own worker.
    ///
    /// `f` must not dispatch onto the same session again.
    pub async fn dispatch<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let sequencer = Arc::clone(&self.sequencer);
        self.worker
            .run(move || async move {
                let _turn = sequencer.lock().await;
                f(session).await
            })
            .await
    }

    /// Like `dispatch`, but returns once the job is queued. The job still
    /// waits for its turn behind calls already submitted to this session.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let session = Arc::clone(&self.session);
        let sequencer = Arc::clone(&self.sequencer);
        self.worker.spawn(move || async move {
            let _turn = sequencer.lock().await;
            f(session).await
        })
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.dispatch(|session| async move { session.begin_transaction().await })
            .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.dispatch(|session| async move { session.flush().await }).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.dispatch(|session| async move { session.commit().await }).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.dispatch(|session| async move { session.rollback().await })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.dispatch(|session| async move { session.close().await }).await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session.id())
            .field("worker", &self.worker.id())
            .finish()
    }
}
