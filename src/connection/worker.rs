// ============================================================================
// Execution Contexts
// ============================================================================
//
// A worker is a dedicated OS thread driving a single-threaded tokio runtime.
// Sessions are opened on a worker and every later call against that session
// is shipped back to the same worker through `WorkerHandle::run`.
//
// ============================================================================

use crate::core::{Result, TxError};
use futures::future::LocalBoxFuture;
use log::{debug, warn};
use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Unique identifier for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Id of the worker whose thread is running the caller, `None` off-worker.
    pub fn current() -> Option<WorkerId> {
        CURRENT_WORKER.with(|current| current.get())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

/// Cloneable handle used to ship work onto one specific worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job>,
    dispatched: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the caller is already running on this worker.
    pub fn is_current(&self) -> bool {
        WorkerId::current() == Some(self.id)
    }

    /// Number of jobs shipped to this worker so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Run `f` on this worker and await its result.
    ///
    /// The closure is sent across threads, the future it builds is not: it
    /// is polled only by the worker's local executor.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply_tx.send(f().await);
            })
        });

        self.sender
            .send(job)
            .map_err(|_| TxError::WorkerUnavailable(format!("{} has shut down", self.name)))?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        reply_rx
            .await
            .map_err(|_| TxError::WorkerUnavailable(format!("{} dropped the job", self.name)))?
    }

    /// Queue `f` on this worker without waiting for it.
    ///
    /// Usable from synchronous code such as `Drop` impls.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let job: Job = Box::new(move || Box::pin(f()));
        self.sender
            .send(job)
            .map_err(|_| TxError::WorkerUnavailable(format!("{} has shut down", self.name)))?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Spawns a dedicated worker thread and returns a handle to it.
///
/// The thread exits once every handle (and therefore every sender) is gone.
pub fn spawn_worker(name: &str) -> Result<WorkerHandle> {
    let id = WorkerId::next();
    let name: Arc<str> = Arc::from(format!("{}-{}", name, id.as_u64()));
    let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!("{} failed to build its runtime: {}", thread_name, err);
                    return;
                }
            };

            CURRENT_WORKER.with(|current| current.set(Some(id)));
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                while let Some(job) = receiver.recv().await {
                    tokio::task::spawn_local(job());
                }
            });
            debug!("{} stopped", thread_name);
        })
        .map_err(|err| TxError::WorkerUnavailable(format!("failed to spawn {}: {}", name, err)))?;

    debug!("{} started", name);
    Ok(WorkerHandle {
        id,
        name,
        sender,
        dispatched: Arc::new(AtomicU64::new(0)),
    })
}
