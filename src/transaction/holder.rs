// ============================================================================
// Session Resource Holder
// ============================================================================
//
// Owns one driver session for a call chain and remembers the worker it was
// opened on. Every driver call goes through `SessionHandle::dispatch`, so it
// runs on that worker no matter which thread asks.
//
// `rollback_only` is monotonic: once set it stays set for the holder's life.
//
// ============================================================================

use crate::connection::SessionHandle;
use crate::connection::worker::WorkerHandle;
use crate::core::{AccessMode, Result, TxTimeout};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct SessionResourceHolder {
    session: SessionHandle,
    mode: AccessMode,
    timeout: TxTimeout,
    transaction_active: AtomicBool,
    rollback_only: AtomicBool,
    synchronized: AtomicBool,
}

impl SessionResourceHolder {
    pub fn new(session: SessionHandle, mode: AccessMode, timeout: TxTimeout) -> Self {
        Self {
            session,
            mode,
            timeout,
            transaction_active: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Worker the session was opened on.
    pub fn worker(&self) -> &WorkerHandle {
        self.session.worker()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn timeout(&self) -> TxTimeout {
        self.timeout
    }

    pub fn is_transaction_active(&self) -> bool {
        self.transaction_active.load(Ordering::SeqCst)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn set_rollback_only(&self) {
        if !self.rollback_only.swap(true, Ordering::SeqCst) {
            debug!("{} marked rollback-only", self.session.id());
        }
    }

    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    pub fn set_synchronized_with_transaction(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::SeqCst);
    }

    /// Begins the driver transaction on the session's worker.
    pub async fn begin(&self) -> Result<()> {
        self.session.begin_transaction().await?;
        self.transaction_active.store(true, Ordering::SeqCst);
        debug!("Began transaction on {}", self.session.id());
        Ok(())
    }

    /// Flushes tracked changes and commits, as one job on the session's worker.
    pub async fn flush_and_commit(&self) -> Result<()> {
        let result = self
            .session
            .dispatch(|session| async move {
                session.flush().await?;
                session.commit().await
            })
            .await;
        self.transaction_active.store(false, Ordering::SeqCst);
        result?;
        debug!("Committed transaction on {}", self.session.id());
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let result = self.session.rollback().await;
        self.transaction_active.store(false, Ordering::SeqCst);
        result?;
        debug!("Rolled back transaction on {}", self.session.id());
        Ok(())
    }

    /// Closes the session. Called once, by the holder's creator.
    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }

    /// Queues rollback, and close when `close` is set, on the session's
    /// worker without waiting for either.
    ///
    /// Used when the scope that owns the transaction is dropped mid-flight.
    /// The rollback is queued even when `begin` has not returned yet, since
    /// a begin already shipped to the worker still runs ahead of it.
    pub fn abandon(&self, close: bool) {
        self.transaction_active.store(false, Ordering::SeqCst);
        debug!("Abandoning transaction on {}", self.session.id());
        let queued = self.session.spawn(move |session| async move {
            if let Err(err) = session.rollback().await {
                warn!("Rollback of abandoned {} failed: {}", session.id(), err);
            }
            if close {
                if let Err(err) = session.close().await {
                    warn!("Close of abandoned {} failed: {}", session.id(), err);
                }
            }
        });
        if let Err(err) = queued {
            warn!("Failed to release abandoned {}: {}", self.session.id(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SessionFactory;
    use crate::connection::memory::MemoryDriver;
    use crate::connection::pool::WorkerPool;
    use std::sync::Arc;

    async fn setup() -> (MemoryDriver, SessionResourceHolder) {
        let workers = Arc::new(WorkerPool::new(1, "holder-test").unwrap());
        let driver = MemoryDriver::new(workers);
        let session = driver.open_session().await.unwrap();
        let holder = SessionResourceHolder::new(session, AccessMode::ReadWrite, TxTimeout::Unbounded);
        (driver, holder)
    }

    #[tokio::test]
    async fn test_rollback_only_is_sticky() {
        let (_driver, holder) = setup().await;
        assert!(!holder.is_rollback_only());

        holder.set_rollback_only();
        holder.set_rollback_only();
        assert!(holder.is_rollback_only());
    }

    #[tokio::test]
    async fn test_lifecycle_flags() {
        let (driver, holder) = setup().await;
        assert!(!holder.is_transaction_active());

        holder.begin().await.unwrap();
        assert!(holder.is_transaction_active());

        holder.flush_and_commit().await.unwrap();
        assert!(!holder.is_transaction_active());

        holder.close().await.unwrap();
        let stats = driver.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_abandon_rolls_back_and_closes_in_background() {
        let (driver, holder) = setup().await;
        holder.begin().await.unwrap();

        holder.abandon(true);
        assert!(!holder.is_transaction_active());

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
    async fn test_driver_calls_run_on_captured_worker() {
        let (_driver, holder) = setup().await;
        assert_eq!(holder.worker().id(), holder.session().session().worker_id());

        // Dispatched from the test runtime, executed on the holder's worker.
        holder.begin().await.unwrap();
        holder.rollback().await.unwrap();
        assert!(!holder.is_transaction_active());
    }
}
