use super::worker::{WorkerHandle, spawn_worker};
use crate::core::{Result, TxError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed set of workers handed out round-robin to new sessions.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(count: usize, name_prefix: &str) -> Result<Self> {
        if count == 0 {
            return Err(TxError::InvalidConfig(
                "worker pool needs at least one worker".into(),
            ));
        }

        let workers = (0..count)
            .map(|_| spawn_worker(name_prefix))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Worker for the next new session.
    pub fn next(&self) -> WorkerHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.workers.len(),
            dispatched: self.workers.iter().map(WorkerHandle::dispatched).sum(),
        }
    }
}

/// Worker pool statistics
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub dispatched: u64,
}

impl std::fmt::Display for WorkerPoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Worker Pool: {} workers, {} jobs dispatched",
            self.workers, self.dispatched
        )
    }
}
