// ============================================================================
// In-Memory Driver
// ============================================================================
//
// Reference driver used by the facade and the test-suite. Committed state is
// a shared ordered map; each session keeps two change sets:
//
//   pending  - tracked by persist/remove, not yet flushed
//   flushed  - pushed by flush(), visible to the session, applied on commit
//
// Commit applies `flushed` atomically and discards anything still pending,
// so the transaction manager always flushes before committing.
//
// ============================================================================

use super::pool::WorkerPool;
use super::worker::WorkerId;
use super::{Session, SessionFactory, SessionHandle, ensure_affinity};
use crate::core::{FactoryKey, Result, SessionId, TxError};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

type ChangeSet = BTreeMap<String, Option<Value>>;
type Store = Arc<RwLock<BTreeMap<String, Value>>>;

#[derive(Debug, Default)]
struct DriverCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    begun: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Driver statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub opened: u64,
    pub closed: u64,
    pub begun: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl DriverStats {
    pub fn open_sessions(&self) -> u64 {
        self.opened.saturating_sub(self.closed)
    }
}

impl std::fmt::Display for DriverStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Driver Stats: {} opened, {} closed, {} begun, {} commits, {} rollbacks",
            self.opened, self.closed, self.begun, self.commits, self.rollbacks
        )
    }
}

/// In-memory session factory
pub struct MemoryDriver {
    key: FactoryKey,
    workers: Arc<WorkerPool>,
    store: Store,
    latency: Option<Duration>,
    counters: Arc<DriverCounters>,
}

impl MemoryDriver {
    pub fn new(workers: Arc<WorkerPool>) -> Self {
        Self {
            key: FactoryKey::new(),
            workers,
            store: Arc::new(RwLock::new(BTreeMap::new())),
            latency: None,
            counters: Arc::new(DriverCounters::default()),
        }
    }

    /// Every driver round-trip sleeps for `latency` before doing its work.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Committed value for `key`, read outside any session.
    pub fn committed(&self, key: &str) -> Result<Option<Value>> {
        let store = self.store.read()?;
        Ok(store.get(key).cloned())
    }

    pub fn committed_len(&self) -> Result<usize> {
        Ok(self.store.read()?.len())
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            opened: self.counters.opened.load(Ordering::SeqCst),
            closed: self.counters.closed.load(Ordering::SeqCst),
            begun: self.counters.begun.load(Ordering::SeqCst),
            commits: self.counters.commits.load(Ordering::SeqCst),
            rollbacks: self.counters.rollbacks.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl SessionFactory for MemoryDriver {
    fn key(&self) -> FactoryKey {
        self.key
    }

    async fn open_session(&self) -> Result<SessionHandle> {
        let worker = self.workers.next();
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let latency = self.latency;

        let session = worker
            .run(move || async move {
                let owner = WorkerId::current().ok_or_else(|| {
                    TxError::driver("sessions can only be opened on a worker")
                })?;
                let session = MemorySession::new(owner, store, counters, latency);
                session.counters.opened.fetch_add(1, Ordering::SeqCst);
                debug!("Opened {} on {}", session.id, owner);
                Ok(Arc::new(session) as Arc<dyn Session>)
            })
            .await?;

        Ok(SessionHandle::new(session, worker))
    }
}

#[derive(Debug, Default)]
struct SessionState {
    open: bool,
    in_transaction: bool,
    pending: ChangeSet,
    flushed: ChangeSet,
}

/// Session of the in-memory driver
pub struct MemorySession {
    id: SessionId,
    owner: WorkerId,
    store: Store,
    counters: Arc<DriverCounters>,
    latency: Option<Duration>,
    state: Mutex<SessionState>,
}

impl MemorySession {
    fn new(
        owner: WorkerId,
        store: Store,
        counters: Arc<DriverCounters>,
        latency: Option<Duration>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            owner,
            store,
            counters,
            latency,
            state: Mutex::new(SessionState {
                open: true,
                ..SessionState::default()
            }),
        }
    }

    /// Affinity check plus simulated round-trip.
    async fn round_trip(&self) -> Result<()> {
        ensure_affinity(self.owner)?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn ensure_open(state: &SessionState) -> Result<()> {
        if !state.open {
            return Err(TxError::SessionClosed);
        }
        Ok(())
    }

    fn ensure_writable(state: &SessionState, operation: &str) -> Result<()> {
        Self::ensure_open(state)?;
        if !state.in_transaction {
            return Err(TxError::illegal_state(format!(
                "cannot {} outside a driver transaction",
                operation
            )));
        }
        Ok(())
    }

    fn track(&self, key: &str, value: Option<Value>, operation: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        Self::ensure_writable(&state, operation)?;
        state.pending.insert(key.to_string(), value);
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<Option<Value>> {
        let state = self.state.lock()?;
        Self::ensure_open(&state)?;

        if let Some(change) = state.pending.get(key).or_else(|| state.flushed.get(key)) {
            return Ok(change.clone());
        }

        let store = self.store.read()?;
        Ok(store.get(key).cloned())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn worker_id(&self) -> WorkerId {
        self.owner
    }

    fn is_open(&self) -> bool {
        self.state.lock().map(|state| state.open).unwrap_or(false)
    }

    fn in_transaction(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.in_transaction)
            .unwrap_or(false)
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.state.lock()?;
        Self::ensure_open(&state)?;
        if state.in_transaction {
            return Err(TxError::illegal_state(format!(
                "{} already has an active transaction",
                self.id
            )));
        }
        state.in_transaction = true;
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.state.lock()?;
        Self::ensure_open(&state)?;
        let pending = std::mem::take(&mut state.pending);
        state.flushed.extend(pending);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.state.lock()?;
        Self::ensure_open(&state)?;
        if !state.in_transaction {
            return Err(TxError::illegal_state(format!(
                "{} has no active transaction to commit",
                self.id
            )));
        }

        let flushed = std::mem::take(&mut state.flushed);
        state.pending.clear();
        state.in_transaction = false;

        let mut store = self.store.write()?;
        for (key, change) in flushed {
            match change {
                Some(value) => {
                    store.insert(key, value);
                }
                None => {
                    store.remove(&key);
                }
            }
        }
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.state.lock()?;
        Self::ensure_open(&state)?;
        state.pending.clear();
        state.flushed.clear();
        if state.in_transaction {
            state.in_transaction = false;
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.round_trip().await?;
        let mut state = self.state.lock()?;
        Self::ensure_open(&state)?;
        if state.in_transaction {
            state.pending.clear();
            state.flushed.clear();
            state.in_transaction = false;
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        state.open = false;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        debug!("Closed {}", self.id);
        Ok(())
    }

    async fn persist(&self, key: &str, value: Value) -> Result<()> {
        self.round_trip().await?;
        self.track(key, Some(value), "persist")
    }

    async fn find(&self, key: &str) -> Result<Option<Value>> {
        self.round_trip().await?;
        self.lookup(key)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.round_trip().await?;
        let existed = self.lookup(key)?.is_some();
        self.track(key, None, "remove")?;
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.round_trip().await?;
        let state = self.state.lock()?;
        Self::ensure_open(&state)?;

        let store = self.store.read()?;
        let mut visible: BTreeMap<&str, bool> =
            store.keys().map(|key| (key.as_str(), true)).collect();
        for (key, change) in state.flushed.iter().chain(state.pending.iter()) {
            visible.insert(key.as_str(), change.is_some());
        }

        Ok(visible
            .into_iter()
            .filter(|(_, present)| *present)
            .map(|(key, _)| key.to_string())
            .collect())
    }
}
