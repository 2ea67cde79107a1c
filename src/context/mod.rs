// ============================================================================
// Ambient Session Context
// ============================================================================
//
// The context of the enclosing transaction scope travels with the logical
// call chain through a task-local slot. A scope either reuses the exact
// `Arc<SessionContext>` of its parent (participation) or installs a new one
// (new transaction); an installed context is never mutated.
//
// ============================================================================

use crate::connection::SessionHandle;
use crate::core::{AccessMode, FactoryKey, Result, TxError, TxTimeout};
use crate::transaction::{ResourceRegistry, SessionResourceHolder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

tokio::task_local! {
    static CURRENT_CONTEXT: Option<Arc<SessionContext>>;
}

/// Immutable view of a live session scope.
#[derive(Debug)]
pub struct SessionContext {
    holder: Arc<SessionResourceHolder>,
    mode: AccessMode,
    timeout: TxTimeout,
    started_at: Instant,
}

impl SessionContext {
    pub fn new(holder: Arc<SessionResourceHolder>, mode: AccessMode, timeout: TxTimeout) -> Self {
        Self {
            holder,
            mode,
            timeout,
            started_at: Instant::now(),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        self.holder.session()
    }

    pub fn holder(&self) -> &Arc<SessionResourceHolder> {
        &self.holder
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode.is_read_only()
    }

    pub fn timeout(&self) -> TxTimeout {
        self.timeout
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Budget left for this scope, never negative.
    pub fn remaining_timeout(&self) -> TxTimeout {
        self.timeout.remaining_after(self.elapsed())
    }

    /// Marks the shared transaction so that its eventual commit fails.
    pub fn set_rollback_only(&self) {
        self.holder.set_rollback_only();
    }

    /// Budget a nested scope gets when it asks for `requested` under `parent`.
    ///
    /// The tighter of the request and the parent's remaining budget wins.
    pub fn effective_timeout(parent: Option<&SessionContext>, requested: TxTimeout) -> TxTimeout {
        match parent {
            None => requested,
            Some(parent) => requested.tightest(parent.remaining_timeout()),
        }
    }

    /// Runs `future` with `context` installed as the ambient context.
    pub async fn scope<F>(context: Option<Arc<SessionContext>>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_CONTEXT.scope(context, future).await
    }
}

/// Nearest enclosing context of the calling chain, if any.
pub fn current_context_or_null() -> Option<Arc<SessionContext>> {
    CURRENT_CONTEXT
        .try_with(|context| context.clone())
        .ok()
        .flatten()
}

/// Nearest enclosing context whose session was opened by the factory `key`.
///
/// Contexts of other factories are skipped, so one chain can run scopes of
/// several databases without their sessions leaking into each other.
pub fn current_context_for(key: &FactoryKey) -> Option<Arc<SessionContext>> {
    let context = current_context_or_null()?;
    let bound = ResourceRegistry::current()?.get(key).ok().flatten()?;
    Arc::ptr_eq(&bound, context.holder()).then_some(context)
}

/// Session of the nearest enclosing context, if any.
pub fn current_session_or_null() -> Option<SessionHandle> {
    current_context_or_null().map(|context| context.session().clone())
}

/// Carries the caller's ambient context and registry into `future`, so it
/// keeps participating after being handed to `tokio::spawn`.
pub fn propagate<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let context = current_context_or_null();
    let registry = ResourceRegistry::current();
    async move {
        match registry {
            Some(registry) => registry.scope(SessionContext::scope(context, future)).await,
            None => SessionContext::scope(context, future).await,
        }
    }
}

/// Polls `future` for at most `budget`, mapping expiry to `TxError::Timeout`.
pub(crate) async fn run_with_budget<F, T>(budget: TxTimeout, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match budget.as_duration() {
        None => future.await,
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::event!(tracing::Level::WARN, budget = ?duration, "scope timed out");
                Err(TxError::Timeout { budget: duration })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SessionFactory;
    use crate::connection::memory::MemoryDriver;
    use crate::connection::pool::WorkerPool;

    async fn holder() -> Arc<SessionResourceHolder> {
        let workers = Arc::new(WorkerPool::new(1, "context-test").unwrap());
        let driver = MemoryDriver::new(workers);
        let session = driver.open_session().await.unwrap();
        Arc::new(SessionResourceHolder::new(
            session,
            AccessMode::ReadWrite,
            TxTimeout::Unbounded,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_timeout_decreases_and_clamps() {
        let context = SessionContext::new(holder().await, AccessMode::ReadWrite, TxTimeout::seconds(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(context.remaining_timeout(), TxTimeout::seconds(6));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(context.remaining_timeout(), TxTimeout::seconds(1));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            context.remaining_timeout(),
            TxTimeout::Bounded(Duration::ZERO)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_context_never_expires() {
        let context = SessionContext::new(holder().await, AccessMode::ReadOnly, TxTimeout::Unbounded);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(context.remaining_timeout(), TxTimeout::Unbounded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_effective_timeout_nesting() {
        let holder = holder().await;
        let bounded = SessionContext::new(holder.clone(), AccessMode::ReadWrite, TxTimeout::seconds(10));
        let unbounded = SessionContext::new(holder, AccessMode::ReadWrite, TxTimeout::Unbounded);

        tokio::time::advance(Duration::from_secs(5)).await;

        // Unbounded child under a bounded parent keeps the parent's remaining budget.
        assert_eq!(
            SessionContext::effective_timeout(Some(&bounded), TxTimeout::Unbounded),
            TxTimeout::seconds(5)
        );
        // Bounded child under an unbounded parent keeps its own budget.
        assert_eq!(
            SessionContext::effective_timeout(Some(&unbounded), TxTimeout::seconds(10)),
            TxTimeout::seconds(10)
        );
        // Tighter of the two always wins.
        assert_eq!(
            SessionContext::effective_timeout(Some(&bounded), TxTimeout::seconds(3)),
            TxTimeout::seconds(3)
        );
        assert_eq!(
            SessionContext::effective_timeout(Some(&bounded), TxTimeout::seconds(7)),
            TxTimeout::seconds(5)
        );
        assert_eq!(
            SessionContext::effective_timeout(None, TxTimeout::seconds(7)),
            TxTimeout::seconds(7)
        );
    }

    #[tokio::test]
    async fn test_ambient_lookup() {
        assert!(current_context_or_null().is_none());
        assert!(current_session_or_null().is_none());

        let context = Arc::new(SessionContext::new(
            holder().await,
            AccessMode::ReadWrite,
            TxTimeout::Unbounded,
        ));
        let expected = context.clone();

        SessionContext::scope(Some(context), async move {
            let current = current_context_or_null().unwrap();
            assert!(Arc::ptr_eq(&current, &expected));
            assert!(current_session_or_null().unwrap().same_session(expected.session()));

            // A `None` scope hides the enclosing context.
            SessionContext::scope(None, async {
                assert!(current_context_or_null().is_none());
            })
            .await;
        })
        .await;

        assert!(current_context_or_null().is_none());
    }

    #[tokio::test]
    async fn test_context_for_matches_bound_factory_only() {
        let workers = Arc::new(WorkerPool::new(1, "context-test").unwrap());
        let ours = MemoryDriver::new(workers.clone());
        let theirs = MemoryDriver::new(workers);
        let holder = Arc::new(SessionResourceHolder::new(
            ours.open_session().await.unwrap(),
            AccessMode::ReadWrite,
            TxTimeout::Unbounded,
        ));
        let registry = ResourceRegistry::new();
        registry.bind(ours.key(), holder.clone()).unwrap();
        let context = Arc::new(SessionContext::new(holder, AccessMode::ReadWrite, TxTimeout::Unbounded));

        let (mine, foreign) = registry
            .scope(SessionContext::scope(Some(context), async {
                (
                    current_context_for(&ours.key()).is_some(),
                    current_context_for(&theirs.key()).is_some(),
                )
            }))
            .await;

        assert!(mine);
        assert!(!foreign);
    }

    #[tokio::test]
    async fn test_propagate_into_spawned_task() {
        let context = Arc::new(SessionContext::new(
            holder().await,
            AccessMode::ReadOnly,
            TxTimeout::Unbounded,
        ));
        let expected = context.clone();

        let seen = SessionContext::scope(Some(context), async {
            let detached = tokio::spawn(async { current_context_or_null().is_some() });
            let propagated = tokio::spawn(propagate(async { current_context_or_null() }));
            (detached.await.unwrap(), propagated.await.unwrap())
        })
        .await;

        assert!(!seen.0);
        assert!(Arc::ptr_eq(&seen.1.unwrap(), &expected));
    }

    #[tokio::test]
    async fn test_run_with_budget_times_out() {
        let result: Result<()> = run_with_budget(TxTimeout::millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TxError::Timeout { .. })));

        let result = run_with_budget(TxTimeout::Unbounded, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
