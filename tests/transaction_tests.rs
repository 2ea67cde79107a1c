/// Transaction tests
///
/// Commit, rollback, participation and rollback-only behaviour of
/// programmatic transaction scopes.
/// Run with: cargo test --test transaction_tests

use serde_json::json;
use sessiontx::{
    Database, Result, SessionConfig, TxError, current_context_or_null, current_session_or_null,
};
use tokio_test::{assert_err, assert_ok};

fn open() -> Database {
    Database::open(SessionConfig::new().worker_count(2)).unwrap()
}

#[tokio::test]
async fn test_transactional_commit() {
    let db = open();
    let template = db.template().clone();

    db.transactional(|| async move {
        template.persist("user:1", json!({ "name": "Alice" })).await?;
        template.persist("user:2", json!({ "name": "Bob" })).await
    })
    .await
    .unwrap();

    let driver = db.driver().unwrap();
    assert_eq!(driver.committed("user:1").unwrap(), Some(json!({ "name": "Alice" })));
    assert_eq!(driver.committed_len().unwrap(), 2);

    let stats = db.driver_stats().unwrap();
    assert_eq!(stats.begun, 1);
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn test_transactional_rollback_on_error() {
    let db = open();
    let template = db.template().clone();

    let result: Result<()> = db
        .transactional(|| async move {
            template.persist("user:1", json!("Alice")).await?;
            Err(anyhow::anyhow!("insufficient funds").into())
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(err, TxError::Application(_)));
    assert_eq!(err.to_string(), "insufficient funds");
    assert_eq!(db.driver().unwrap().committed("user:1").unwrap(), None);

    let stats = db.driver_stats().unwrap();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn test_writes_visible_inside_scope_only_until_commit() {
    let db = open();
    let template = db.template().clone();
    let driver = db.driver().unwrap().clone();

    db.transactional(|| async move {
        template.persist("k", json!(1)).await?;
        assert_eq!(template.find("k").await?, Some(json!(1)));
        assert_eq!(driver.committed("k")?, None);
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(db.driver().unwrap().committed("k").unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_nested_call_reuses_same_session() {
    let db = open();
    let inner = db.executor().clone();

    let (outer_session, inner_session, same_context) = db
        .transactional(|| async move {
            let outer_session = current_session_or_null().ok_or(TxError::NoTransaction)?;
            let outer_context = current_context_or_null().ok_or(TxError::NoTransaction)?;

            let (inner_session, inner_context) = inner
                .transactional(|| async {
                    Ok((
                        current_session_or_null().ok_or(TxError::NoTransaction)?,
                        current_context_or_null().ok_or(TxError::NoTransaction)?,
                    ))
                })
                .await?;

            let same_context = std::sync::Arc::ptr_eq(&outer_context, &inner_context);
            Ok((outer_session, inner_session, same_context))
        })
        .await
        .unwrap();

    assert!(outer_session.same_session(&inner_session));
    assert!(same_context);
    assert_eq!(db.driver_stats().unwrap().opened, 1);
}

#[tokio::test]
async fn test_separate_scopes_use_separate_sessions() {
    let db = open();

    let first = db
        .transactional(|| async { current_session_or_null().ok_or(TxError::NoTransaction) })
        .await
        .unwrap();
    let second = db
        .transactional(|| async { current_session_or_null().ok_or(TxError::NoTransaction) })
        .await
        .unwrap();

    assert!(!first.same_session(&second));
    assert_eq!(db.driver_stats().unwrap().opened, 2);
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    let db = open();
    let template = db.template().clone();

    let result = db
        .read_only(|| async move {
            let context = current_context_or_null().ok_or(TxError::NoTransaction)?;
            assert!(context.is_read_only());
            template.persist("forbidden", json!(true)).await
        })
        .await;

    match result {
        Err(TxError::ReadOnlyViolation { operation }) => assert_eq!(operation, "persist"),
        other => panic!("expected ReadOnlyViolation, got {:?}", other),
    }
    assert_eq!(db.driver().unwrap().committed_len().unwrap(), 0);
}

#[tokio::test]
async fn test_read_only_allows_reads() {
    let db = open();
    assert_ok!(db.template().persist("k", json!("v")).await);

    let template = db.template().clone();
    let value = db
        .read_only(|| async move { template.find("k").await })
        .await
        .unwrap();
    assert_eq!(value, Some(json!("v")));
}

#[tokio::test]
async fn test_read_only_participant_inherits_outer_mode() {
    let db = open();
    let template = db.template().clone();
    let inner = db.executor().clone();

    // Participation reuses the outer READ_WRITE context, so the write succeeds.
    db.transactional(|| async move {
        inner
            .read_only(|| async { template.persist("k", json!(1)).await })
            .await
    })
    .await
    .unwrap();

    assert_eq!(db.driver().unwrap().committed("k").unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_caught_inner_failure_still_fails_outer_commit() {
    let db = open();
    let template = db.template().clone();
    let inner = db.executor().clone();

    let result = db
        .transactional(|| async move {
            template.persist("outer", json!(1)).await?;

            let caught: Result<()> = inner
                .transactional(|| async {
                    template.persist("inner", json!(2)).await?;
                    Err(anyhow::anyhow!("inner failure").into())
                })
                .await;
            assert!(caught.is_err());

            template.persist("after", json!(3)).await
        })
        .await;

    assert!(matches!(result, Err(TxError::UnexpectedRollback(_))));

    let driver = db.driver().unwrap();
    assert_eq!(driver.committed("outer").unwrap(), None);
    assert_eq!(driver.committed("inner").unwrap(), None);
    assert_eq!(driver.committed("after").unwrap(), None);

    let stats = db.driver_stats().unwrap();
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn test_explicit_set_rollback_only() {
    let db = open();
    let template = db.template().clone();

    let result = db
        .transactional(|| async move {
            template.persist("k", json!(1)).await?;
            let context = current_context_or_null().ok_or(TxError::NoTransaction)?;
            context.set_rollback_only();
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(TxError::UnexpectedRollback(_))));
    assert_eq!(db.driver().unwrap().committed("k").unwrap(), None);
}

#[tokio::test]
async fn test_no_context_outside_scope() {
    let db = open();
    assert!(current_context_or_null().is_none());
    db.transactional(|| async { Ok(()) }).await.unwrap();
    assert!(current_session_or_null().is_none());
}

#[tokio::test]
async fn test_direct_driver_call_off_worker_is_rejected() {
    let db = open();

    let err = db
        .transactional(|| async {
            let session = current_session_or_null().ok_or(TxError::NoTransaction)?;
            // Bypasses dispatch: runs on the test runtime, not the owning worker.
            session.session().begin_transaction().await
        })
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, TxError::ExecutionContextAffinity { .. }));
    assert_eq!(db.driver_stats().unwrap().open_sessions(), 0);
}

#[tokio::test]
async fn test_two_databases_keep_their_sessions_apart() {
    let orders = open();
    let audit = open();
    let order_template = orders.template().clone();
    let audit_template = audit.template().clone();
    let audit_db = &audit;

    let result: Result<()> = orders
        .transactional(|| async move {
            order_template.persist("order:1", json!("placed")).await?;
            audit_db
                .transactional(|| async {
                    audit_template.persist("audit:1", json!("order placed")).await
                })
                .await?;
            Err(anyhow::anyhow!("payment declined").into())
        })
        .await;
    assert_err!(result);

    // The audit scope committed on its own session; the order scope rolled back.
    assert_eq!(orders.driver().unwrap().committed("order:1").unwrap(), None);
    assert_eq!(orders.driver().unwrap().committed("audit:1").unwrap(), None);
    assert_eq!(
        audit.driver().unwrap().committed("audit:1").unwrap(),
        Some(json!("order placed"))
    );
    assert_eq!(orders.driver_stats().unwrap().opened, 1);
    assert_eq!(audit.driver_stats().unwrap().opened, 1);
}

#[tokio::test]
async fn test_template_of_other_database_does_not_use_ambient_session() {
    let first = open();
    let second = open();
    let second_template = second.template().clone();

    first
        .transactional(|| async move {
            // No scope of `second` is active, so this runs detached and commits at once.
            second_template.persist("k", json!(1)).await
        })
        .await
        .unwrap();

    assert_eq!(first.driver().unwrap().committed_len().unwrap(), 0);
    assert_eq!(second.driver().unwrap().committed("k").unwrap(), Some(json!(1)));
}
