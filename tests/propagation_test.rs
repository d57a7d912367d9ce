//! Integration tests for propagation behavior on the in-memory backend.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tx_router::db::{MemoryDatabase, MemoryTransactionManager};
use tx_router::models::{CompletionStatus, Isolation, Propagation, Side, TransactionConfiguration};
use tx_router::{TransactionService, TxError};

const ITEMS: &str = "items";

fn setup() -> (Arc<MemoryDatabase>, TransactionService<MemoryTransactionManager>) {
    let db = MemoryDatabase::new();
    let write = Arc::new(MemoryTransactionManager::new("write", db.clone()));
    let read = Arc::new(MemoryTransactionManager::new("read", db.clone()));
    (db, TransactionService::new(write, read))
}

fn config(propagation: Propagation) -> TransactionConfiguration {
    TransactionConfiguration::new(propagation, Isolation::Default)
}

#[tokio::test]
async fn test_required_commits_on_success() {
    let (db, service) = setup();

    let result = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "commit-test")?;
                Ok(())
            })
        })
        .await;

    assert_ok!(result);
    assert_eq!(db.committed_rows(ITEMS), vec!["commit-test"]);
    assert_eq!(service.write_manager().transactions_started(), 1);
}

#[tokio::test]
async fn test_required_rolls_back_on_failure() {
    let (db, service) = setup();

    let result: Result<(), TxError> = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "rollback-test")?;
                Err(TxError::aborted("simulated failure"))
            })
        })
        .await;

    let err = assert_err!(result);
    assert!(err.to_string().contains("simulated failure"));
    assert_eq!(db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_requires_new_commits_independently_of_outer_rollback() {
    let (db, service) = setup();

    let result: Result<(), TxError> = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                scope
                    .write(&config(Propagation::RequiresNew), |scope| {
                        Box::pin(async move {
                            // The suspended outer insert is not visible here
                            assert_eq!(scope.session().await?.count(ITEMS)?, 0);
                            scope.session().await?.insert(ITEMS, "inner")?;
                            Ok(())
                        })
                    })
                    .await?;
                // Outer transaction resumes after the inner one completes
                assert!(scope.is_transaction_active());
                assert_eq!(scope.depth(), 1);
                Err(TxError::aborted("outer fails"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(db.committed_rows(ITEMS), vec!["inner"]);
    assert_eq!(service.write_manager().transactions_started(), 2);
}

#[tokio::test]
async fn test_mandatory_without_transaction_fails_before_work() {
    let (db, service) = setup();
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = invoked.clone();
    let result = service
        .run_write(&config(Propagation::Mandatory), move |_scope| {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        })
        .await;

    let err = assert_err!(result);
    assert!(err.is_illegal_state());
    assert!(err.to_string().contains("mandatory"));
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(service.write_manager().transactions_started(), 0);
    assert_eq!(db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_mandatory_joins_existing_transaction() {
    let (db, service) = setup();

    let depth = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope
                    .write(&config(Propagation::Mandatory), |scope| {
                        Box::pin(async move {
                            scope.session().await?.insert(ITEMS, "joined")?;
                            Ok(scope.depth())
                        })
                    })
                    .await
            })
        })
        .await
        .unwrap();

    assert_eq!(depth, 2);
    assert_eq!(db.committed_rows(ITEMS), vec!["joined"]);
    assert_eq!(service.write_manager().transactions_started(), 1);
}

#[tokio::test]
async fn test_never_inside_transaction_fails_without_poisoning_outer() {
    let (db, service) = setup();

    let inner_err = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                let inner = scope
                    .write(&config(Propagation::Never), |_scope| {
                        Box::pin(async move { Ok(()) })
                    })
                    .await;
                Ok(inner.unwrap_err())
            })
        })
        .await
        .unwrap();

    assert!(inner_err.is_illegal_state());
    assert!(inner_err.to_string().contains("never"));
    assert_eq!(db.committed_rows(ITEMS), vec!["outer"]);
}

#[tokio::test]
async fn test_never_without_transaction_runs_non_transactionally() {
    let (_db, service) = setup();

    let active = service
        .run_write(&config(Propagation::Never), |scope| {
            Box::pin(async move { Ok(scope.is_transaction_active()) })
        })
        .await
        .unwrap();

    assert!(!active);
    assert_eq!(service.write_manager().transactions_started(), 0);
}

#[tokio::test]
async fn test_nested_failure_rolls_back_to_savepoint_only() {
    let (db, service) = setup();

    service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                let nested: Result<(), TxError> = scope
                    .write(&config(Propagation::Nested), |scope| {
                        Box::pin(async move {
                            scope.session().await?.insert(ITEMS, "nested")?;
                            Err(TxError::aborted("nested fails"))
                        })
                    })
                    .await;
                assert!(nested.is_err());
                // The savepoint rollback keeps the outer work intact
                assert!(!scope.is_rollback_only());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.committed_rows(ITEMS), vec!["outer"]);
    assert_eq!(service.write_manager().transactions_started(), 1);
}

#[tokio::test]
async fn test_participant_failure_inside_nested_stays_in_the_savepoint() {
    let (db, service) = setup();

    service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                let nested: Result<(), TxError> = scope
                    .write(&config(Propagation::Nested), |scope| {
                        Box::pin(async move {
                            scope.session().await?.insert(ITEMS, "nested")?;
                            scope
                                .write(&config(Propagation::Required), |scope| {
                                    Box::pin(async move {
                                        scope.session().await?.insert(ITEMS, "joined")?;
                                        Err(TxError::aborted("participant fails"))
                                    })
                                })
                                .await
                        })
                    })
                    .await;
                assert_err!(nested);
                assert!(!scope.is_rollback_only());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.committed_rows(ITEMS), vec!["outer"]);
}

#[tokio::test]
async fn test_swallowed_participant_failure_inside_nested_still_marks_outer() {
    let (db, service) = setup();

    let result = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                scope
                    .write(&config(Propagation::Nested), |scope| {
                        Box::pin(async move {
                            let joined: Result<(), TxError> = scope
                                .write(&config(Propagation::Required), |_scope| {
                                    Box::pin(async move { Err(TxError::aborted("participant fails")) })
                                })
                                .await;
                            assert!(joined.is_err());
                            // Savepoint is released, so the mark reaches the owner
                            Ok(())
                        })
                    })
                    .await?;
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(TxError::UnexpectedRollback { .. })));
    assert_eq!(db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_nested_success_is_part_of_outer_commit() {
    let (db, service) = setup();

    service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                scope
                    .write(&config(Propagation::Nested), |scope| {
                        Box::pin(async move {
                            scope.session().await?.insert(ITEMS, "nested")?;
                            Ok(())
                        })
                    })
                    .await?;
                assert_eq!(db_rows_in_scope(scope).await?, 2);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.committed_rows(ITEMS), vec!["outer", "nested"]);
}

async fn db_rows_in_scope(
    scope: &mut tx_router::TxScope<MemoryTransactionManager>,
) -> Result<usize, TxError> {
    scope.session().await?.count(ITEMS)
}

#[tokio::test]
async fn test_nested_without_transaction_begins_one() {
    let (_db, service) = setup();

    let active = service
        .run_write(&config(Propagation::Nested), |scope| {
            Box::pin(async move { Ok(scope.is_transaction_active()) })
        })
        .await
        .unwrap();

    assert!(active);
    assert_eq!(service.write_manager().transactions_started(), 1);
}

#[tokio::test]
async fn test_supports_without_transaction_auto_commits() {
    let (db, service) = setup();

    let result: Result<(), TxError> = service
        .run_write(&config(Propagation::Supports), |scope| {
            Box::pin(async move {
                assert!(!scope.is_transaction_active());
                scope.session().await?.insert(ITEMS, "auto")?;
                Err(TxError::aborted("too late to roll back"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(db.committed_rows(ITEMS), vec!["auto"]);
    assert_eq!(service.write_manager().transactions_started(), 0);
}

#[tokio::test]
async fn test_supports_joins_existing_transaction() {
    let (_db, service) = setup();

    let (active, propagation) = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope
                    .write(&config(Propagation::Supports), |scope| {
                        Box::pin(async move {
                            Ok((scope.is_transaction_active(), scope.current_propagation()))
                        })
                    })
                    .await
            })
        })
        .await
        .unwrap();

    assert!(active);
    assert_eq!(propagation, Some(Propagation::Supports));
}

#[tokio::test]
async fn test_not_supported_suspends_and_resumes_outer() {
    let (db, service) = setup();

    let result: Result<(), TxError> = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                scope
                    .write(&config(Propagation::NotSupported), |scope| {
                        Box::pin(async move {
                            assert!(!scope.is_transaction_active());
                            let session = scope.session().await?;
                            assert_eq!(session.count(ITEMS)?, 0);
                            session.insert(ITEMS, "side-effect")?;
                            Ok(())
                        })
                    })
                    .await?;
                assert!(scope.is_transaction_active());
                assert_eq!(scope.session().await?.count(ITEMS)?, 2);
                Err(TxError::aborted("outer fails"))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(db.committed_rows(ITEMS), vec!["side-effect"]);
}

#[tokio::test]
async fn test_failed_participant_forces_unexpected_rollback() {
    let (db, service) = setup();

    let result = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                let joined: Result<(), TxError> = scope
                    .write(&config(Propagation::Required), |_scope| {
                        Box::pin(async move { Err(TxError::aborted("participant fails")) })
                    })
                    .await;
                assert!(joined.is_err());
                assert!(scope.is_rollback_only());
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(TxError::UnexpectedRollback { .. })));
    assert_eq!(db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_set_rollback_only_on_owner_rolls_back_silently() {
    let (db, service) = setup();

    let value = service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "discarded")?;
                scope.set_rollback_only();
                Ok(42)
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_completion_callbacks_observe_outcome() {
    let (_db, service) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    service
        .run_write(&config(Propagation::Required), move |scope| {
            Box::pin(async move {
                let outer = sink.clone();
                scope.on_completion(move |status| outer.lock().push(("outer", status)))?;
                let joined = sink.clone();
                scope
                    .write(&config(Propagation::Required), move |scope| {
                        Box::pin(async move {
                            scope.on_completion(move |status| joined.lock().push(("joined", status)))?;
                            // A panicking callback does not affect the outcome
                            scope.on_completion(|_| panic!("callback failure"))?;
                            Ok(())
                        })
                    })
                    .await?;
                // Participant callbacks wait for the owning transaction
                assert!(sink.lock().is_empty());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            ("outer", CompletionStatus::Committed),
            ("joined", CompletionStatus::Committed)
        ]
    );

    let sink = events.clone();
    let _ = service
        .run_write(&config(Propagation::Required), move |scope| {
            Box::pin(async move {
                scope.on_completion(move |status| sink.lock().push(("failed", status)))?;
                Err::<(), _>(TxError::aborted("fail"))
            })
        })
        .await;

    assert_eq!(
        events.lock().last(),
        Some(&("failed", CompletionStatus::RolledBack))
    );
}

#[tokio::test]
async fn test_read_side_is_tracked_separately_from_write_side() {
    let (db, service) = setup();

    service
        .run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "written")?;
                let (read_only, side, insert_err) = scope
                    .read(&config(Propagation::Required), |scope| {
                        Box::pin(async move {
                            let err = scope.session().await?.insert(ITEMS, "nope").unwrap_err();
                            Ok((scope.is_read_only(), scope.current_side(), err))
                        })
                    })
                    .await?;
                assert!(read_only);
                assert_eq!(side, Some(Side::Read));
                assert!(matches!(insert_err, TxError::ReadOnlyTransaction { .. }));
                assert!(scope.is_active_on(Side::Write));
                assert!(!scope.is_active_on(Side::Read));
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.committed_rows(ITEMS), vec!["written"]);
    assert_eq!(service.write_manager().transactions_started(), 1);
    assert_eq!(service.read_manager().transactions_started(), 1);
}

#[tokio::test]
async fn test_cancelled_call_rolls_back() {
    let (db, service) = setup();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        service.run_write(&config(Propagation::Required), |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "never-committed")?;
                std::future::pending::<()>().await;
                Ok(())
            })
        }),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(db.committed_count(ITEMS), 0);
}
