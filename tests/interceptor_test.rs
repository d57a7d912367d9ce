//! Integration tests for the interception pipeline.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_test::{assert_err, assert_ok};
use tx_router::db::{
    MemoryDatabase, MemoryTransactionManager, READ_KEY, WRITE_KEY, current_routing_key,
};
use tx_router::models::{Isolation, LogLevel, Propagation, Side};
use tx_router::{
    CallSite, Declaration, MetricsRegistry, OperationTable, TransactionService, TxError,
    TxInterceptor, TxSettings,
};

const ITEMS: &str = "items";
const SAVE: CallSite = CallSite::new("ItemService", "save");
const LIST: CallSite = CallSite::new("ItemService", "list");
const FIND: CallSite = CallSite::new("ItemRepository", "find");
const STORE: CallSite = CallSite::new("ItemRepository", "store");
const ARCHIVE: CallSite = CallSite::new("ItemRepository", "archive");
const UNDECLARED: CallSite = CallSite::new("ItemRepository", "undeclared");

struct Fixture {
    db: Arc<MemoryDatabase>,
    registry: Arc<MetricsRegistry>,
    interceptor: TxInterceptor<MemoryTransactionManager>,
}

fn setup() -> Fixture {
    let db = MemoryDatabase::new();
    let write = Arc::new(MemoryTransactionManager::new("write", db.clone()));
    let read = Arc::new(MemoryTransactionManager::new("read", db.clone()));
    let (registry, metrics) = MetricsRegistry::shared();
    let table = OperationTable::new()
        .register(
            SAVE,
            Declaration::TxWrite(
                TxSettings::new()
                    .with_instrumented(true)
                    .with_log_level(LogLevel::All),
            ),
        )
        .register(
            LIST,
            Declaration::TxRead(TxSettings::new().with_isolation(Isolation::RepeatableRead)),
        )
        .register(FIND, Declaration::Read)
        .register(STORE, Declaration::Write)
        .register(ARCHIVE, Declaration::Route("archive".to_string()));
    let interceptor =
        TxInterceptor::new(TransactionService::new(write, read), metrics).with_table(table);
    Fixture {
        db,
        registry,
        interceptor,
    }
}

#[tokio::test]
async fn test_instrumented_success_records_duration_once() {
    let f = setup();
    let settings = TxSettings::new().with_instrumented(true);

    let result = f
        .interceptor
        .tx_write(SAVE, settings, |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "saved")?;
                Ok(())
            })
        })
        .await;

    assert_ok!(result);
    assert_eq!(f.registry.duration_count("ItemService.save"), 1);
    assert_eq!(f.registry.error_count("ItemService.save"), 0);
    assert_eq!(f.db.committed_count(ITEMS), 1);
}

#[tokio::test]
async fn test_instrumented_failure_counts_error_once_and_rethrows() {
    let f = setup();
    let settings = TxSettings::new()
        .with_instrumented(true)
        .with_log_level(LogLevel::Time);

    let result: Result<(), TxError> = f
        .interceptor
        .tx_write(SAVE, settings, |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "lost")?;
                Err(TxError::work(std::io::Error::other("disk full")))
            })
        })
        .await;

    let err = assert_err!(result);
    let io = err.downcast_work::<std::io::Error>().unwrap();
    assert_eq!(io.to_string(), "disk full");
    assert_eq!(f.registry.error_count("ItemService.save"), 1);
    assert_eq!(f.registry.duration_count("ItemService.save"), 1);
    assert_eq!(f.db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_plain_call_records_no_metrics() {
    let f = setup();

    f.interceptor
        .tx_write(SAVE, TxSettings::new(), |_scope| Box::pin(async move { Ok(()) }))
        .await
        .unwrap();

    assert_eq!(f.registry.duration_count("ItemService.save"), 0);
    assert!(f.registry.snapshot().operations.is_empty());
}

#[tokio::test]
async fn test_illegal_propagation_skips_work_and_metrics() {
    let f = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let settings = TxSettings::new()
        .with_propagation(Propagation::Mandatory)
        .with_instrumented(true);

    let counter = calls.clone();
    let result = f
        .interceptor
        .tx_write(SAVE, settings, move |_scope| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .await;

    assert!(assert_err!(result).is_illegal_state());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.registry.duration_count("ItemService.save"), 0);
}

#[tokio::test]
async fn test_tx_read_runs_read_only_on_read_manager() {
    let f = setup();

    let (read_only, side) = f
        .interceptor
        .tx_read(LIST, TxSettings::new(), |scope| {
            Box::pin(async move { Ok((scope.is_read_only(), scope.current_side())) })
        })
        .await
        .unwrap();

    assert!(read_only);
    assert_eq!(side, Some(Side::Read));
    assert_eq!(f.interceptor.service().read_manager().transactions_started(), 1);
    assert_eq!(f.interceptor.service().write_manager().transactions_started(), 0);
}

#[tokio::test]
async fn test_invoke_applies_table_declarations() {
    let f = setup();

    f.interceptor
        .invoke(SAVE, |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "from-table")?;
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(f.registry.duration_count("ItemService.save"), 1);

    let (isolation, read_only) = f
        .interceptor
        .invoke(LIST, |scope| {
            Box::pin(async move { Ok((scope.isolation(), scope.is_read_only())) })
        })
        .await
        .unwrap();
    assert_eq!(isolation, Some(Isolation::RepeatableRead));
    assert!(read_only);

    let keys = [FIND, STORE, ARCHIVE, UNDECLARED];
    let mut seen = Vec::new();
    for site in keys {
        let observed = f
            .interceptor
            .invoke(site, |scope| {
                Box::pin(async move { Ok((current_routing_key(), scope.is_transaction_active())) })
            })
            .await
            .unwrap();
        seen.push(observed);
    }
    assert_eq!(
        seen,
        vec![
            (Some(READ_KEY.to_string()), false),
            (Some(WRITE_KEY.to_string()), false),
            (Some("archive".to_string()), false),
            (None, false),
        ]
    );
}

#[tokio::test]
async fn test_route_clears_key_after_failure() {
    let f = setup();

    let result: Result<(), TxError> = f
        .interceptor
        .route(READ_KEY, async {
            assert_eq!(current_routing_key().as_deref(), Some(READ_KEY));
            Err(TxError::aborted("replica unavailable"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(current_routing_key(), None);
}

#[tokio::test]
async fn test_nested_routes_restore_outer_key() {
    let f = setup();

    let keys = f
        .interceptor
        .route(WRITE_KEY, async {
            let inner = f
                .interceptor
                .route(READ_KEY, async { Ok(current_routing_key()) })
                .await?;
            Ok::<_, TxError>((inner, current_routing_key()))
        })
        .await
        .unwrap();

    assert_eq!(keys.0.as_deref(), Some(READ_KEY));
    assert_eq!(keys.1.as_deref(), Some(WRITE_KEY));
}

#[tokio::test]
async fn test_nested_interceptor_calls_share_the_scope() {
    let f = setup();
    let interceptor = f.interceptor.clone();

    let depth = f
        .interceptor
        .tx_write(SAVE, TxSettings::new(), move |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "outer")?;
                interceptor
                    .tx_write_in(
                        scope,
                        AUDIT,
                        TxSettings::new().with_propagation(Propagation::Mandatory),
                        |scope| {
                            Box::pin(async move {
                                scope.session().await?.insert(ITEMS, "audit")?;
                                Ok(scope.depth())
                            })
                        },
                    )
                    .await
            })
        })
        .await
        .unwrap();

    assert_eq!(depth, 2);
    assert_eq!(f.db.committed_rows(ITEMS), vec!["outer", "audit"]);
    assert_eq!(f.interceptor.service().write_manager().transactions_started(), 1);
}

const AUDIT: CallSite = CallSite::new("ItemService", "audit");

async fn save_with_audit(f: &Fixture, audit_fails: bool) -> Result<(), TxError> {
    let interceptor = f.interceptor.clone();
    let instrumented = TxSettings::new().with_instrumented(true);

    f.interceptor
        .tx_write(SAVE, instrumented, move |scope| {
            Box::pin(async move {
                scope.session().await?.insert(ITEMS, "saved")?;
                interceptor
                    .tx_write_in(scope, AUDIT, instrumented, move |scope| {
                        Box::pin(async move {
                            scope.session().await?.insert(ITEMS, "audited")?;
                            if audit_fails {
                                return Err(TxError::aborted("audit rejected"));
                            }
                            Ok(())
                        })
                    })
                    .await
            })
        })
        .await
}

#[tokio::test]
async fn test_nested_instrumented_calls_record_once_each() {
    let f = setup();

    assert_ok!(save_with_audit(&f, false).await);

    for site in ["ItemService.save", "ItemService.audit"] {
        assert_eq!(f.registry.duration_count(site), 1, "{site}");
        assert_eq!(f.registry.error_count(site), 0, "{site}");
    }
    assert_eq!(f.db.committed_rows(ITEMS), vec!["saved", "audited"]);
}

#[tokio::test]
async fn test_nested_instrumented_failure_counts_once_per_call() {
    let f = setup();

    assert_err!(save_with_audit(&f, true).await);

    for site in ["ItemService.save", "ItemService.audit"] {
        assert_eq!(f.registry.duration_count(site), 1, "{site}");
        assert_eq!(f.registry.error_count(site), 1, "{site}");
    }
    assert_eq!(f.db.committed_count(ITEMS), 0);
}

#[tokio::test]
async fn test_concurrent_calls_keep_their_own_configuration() {
    let f = setup();
    let mut handles = Vec::new();

    for i in 0..16 {
        let interceptor = f.interceptor.clone();
        let isolation = if rand::thread_rng().gen_bool(0.5) {
            Isolation::Serializable
        } else {
            Isolation::ReadCommitted
        };
        let propagation = if i % 2 == 0 {
            Propagation::Required
        } else {
            Propagation::RequiresNew
        };
        handles.push(tokio::spawn(async move {
            let settings = TxSettings::new()
                .with_isolation(isolation)
                .with_propagation(propagation)
                .with_instrumented(true);
            let observed = interceptor
                .tx_write(SAVE, settings, move |scope| {
                    Box::pin(async move {
                        tokio::task::yield_now().await;
                        scope.session().await?.insert(ITEMS, format!("item-{i}"))?;
                        Ok((scope.isolation(), scope.current_propagation()))
                    })
                })
                .await
                .unwrap();
            assert_eq!(observed, (Some(isolation), Some(propagation)));
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(f.db.committed_count(ITEMS), 16);
    assert_eq!(f.registry.duration_count("ItemService.save"), 16);
}
