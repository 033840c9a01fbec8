// Async facade over the blocking driver
mod common;

use common::{account, config, connection, connection_with, versioned_update};
use std::time::Duration;
use txreplay::client::{CallKind, Fault};
use txreplay::{
    AsyncConnection, DriverError, QueryResult, Statement, TimeoutScope, TransactionOptions,
    TxStatus, Value, WritePreference,
};

#[tokio::test]
async fn test_async_transaction_retries() {
    let conn = AsyncConnection::new(connection(WritePreference::NeverMutate));
    conn.blocking().client().inject(Fault::abort(CallKind::Commit));

    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let result = tx.execute(versioned_update(1, 900, 5)).await.unwrap();
    assert_eq!(result, QueryResult::Affected(1));
    let stats = tx.commit().await.unwrap();

    assert_eq!(stats.retries, 1);
    assert_eq!(tx.status().unwrap(), TxStatus::Committed);
    assert_eq!(
        account(conn.blocking(), 1),
        Some((Value::Integer(900), Value::Integer(6)))
    );
}

#[tokio::test]
async fn test_async_implicit_statements() {
    let conn = AsyncConnection::new(connection(WritePreference::MutateOnlyImplicit));
    conn.execute_ddl("CREATE TABLE Notes (Id INT64, Body STRING(MAX)) PRIMARY KEY (Id)")
        .await
        .unwrap();
    conn.route_and_execute(Statement::new("INSERT INTO Notes (Id, Body) VALUES (1, 'hi')"))
        .await
        .unwrap();
    let rows = conn
        .route_and_execute(Statement::new("SELECT Body FROM Notes"))
        .await
        .unwrap();
    assert_eq!(rows.rows(), &[vec![Value::Text("hi".to_string())]]);

    let mut batch = conn.blocking().new_batch();
    batch.add(Statement::new("DELETE FROM Notes WHERE Id = 1"));
    batch.add(Statement::new("DELETE FROM Accounts WHERE Id = 2"));
    assert_eq!(conn.execute_batch(batch).await.unwrap(), vec![1, 1]);
    assert_eq!(account(conn.blocking(), 2), None);
}

#[tokio::test]
async fn test_async_timeout_cancels_blocking_work() {
    let conn = AsyncConnection::new(connection_with(
        config(WritePreference::NeverMutate).with_transaction_timeout_ms(50),
    ));
    // Abort, then a long server-requested wait before the retry
    conn.blocking().client().inject(
        Fault::abort(CallKind::Execute).with_retry_delay(Duration::from_secs(10)),
    );

    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let started = std::time::Instant::now();
    let err = tx
        .execute(Statement::new("SELECT Id FROM Accounts"))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        matches!(err, DriverError::Timeout { scope: TimeoutScope::Transaction, .. }),
        "{err}"
    );
    assert_eq!(tx.status().unwrap(), TxStatus::Failed);
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_async_cancel_handle() {
    let conn = AsyncConnection::new(connection(WritePreference::NeverMutate));
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    tx.cancel_handle().cancel();
    let err = tx
        .execute(Statement::new("SELECT Id FROM Accounts"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Cancelled { attempt: 0 }));
    assert_eq!(conn.blocking().client().count(CallKind::Begin), 0);
}
