// Write routing: DML vs buffered mutations, batching
mod common;

use common::{account, connection, versioned_update};
use txreplay::client::{CallKind, ClientCall};
use txreplay::{
    DriverError, ExecutionContext, QueryResult, Statement, TransactionOptions, TxStatus, Value,
    WritePreference,
};

#[test]
fn test_stale_version_mutation_never_buffers() {
    let conn = connection(WritePreference::AlwaysMutate);
    conn.client()
        .write(&Statement::new("UPDATE Accounts SET Version = 6 WHERE Id = 1"))
        .unwrap();

    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let err = conn
        .route_and_execute(&versioned_update(1, 900, 5), ExecutionContext::Transaction(&tx))
        .unwrap_err();

    assert!(err.is_conflict(), "{err}");
    assert_eq!(conn.client().count(CallKind::BufferMutation), 0);
    assert_eq!(conn.client().count(CallKind::Commit), 0);
    assert_eq!(tx.status().unwrap(), TxStatus::Failed);
    tx.rollback().unwrap();
    assert_eq!(account(&conn, 1), Some((Value::Integer(1000), Value::Integer(6))));
}

#[test]
fn test_stale_arithmetic_update_never_buffers() {
    let conn = connection(WritePreference::AlwaysMutate);
    conn.client()
        .write(&Statement::new("UPDATE Accounts SET Version = 6 WHERE Id = 1"))
        .unwrap();
    conn.client().clear_calls();

    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let err = conn
        .route_and_execute(
            &Statement::new("UPDATE Accounts SET Balance = Balance - 100 WHERE Id = 1 AND Version = 5"),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap_err();

    match err {
        DriverError::OptimisticConcurrency { expected, found, .. } => {
            assert_eq!(expected, "5");
            assert_eq!(found, "6");
        }
        other => panic!("expected version conflict, got {other}"),
    }
    let executed: Vec<String> = conn
        .client()
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ClientCall::Execute { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(executed, vec!["SELECT Version, Balance FROM Accounts WHERE Id = @k1"]);
    assert_eq!(conn.client().count(CallKind::BufferMutation), 0);
    assert_eq!(conn.client().count(CallKind::Commit), 0);
    tx.rollback().unwrap();
    assert_eq!(account(&conn, 1), Some((Value::Integer(1000), Value::Integer(6))));
}

#[test]
fn test_arithmetic_update_buffers_computed_value() {
    let conn = connection(WritePreference::AlwaysMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let result = conn
        .route_and_execute(
            &Statement::new(
                "UPDATE Accounts SET Balance = Balance - @amount, Version = Version + 1 WHERE Id = 1 AND Version = 5",
            )
            .bind("amount", 100),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap();
    assert_eq!(result, QueryResult::Affected(1));

    let missing = conn
        .route_and_execute(
            &Statement::new("UPDATE Accounts SET Balance = Balance + 1 WHERE Id = 99"),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap();
    assert_eq!(missing, QueryResult::Affected(0));

    assert_eq!(conn.client().count(CallKind::BufferMutation), 1);
    assert_eq!(conn.client().count(CallKind::ExecuteBatch), 0);
    tx.commit().unwrap();
    assert_eq!(account(&conn, 1), Some((Value::Integer(900), Value::Integer(6))));
}

#[test]
fn test_stale_version_dml_reports_conflict() {
    let conn = connection(WritePreference::NeverMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let err = conn
        .route_and_execute(&versioned_update(1, 900, 4), ExecutionContext::Transaction(&tx))
        .unwrap_err();
    match err {
        DriverError::OptimisticConcurrency { table, found, .. } => {
            assert_eq!(table, "Accounts");
            assert_eq!(found, "no matching row");
        }
        other => panic!("expected version conflict, got {other}"),
    }
}

#[test]
fn test_implicit_batch_commits_as_mutations() {
    let conn = connection(WritePreference::MutateOnlyImplicit);
    let mut batch = conn.new_batch();
    for id in 10..13 {
        conn.add_to_batch(
            &mut batch,
            Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (@id, 0, 1)")
                .bind("id", id),
        );
    }
    conn.add_to_batch(&mut batch, versioned_update(1, 900, 5));

    let counts = conn.execute_batch(batch, conn.implicit()).unwrap();
    assert_eq!(counts, vec![1, 1, 1, 1]);

    let client = conn.client();
    assert_eq!(client.count(CallKind::BufferMutation), 4);
    // The locking read for the versioned update
    assert_eq!(client.count(CallKind::Execute), 1);
    assert_eq!(client.count(CallKind::ExecuteBatch), 0);
    assert_eq!(client.count(CallKind::Commit), 1);
    assert!(matches!(
        client.calls().last(),
        Some(ClientCall::Commit { mutations: 4, .. })
    ));
    assert_eq!(account(&conn, 1), Some((Value::Integer(900), Value::Integer(6))));
    assert_eq!(account(&conn, 12), Some((Value::Integer(0), Value::Integer(1))));
}

#[test]
fn test_batch_counts_follow_caller_order() {
    let conn = connection(WritePreference::AlwaysMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let mut batch = conn.new_batch();
    conn.add_to_batch(
        &mut batch,
        Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (20, 5, 1), (21, 5, 1)"),
    );
    // INSERT OR IGNORE has no mutation form and goes out as DML
    conn.add_to_batch(
        &mut batch,
        Statement::new("INSERT OR IGNORE INTO Accounts (Id, Balance, Version) VALUES (2, 0, 0), (30, 5, 1)"),
    );
    conn.add_to_batch(&mut batch, Statement::new("DELETE FROM Accounts WHERE Id = 1"));

    let counts = conn
        .execute_batch(batch, ExecutionContext::Transaction(&tx))
        .unwrap();
    assert_eq!(counts, vec![2, 1, 1]);

    let calls = conn.client().calls();
    let batched: Vec<&Vec<String>> = calls
        .iter()
        .filter_map(|call| match call {
            ClientCall::ExecuteBatch { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(batched.len(), 1);
    assert_eq!(batched[0].len(), 1);
    assert_eq!(conn.client().count(CallKind::BufferMutation), 2);

    tx.commit().unwrap();
    assert_eq!(account(&conn, 1), None);
    assert_eq!(account(&conn, 2), Some((Value::Integer(50), Value::Integer(1))));
    assert_eq!(account(&conn, 21), Some((Value::Integer(5), Value::Integer(1))));
    assert_eq!(account(&conn, 30), Some((Value::Integer(5), Value::Integer(1))));
}

/// A mutation's locking read sees the data as of its place in the batch,
/// not after DML added later in the same batch.
#[test]
fn test_batch_runs_in_caller_order() {
    let conn = connection(WritePreference::AlwaysMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let mut batch = conn.new_batch();
    conn.add_to_batch(&mut batch, versioned_update(1, 900, 5));
    // No WHERE clause, so DML; bumps every version
    conn.add_to_batch(&mut batch, Statement::new("UPDATE Accounts SET Version = Version + 1"));
    conn.add_to_batch(
        &mut batch,
        Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (40, 1, 1)"),
    );

    let counts = conn
        .execute_batch(batch, ExecutionContext::Transaction(&tx))
        .unwrap();
    assert_eq!(counts, vec![1, 2, 1]);

    let kinds: Vec<CallKind> = conn.client().calls().iter().map(ClientCall::kind).collect();
    assert_eq!(
        kinds,
        vec![
            CallKind::Begin,
            CallKind::Execute,
            CallKind::BufferMutation,
            CallKind::ExecuteBatch,
            CallKind::BufferMutation,
        ]
    );

    tx.commit().unwrap();
    assert_eq!(account(&conn, 1), Some((Value::Integer(900), Value::Integer(6))));
    assert_eq!(account(&conn, 2), Some((Value::Integer(50), Value::Integer(2))));
    assert!(account(&conn, 40).is_some());
}

#[test]
fn test_batch_rejects_queries_without_failing() {
    let conn = connection(WritePreference::NeverMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let mut batch = conn.new_batch();
    conn.add_to_batch(&mut batch, Statement::new("DELETE FROM Accounts WHERE Id = 2"));
    conn.add_to_batch(&mut batch, Statement::new("SELECT Id FROM Accounts"));

    let err = conn
        .execute_batch(batch, ExecutionContext::Transaction(&tx))
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidOperation(_)));
    assert_eq!(tx.status().unwrap(), TxStatus::Active);
    assert_eq!(conn.client().count(CallKind::ExecuteBatch), 0);
}

/// The same writes through either path leave the same committed data.
#[test]
fn test_mutation_and_dml_paths_agree() {
    let writes = || {
        vec![
            Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (3, 30, 1)"),
            Statement::new("UPDATE Accounts SET Balance = @b WHERE Id = @id")
                .bind("b", 7)
                .bind("id", 2),
            versioned_update(1, 900, 5),
            Statement::new("DELETE FROM Accounts WHERE Id = 3"),
            Statement::new("INSERT OR UPDATE INTO Accounts (Id, Balance, Version) VALUES (4, 40, 1)"),
        ]
    };

    let mut committed = Vec::new();
    for preference in [WritePreference::NeverMutate, WritePreference::AlwaysMutate] {
        let conn = connection(preference);
        let tx = conn.begin_transaction(TransactionOptions::explicit());
        for stmt in writes() {
            let result = conn
                .route_and_execute(&stmt, ExecutionContext::Transaction(&tx))
                .unwrap();
            assert_eq!(result, QueryResult::Affected(1), "{preference:?}: {}", stmt.sql);
        }
        tx.commit().unwrap();
        committed.push(conn.client().rows("Accounts").unwrap().1);
    }
    assert_eq!(committed[0], committed[1]);
}

#[test]
fn test_implicit_dml_buffers_mutation() {
    let conn = connection(WritePreference::MutateOnlyImplicit);
    let result = conn
        .route_and_execute(
            &Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (5, 0, 1)"),
            conn.implicit(),
        )
        .unwrap();
    assert_eq!(result, QueryResult::Affected(1));
    assert_eq!(conn.client().count(CallKind::BufferMutation), 1);
    assert_eq!(conn.client().count(CallKind::Execute), 0);
    assert_eq!(conn.client().count(CallKind::Commit), 1);
    assert!(account(&conn, 5).is_some());
}

#[test]
fn test_never_mutate_sends_dml_implicitly() {
    let conn = connection(WritePreference::NeverMutate);
    conn.route_and_execute(&Statement::new("DELETE FROM Accounts WHERE Id = 2"), conn.implicit())
        .unwrap();
    assert_eq!(conn.client().count(CallKind::BufferMutation), 0);
    assert_eq!(conn.client().count(CallKind::Execute), 1);
    assert_eq!(account(&conn, 2), None);
}

#[test]
fn test_reads_see_own_dml_writes() {
    let conn = connection(WritePreference::NeverMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    conn.route_and_execute(
        &Statement::new("UPDATE Accounts SET Balance = 1 WHERE Id = 1"),
        ExecutionContext::Transaction(&tx),
    )
    .unwrap();
    let read = conn
        .route_and_execute(
            &Statement::new("SELECT Balance FROM Accounts WHERE Id = 1"),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap();
    assert_eq!(read.rows(), &[vec![Value::Integer(1)]]);
    tx.rollback().unwrap();
    assert_eq!(account(&conn, 1), Some((Value::Integer(1000), Value::Integer(5))));
}

#[test]
fn test_read_only_transaction_rejects_writes() {
    let conn = connection(WritePreference::NeverMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit().read_only());
    conn.route_and_execute(
        &Statement::new("SELECT Id FROM Accounts"),
        ExecutionContext::Transaction(&tx),
    )
    .unwrap();
    let err = conn
        .route_and_execute(
            &Statement::new("DELETE FROM Accounts WHERE Id = 1"),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidOperation(_)));
    assert!(matches!(
        conn.client().calls().first(),
        Some(ClientCall::Begin { mode: txreplay::TransactionMode::ReadOnly, .. })
    ));
    tx.commit().unwrap();
}

#[test]
fn test_ddl_runs_outside_data_transaction() {
    let conn = connection(WritePreference::AlwaysMutate);
    let tx = conn.begin_transaction(TransactionOptions::explicit());
    let result = conn
        .route_and_execute(
            &Statement::new("CREATE TABLE Notes (Id INT64, Body STRING(MAX)) PRIMARY KEY (Id)"),
            ExecutionContext::Transaction(&tx),
        )
        .unwrap();
    assert_eq!(result, QueryResult::Success("DDL executed".to_string()));
    assert_eq!(conn.client().count(CallKind::Begin), 0);
    assert_eq!(conn.client().table_names(), vec!["Accounts", "Notes"]);
    tx.commit().unwrap();
}
