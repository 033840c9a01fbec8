// Shared setup for integration tests
#![allow(dead_code)]

use txreplay::client::MemoryClient;
use txreplay::{Connection, DriverConfig, RetryPolicy, Statement, Value, WritePreference};

pub const ACCOUNTS: &str =
    "CREATE TABLE Accounts (Id INT64 NOT NULL, Balance INT64, Version INT64) PRIMARY KEY (Id)";

/// Accounts 1 (balance 1000, version 5) and 2 (balance 50, version 1),
/// retries without backoff.
pub fn config(preference: WritePreference) -> DriverConfig {
    DriverConfig::default()
        .with_write_preference(preference)
        .with_retry(RetryPolicy::immediate(5))
}

pub fn connection_with(config: DriverConfig) -> Connection<MemoryClient> {
    let client = MemoryClient::with_schema(&[ACCOUNTS]).unwrap();
    client
        .write(&Statement::new(
            "INSERT INTO Accounts (Id, Balance, Version) VALUES (1, 1000, 5), (2, 50, 1)",
        ))
        .unwrap();
    client.clear_calls();
    Connection::new(client, config)
}

pub fn connection(preference: WritePreference) -> Connection<MemoryClient> {
    connection_with(config(preference))
}

/// Committed (Balance, Version) of an account, if present.
pub fn account(conn: &Connection<MemoryClient>, id: i64) -> Option<(Value, Value)> {
    let (_, rows) = conn.client().rows("Accounts")?;
    rows.into_iter()
        .find(|row| row[0] == Value::Integer(id))
        .map(|row| (row[1].clone(), row[2].clone()))
}

pub fn versioned_update(id: i64, balance: i64, expected: i64) -> Statement {
    Statement::new(
        "UPDATE Accounts SET Balance = @balance, Version = @next WHERE Id = @id AND Version = @version",
    )
    .bind("balance", balance)
    .bind("next", expected + 1)
    .bind("id", id)
    .bind("version", expected)
}
