//! The database client seam.
//!
//! Everything above this trait (retry, replay, routing) is backend-agnostic;
//! a real Spanner-style client and the in-memory `MemoryClient` both plug in
//! here.

pub mod memory;

use crate::core::{ClientError, Statement, Value};
use crate::mutation::MutationDescriptor;
use chrono::{DateTime, Utc};

pub use memory::{CallKind, ClientCall, Fault, MemoryClient, MemoryStore, MemoryTransaction};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadWrite,
    ReadOnly,
}

/// Query execution result
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Success(String),
    Affected(u64),
    Rows(Vec<Vec<Value>>, Vec<String>), // (rows, column_names)
}

impl QueryResult {
    #[must_use]
    pub const fn affected(&self) -> Option<u64> {
        match self {
            Self::Affected(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        match self {
            Self::Rows(rows, _) => rows,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// Operations the underlying database client provides.
///
/// Every method is a blocking round trip. A `ClientError::Aborted` from any
/// of them invalidates the transaction handle it was called on.
pub trait DatabaseClient: Send + Sync {
    type Transaction: Send;

    fn begin_transaction(&self, mode: TransactionMode) -> ClientResult<Self::Transaction>;

    fn execute(&self, tx: &mut Self::Transaction, stmt: &Statement) -> ClientResult<QueryResult>;

    /// Runs DML statements in one round trip, returning per-statement counts.
    fn execute_batch(
        &self,
        tx: &mut Self::Transaction,
        stmts: &[Statement],
    ) -> ClientResult<Vec<u64>>;

    /// Buffers a mutation; it is applied atomically at commit.
    fn buffer_mutation(
        &self,
        tx: &mut Self::Transaction,
        mutation: &MutationDescriptor,
    ) -> ClientResult<()>;

    fn commit(&self, tx: Self::Transaction) -> ClientResult<CommitResult>;

    fn rollback(&self, tx: Self::Transaction) -> ClientResult<()>;

    /// Read outside any transaction, at a strong timestamp.
    fn execute_single_use(&self, stmt: &Statement) -> ClientResult<QueryResult>;

    fn execute_ddl(&self, sql: &str) -> ClientResult<()>;
}
