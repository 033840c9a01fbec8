//! Async facade over `Connection`.
//!
//! Each call runs the blocking state machine on tokio's blocking pool. A
//! transaction budget becomes a `tokio::time::timeout`; when it expires the
//! cancel handle fires and the transaction stops at its next suspend point.

use crate::client::{DatabaseClient, QueryResult};
use crate::connection::{Connection, ExecutionContext};
use crate::core::{DriverError, Result, Statement, TimeoutScope};
use crate::executor::{BatchAccumulator, BatchUnit, ExecutionRouter};
use crate::transaction::{CancelHandle, CommitStats, LogicalTransaction, TransactionOptions, TxStatus};
use std::sync::Arc;
use tokio::task::JoinError;

fn join_error(err: JoinError) -> DriverError {
    DriverError::Internal(format!("blocking task failed: {err}"))
}

pub struct AsyncConnection<C: DatabaseClient> {
    inner: Connection<C>,
}

impl<C: DatabaseClient> Clone for AsyncConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> AsyncConnection<C>
where
    C: DatabaseClient + 'static,
    C::Transaction: 'static,
{
    pub const fn new(inner: Connection<C>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub const fn blocking(&self) -> &Connection<C> {
        &self.inner
    }

    #[must_use]
    pub fn begin_transaction(&self, options: TransactionOptions) -> AsyncTransaction<C> {
        AsyncTransaction {
            tx: Arc::new(self.inner.begin_transaction(options)),
        }
    }

    /// Runs one statement in the implicit context.
    pub async fn route_and_execute(&self, stmt: Statement) -> Result<QueryResult> {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || conn.route_and_execute(&stmt, conn.implicit()))
            .await
            .map_err(join_error)?
    }

    /// Runs a batch in the implicit context, committing it as one unit.
    pub async fn execute_batch(&self, batch: BatchUnit) -> Result<Vec<u64>> {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || conn.execute_batch(batch, conn.implicit()))
            .await
            .map_err(join_error)?
    }

    pub async fn execute_ddl(&self, sql: impl Into<String>) -> Result<()> {
        let conn = self.inner.clone();
        let sql = sql.into();
        tokio::task::spawn_blocking(move || conn.execute_ddl(&sql))
            .await
            .map_err(join_error)?
    }
}

/// Async handle to a logical transaction.
pub struct AsyncTransaction<C: DatabaseClient> {
    tx: Arc<LogicalTransaction<C>>,
}

impl<C> AsyncTransaction<C>
where
    C: DatabaseClient + 'static,
    C::Transaction: 'static,
{
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.tx.cancel_handle()
    }

    pub fn status(&self) -> Result<TxStatus> {
        self.tx.status()
    }

    /// Context for sync APIs that take the transaction by reference.
    #[must_use]
    pub fn context(&self) -> ExecutionContext<'_, C> {
        ExecutionContext::Transaction(self.tx.as_ref())
    }

    pub async fn execute(&self, stmt: Statement) -> Result<QueryResult> {
        self.run(move |tx| ExecutionRouter::execute(tx, &stmt)).await
    }

    pub async fn execute_batch(&self, batch: BatchUnit) -> Result<Vec<u64>> {
        self.run(move |tx| BatchAccumulator::from_unit(tx, batch).execute_all())
            .await
    }

    pub async fn commit(&self) -> Result<CommitStats> {
        self.run(LogicalTransaction::commit).await
    }

    pub async fn rollback(&self) -> Result<()> {
        let tx = Arc::clone(&self.tx);
        tokio::task::spawn_blocking(move || tx.rollback())
            .await
            .map_err(join_error)?
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LogicalTransaction<C>) -> Result<T> + Send + 'static,
    {
        let tx = Arc::clone(&self.tx);
        let mut task = tokio::task::spawn_blocking(move || op(&tx));

        let Some(budget) = self.tx.remaining() else {
            return task.await.map_err(join_error)?;
        };
        if let Ok(joined) = tokio::time::timeout(budget, &mut task).await {
            return joined.map_err(join_error)?;
        }

        self.tx.cancel_handle().cancel();
        // The blocking side stops at its next suspend point and releases
        // the live handle; wait for that before reporting the timeout.
        match task.await.map_err(join_error)? {
            Ok(value) => Ok(value),
            Err(DriverError::Cancelled { .. }) => Err(DriverError::Timeout {
                scope: TimeoutScope::Transaction,
                elapsed: self.tx.elapsed(),
                limit: self.tx.config().transaction_timeout().unwrap_or(budget),
            }),
            Err(err) => Err(err),
        }
    }
}
