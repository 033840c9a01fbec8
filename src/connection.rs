use crate::classifier::{statement_kind, StatementKind};
use crate::client::{DatabaseClient, QueryResult};
use crate::config::{DriverConfig, WritePreference};
use crate::core::{DriverError, Result, Statement};
use crate::executor::{execute_ddl, BatchAccumulator, BatchUnit, ExecutionRouter};
use crate::transaction::{
    CancelHandle, Deadline, Interrupt, LogicalTransaction, TransactionOptions,
};
use log::{debug, warn};
use std::sync::Arc;

/// Where a statement runs.
pub enum ExecutionContext<'t, C: DatabaseClient> {
    /// No caller transaction; the driver manages a one-statement one.
    Implicit(WritePreference),
    Transaction(&'t LogicalTransaction<C>),
}

/// ORM-facing entry point. Cheap to clone; clones share the client.
pub struct Connection<C: DatabaseClient> {
    client: Arc<C>,
    config: Arc<DriverConfig>,
}

impl<C: DatabaseClient> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C: DatabaseClient> Connection<C> {
    pub fn new(client: C, config: DriverConfig) -> Self {
        Self::from_shared(Arc::new(client), Arc::new(config))
    }

    pub const fn from_shared(client: Arc<C>, config: Arc<DriverConfig>) -> Self {
        Self { client, config }
    }

    #[must_use]
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Implicit context with the configured write preference.
    #[must_use]
    pub fn implicit<'t>(&self) -> ExecutionContext<'t, C> {
        ExecutionContext::Implicit(self.config.write_preference)
    }

    /// Starts a logical transaction. Nothing is sent until its first statement.
    #[must_use]
    pub fn begin_transaction(&self, options: TransactionOptions) -> LogicalTransaction<C> {
        LogicalTransaction::new(Arc::clone(&self.client), Arc::clone(&self.config), options)
    }

    pub fn route_and_execute(
        &self,
        stmt: &Statement,
        context: ExecutionContext<'_, C>,
    ) -> Result<QueryResult> {
        match context {
            ExecutionContext::Transaction(tx) => ExecutionRouter::execute(tx, stmt),
            ExecutionContext::Implicit(preference) => match statement_kind(&stmt.sql)? {
                StatementKind::Query => self.single_use_read(stmt),
                StatementKind::Ddl => execute_ddl(self.client.as_ref(), &stmt.sql),
                _ => {
                    let tx = self.begin_transaction(
                        TransactionOptions::implicit().with_write_preference(preference),
                    );
                    let result = ExecutionRouter::execute(&tx, stmt)?;
                    let stats = tx.commit()?;
                    if stats.retries == 0 {
                        return Ok(result);
                    }
                    // A replayed attempt may have touched different rows.
                    Ok(tx
                        .committed_counts()?
                        .first()
                        .map_or(result, |count| QueryResult::Affected(*count)))
                }
            },
        }
    }

    #[must_use]
    pub fn new_batch(&self) -> BatchUnit {
        BatchUnit::new()
    }

    pub fn add_to_batch(&self, batch: &mut BatchUnit, stmt: Statement) {
        batch.add(stmt);
    }

    /// Runs a batch; counts come back in the order statements were added.
    /// In an implicit context the whole batch commits as one transaction.
    pub fn execute_batch(
        &self,
        batch: BatchUnit,
        context: ExecutionContext<'_, C>,
    ) -> Result<Vec<u64>> {
        match context {
            ExecutionContext::Transaction(tx) => BatchAccumulator::from_unit(tx, batch).execute_all(),
            ExecutionContext::Implicit(preference) => {
                if batch.is_empty() {
                    return Ok(Vec::new());
                }
                let tx = self.begin_transaction(
                    TransactionOptions::implicit().with_write_preference(preference),
                );
                let counts = BatchAccumulator::from_unit(&tx, batch).execute_all()?;
                let stats = tx.commit()?;
                debug!(
                    "implicit batch committed: {} mutations, {} retries",
                    stats.mutations, stats.retries
                );
                if stats.retries == 0 {
                    return Ok(counts);
                }
                tx.committed_counts()
            }
        }
    }

    pub fn execute_ddl(&self, sql: &str) -> Result<()> {
        execute_ddl(self.client.as_ref(), sql).map(|_| ())
    }

    // Single-use reads hold no locks, so an abort just reruns the read.
    // The transaction timeout bounds the whole loop, backoff included.
    fn single_use_read(&self, stmt: &Statement) -> Result<QueryResult> {
        let policy = &self.config.retry;
        let deadline = Deadline::new(
            CancelHandle::new(),
            self.config.statement_timeout(),
            self.config.transaction_timeout(),
        );
        let mut retries = 0;
        loop {
            let step = deadline.round_trip(retries, &stmt.sql, || self.client.execute_single_use(stmt));
            match step {
                Ok(result) => return Ok(result),
                Err(Interrupt::Aborted {
                    message,
                    retry_delay,
                }) => {
                    if !policy.allows(retries) {
                        return Err(DriverError::RetryBudgetExceeded {
                            attempts: retries + 1,
                            last_abort: message,
                        });
                    }
                    retries += 1;
                    let delay = retry_delay.unwrap_or_else(|| policy.backoff(retries));
                    warn!("single-use read aborted ({message}), retry {retries} in {delay:?}");
                    deadline.sleep(delay, retries)?;
                }
                Err(Interrupt::Failed(err)) => return Err(err),
            }
        }
    }
}
