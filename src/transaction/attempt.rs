use super::cancel::Deadline;
use super::replay::{Outcome, ReplayEntry, ReplayLog};
use crate::client::{CommitResult, DatabaseClient, QueryResult};
use crate::core::{ClientError, DriverError, Statement};
use crate::mutation::{MutationDescriptor, VersionGuard};
use log::debug;
use std::time::Duration;

/// Why a step of an attempt stopped.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The attempt is dead; start the next one.
    Aborted {
        message: String,
        retry_delay: Option<Duration>,
    },
    /// The logical transaction is dead.
    Failed(DriverError),
}

impl Interrupt {
    pub(crate) fn from_client(err: ClientError, sql: &str, attempt: u32) -> Self {
        match err {
            ClientError::Aborted {
                message,
                retry_delay,
            } => Self::Aborted {
                message,
                retry_delay,
            },
            ClientError::Database(message) => Self::Failed(DriverError::FatalDatabase {
                sql: sql.to_string(),
                attempt,
                message,
            }),
        }
    }
}

impl From<DriverError> for Interrupt {
    fn from(err: DriverError) -> Self {
        Self::Failed(err)
    }
}

pub(crate) type Step<T> = std::result::Result<T, Interrupt>;

/// One concrete try of a logical transaction against a live handle.
///
/// The log starts as a copy of the previous attempt's log; `replay` must
/// run before anything new is executed.
pub struct TransactionAttempt<H> {
    seq: u32,
    handle: Option<H>,
    log: ReplayLog,
    buffered: Vec<MutationDescriptor>,
}

impl<H> TransactionAttempt<H> {
    pub(crate) fn new(seq: u32, handle: H, log: ReplayLog) -> Self {
        Self {
            seq,
            handle: Some(handle),
            log,
            buffered: Vec::new(),
        }
    }

    /// 0 for the first attempt, +1 per retry.
    #[must_use]
    pub const fn seq(&self) -> u32 {
        self.seq
    }

    #[must_use]
    pub const fn log(&self) -> &ReplayLog {
        &self.log
    }

    #[must_use]
    pub fn buffered(&self) -> &[MutationDescriptor] {
        &self.buffered
    }

    pub(crate) fn take_handle(&mut self) -> Option<H> {
        self.handle.take()
    }

    /// Gives up the log for the next attempt. Buffered mutations are
    /// dropped; replay rebuilds them.
    pub(crate) fn into_log(self) -> ReplayLog {
        self.log
    }

    fn handle(&mut self) -> Step<&mut H> {
        self.handle.as_mut().ok_or_else(|| {
            Interrupt::Failed(DriverError::Internal(format!(
                "attempt {} has no live transaction",
                self.seq
            )))
        })
    }

    fn run_statement<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        stmt: &Statement,
        guard: Option<&VersionGuard>,
    ) -> Step<QueryResult>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let seq = self.seq;
        let handle = self.handle()?;
        let result = deadline.round_trip(seq, &stmt.sql, || client.execute(handle, stmt))?;
        if let Some(guard) = guard {
            guard.check(result.affected().unwrap_or(0))?;
        }
        Ok(result)
    }

    fn run_batch<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        stmts: &[Statement],
        guards: &[Option<VersionGuard>],
    ) -> Step<Vec<u64>>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let seq = self.seq;
        let sql = stmts.first().map_or("", |s| s.sql.as_str());
        let handle = self.handle()?;
        let counts = deadline.round_trip(seq, sql, || client.execute_batch(handle, stmts))?;
        if counts.len() != stmts.len() {
            return Err(Interrupt::Failed(DriverError::Internal(format!(
                "batch of {} statements returned {} counts",
                stmts.len(),
                counts.len()
            ))));
        }
        for (guard, count) in guards.iter().zip(&counts) {
            if let Some(guard) = guard {
                guard.check(*count)?;
            }
        }
        Ok(counts)
    }

    // Locking read, client-side version check and derived values, then
    // buffer. Returns the rows the resolved mutation touches.
    fn buffer<C>(&mut self, client: &C, deadline: &Deadline, mutation: &MutationDescriptor) -> Step<u64>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let seq = self.seq;
        let resolved = match &mutation.locking_read {
            Some(read) => {
                let handle = self.handle()?;
                let current = deadline.round_trip(seq, &read.statement.sql, || {
                    client.execute(handle, &read.statement)
                })?;
                read.resolve(mutation, &current)?
            }
            None => mutation.clone(),
        };
        let count = resolved.row_count();
        if count == 0 {
            debug!("attempt {seq}: mutation on '{}' matched no row", mutation.table);
            return Ok(0);
        }
        let handle = self.handle()?;
        client
            .buffer_mutation(handle, &resolved)
            .map_err(|err| Interrupt::from_client(err, &mutation.table, seq))?;
        self.buffered.push(resolved);
        Ok(count)
    }

    /// Executes a statement on the live handle and records it.
    pub(crate) fn execute<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        stmt: &Statement,
        guard: Option<VersionGuard>,
    ) -> Step<QueryResult>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let result = self.run_statement(client, deadline, stmt, guard.as_ref())?;
        self.log.push(ReplayEntry::Statement {
            stmt: stmt.clone(),
            outcome: Outcome::of(&result)?,
            guard,
        });
        Ok(result)
    }

    pub(crate) fn execute_batch<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        stmts: &[Statement],
        guards: &[Option<VersionGuard>],
    ) -> Step<Vec<u64>>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let counts = self.run_batch(client, deadline, stmts, guards)?;
        self.log.push(ReplayEntry::Batch {
            stmts: stmts.to_vec(),
            counts: counts.clone(),
            guards: guards.to_vec(),
        });
        Ok(counts)
    }

    pub(crate) fn apply_mutation<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        mutation: &MutationDescriptor,
    ) -> Step<u64>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let count = self.buffer(client, deadline, mutation)?;
        self.log.push(ReplayEntry::Mutation {
            mutation: mutation.clone(),
            count,
        });
        Ok(count)
    }

    /// Re-executes the inherited log in order. Version checks are
    /// re-evaluated; with `verify` set, a statement whose outcome differs
    /// from the one the caller already saw fails the transaction. Without
    /// it the log takes the new outcomes.
    pub(crate) fn replay<C>(&mut self, client: &C, deadline: &Deadline, verify: bool) -> Step<()>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let mut log = std::mem::take(&mut self.log);
        debug!(
            "attempt {}: replaying {} entries ({} statements)",
            self.seq,
            log.len(),
            log.statement_count()
        );
        let result = log
            .iter_mut()
            .try_for_each(|entry| self.replay_entry(client, deadline, entry, verify));
        self.log = log;
        result
    }

    fn replay_entry<C>(
        &mut self,
        client: &C,
        deadline: &Deadline,
        entry: &mut ReplayEntry,
        verify: bool,
    ) -> Step<()>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let diverged = match entry {
            ReplayEntry::Statement { stmt, outcome, guard } => {
                let result = self.run_statement(client, deadline, stmt, guard.as_ref())?;
                refresh(outcome, Outcome::of(&result)?)
            }
            ReplayEntry::Batch { stmts, counts, guards } => {
                let fresh = self.run_batch(client, deadline, stmts, guards)?;
                refresh(counts, fresh)
            }
            ReplayEntry::Mutation { mutation, count } => {
                let fresh = self.buffer(client, deadline, mutation)?;
                refresh(count, fresh)
            }
        };
        if verify && diverged {
            debug!("attempt {}: replay diverged at '{}'", self.seq, entry.sql());
            return Err(Interrupt::Failed(DriverError::ConcurrentModification {
                sql: entry.sql().to_string(),
                attempt: self.seq,
            }));
        }
        Ok(())
    }

    /// Commits DML side effects and buffered mutations in one call.
    pub(crate) fn commit<C>(&mut self, client: &C, deadline: &Deadline) -> Step<CommitResult>
    where
        C: DatabaseClient<Transaction = H>,
    {
        let seq = self.seq;
        deadline.check(seq)?;
        let handle = self.handle.take().ok_or_else(|| {
            Interrupt::Failed(DriverError::Internal(format!(
                "attempt {seq} has no live transaction"
            )))
        })?;
        client
            .commit(handle)
            .map_err(|err| Interrupt::from_client(err, "COMMIT", seq))
    }
}

// Stores the fresh value; true when it differs from the recorded one.
fn refresh<T: PartialEq>(recorded: &mut T, fresh: T) -> bool {
    let diverged = *recorded != fresh;
    *recorded = fresh;
    diverged
}
