use super::attempt::{Interrupt, Step, TransactionAttempt};
use super::cancel::{CancelHandle, Deadline};
use super::replay::ReplayLog;
use crate::client::{DatabaseClient, QueryResult, TransactionMode};
use crate::config::{DriverConfig, WritePreference};
use crate::core::{ClientError, DriverError, Result, Statement};
use crate::mutation::{MutationDescriptor, VersionGuard};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
    Failed,
}

/// How a logical transaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Started by the caller rather than managed by the driver.
    pub explicit: bool,
    /// Overrides `DriverConfig::write_preference`.
    pub write_preference: Option<WritePreference>,
    pub read_only: bool,
}

impl TransactionOptions {
    #[must_use]
    pub const fn explicit() -> Self {
        Self {
            explicit: true,
            write_preference: None,
            read_only: false,
        }
    }

    #[must_use]
    pub const fn implicit() -> Self {
        Self {
            explicit: false,
            write_preference: None,
            read_only: false,
        }
    }

    #[must_use]
    pub const fn with_write_preference(mut self, preference: WritePreference) -> Self {
        self.write_preference = Some(preference);
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStats {
    /// Attempts begun, including the committed one.
    pub attempts: u32,
    pub retries: u32,
    pub total_backoff: Duration,
    pub mutations: usize,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

struct TxState<H> {
    status: TxStatus,
    attempt: Option<TransactionAttempt<H>>,
    /// Log handed to the next attempt when none is live. After commit,
    /// the committed attempt's log.
    pending: ReplayLog,
    next_seq: u32,
    retries: u32,
    total_backoff: Duration,
}

impl<H> TxState<H> {
    fn current_seq(&self) -> u32 {
        self.attempt
            .as_ref()
            .map_or(self.next_seq, TransactionAttempt::seq)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TxStatus::Active => Ok(()),
            TxStatus::Failed => Err(DriverError::InvalidOperation(
                "transaction has failed and must be rolled back".to_string(),
            )),
            TxStatus::Committed => Err(DriverError::InvalidOperation(
                "transaction is already committed".to_string(),
            )),
            TxStatus::RolledBack => Err(DriverError::InvalidOperation(
                "transaction is already rolled back".to_string(),
            )),
        }
    }
}

/// Caller-visible transaction: a sequence of attempts, at most one live,
/// that together look like a single uninterrupted transaction.
///
/// Operations are serialized through an internal mutex, so a transaction
/// shared between threads still executes and replays in one strict order.
pub struct LogicalTransaction<C: DatabaseClient> {
    client: Arc<C>,
    config: Arc<DriverConfig>,
    options: TransactionOptions,
    cancel: CancelHandle,
    deadline: Deadline,
    state: Mutex<TxState<C::Transaction>>,
}

impl<C: DatabaseClient> LogicalTransaction<C> {
    pub fn new(client: Arc<C>, config: Arc<DriverConfig>, options: TransactionOptions) -> Self {
        let cancel = CancelHandle::new();
        let deadline = Deadline::new(
            cancel.clone(),
            config.statement_timeout(),
            config.transaction_timeout(),
        );
        Self {
            client,
            config,
            options,
            cancel,
            deadline,
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                attempt: None,
                pending: ReplayLog::new(),
                next_seq: 0,
                retries: 0,
                total_backoff: Duration::ZERO,
            }),
        }
    }

    #[must_use]
    pub const fn options(&self) -> TransactionOptions {
        self.options
    }

    pub(crate) fn client(&self) -> &C {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub fn write_preference(&self) -> WritePreference {
        self.options
            .write_preference
            .unwrap_or(self.config.write_preference)
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.deadline.elapsed()
    }

    /// Time left in the transaction budget, if one is configured.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.remaining()
    }

    pub fn status(&self) -> Result<TxStatus> {
        Ok(self.lock()?.status)
    }

    /// Number of entries the next replay would re-execute.
    pub fn replay_len(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state
            .attempt
            .as_ref()
            .map_or(state.pending.len(), |attempt| attempt.log().len()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, TxState<C::Transaction>>> {
        self.state
            .lock()
            .map_err(|_| DriverError::Internal("transaction state lock poisoned".to_string()))
    }

    const fn mode(&self) -> TransactionMode {
        if self.options.read_only {
            TransactionMode::ReadOnly
        } else {
            TransactionMode::ReadWrite
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(DriverError::InvalidOperation(
                "DML is not allowed in a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Executes a query on the live handle, seeing this transaction's own writes.
    pub fn execute_query(&self, stmt: &Statement) -> Result<QueryResult> {
        self.run(|attempt, client, deadline| attempt.execute(client, deadline, stmt, None))
    }

    /// Executes a DML statement on the live handle. With a guard, 0 affected
    /// rows is an optimistic concurrency conflict.
    pub fn execute_dml(&self, stmt: &Statement, guard: Option<VersionGuard>) -> Result<u64> {
        self.ensure_writable()?;
        let result = self.run(|attempt, client, deadline| {
            attempt.execute(client, deadline, stmt, guard.clone())
        })?;
        Ok(result.affected().unwrap_or(0))
    }

    /// Sends several DML statements in one round trip.
    pub fn execute_batch_dml(
        &self,
        stmts: &[Statement],
        guards: &[Option<VersionGuard>],
    ) -> Result<Vec<u64>> {
        self.ensure_writable()?;
        if stmts.is_empty() {
            return Ok(Vec::new());
        }
        self.run(|attempt, client, deadline| attempt.execute_batch(client, deadline, stmts, guards))
    }

    /// Runs the mutation's locking read and version check, then buffers it
    /// until commit. Returns its affected-row count.
    pub fn buffer_mutation(&self, mutation: &MutationDescriptor) -> Result<u64> {
        self.ensure_writable()?;
        self.run(|attempt, client, deadline| attempt.apply_mutation(client, deadline, mutation))
    }

    /// Affected-row counts of the committed attempt, in execution order.
    /// They differ from what the caller saw first when an implicit
    /// transaction was replayed against changed data.
    pub fn committed_counts(&self) -> Result<Vec<u64>> {
        let state = self.lock()?;
        if state.status != TxStatus::Committed {
            return Err(DriverError::InvalidOperation(
                "transaction is not committed".to_string(),
            ));
        }
        Ok(state.pending.counts())
    }

    pub fn commit(&self) -> Result<CommitStats> {
        let mut state = self.lock()?;
        state.ensure_active()?;

        if state.attempt.is_none() && state.pending.is_empty() {
            debug!("commit of empty transaction, nothing to send");
            state.status = TxStatus::Committed;
            return Ok(CommitStats {
                attempts: state.next_seq,
                retries: state.retries,
                total_backoff: state.total_backoff,
                mutations: 0,
                commit_timestamp: None,
            });
        }

        let (result, mutations) = self.run_locked(&mut state, |attempt, client, deadline| {
            let mutations = attempt.buffered().len();
            attempt.commit(client, deadline).map(|result| (result, mutations))
        })?;
        if let Some(attempt) = state.attempt.take() {
            state.pending = attempt.into_log();
        }
        state.status = TxStatus::Committed;

        let stats = CommitStats {
            attempts: state.next_seq,
            retries: state.retries,
            total_backoff: state.total_backoff,
            mutations,
            commit_timestamp: result.commit_timestamp,
        };
        if stats.retries > 0 {
            info!(
                "committed after {} retries ({:?} backoff, {} mutations)",
                stats.retries, stats.total_backoff, stats.mutations
            );
        } else {
            debug!("committed ({} mutations)", stats.mutations);
        }
        Ok(stats)
    }

    /// Rolls back the live attempt. Also the way out of a failed transaction.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.lock()?;
        match state.status {
            TxStatus::Active => {}
            TxStatus::Failed => {
                state.status = TxStatus::RolledBack;
                return Ok(());
            }
            TxStatus::Committed | TxStatus::RolledBack => state.ensure_active()?,
        }
        state.status = TxStatus::RolledBack;
        state.pending = ReplayLog::new();
        let seq = state.current_seq();
        let handle = state.attempt.take().and_then(|mut attempt| attempt.take_handle());
        match handle.map(|handle| self.client.rollback(handle)) {
            Some(Err(ClientError::Database(message))) => Err(DriverError::FatalDatabase {
                sql: "ROLLBACK".to_string(),
                attempt: seq,
                message,
            }),
            _ => Ok(()),
        }
    }

    /// Marks the transaction failed after an error found outside a round
    /// trip, e.g. a statement that could not be classified.
    pub(crate) fn abandon(&self, err: DriverError) -> DriverError {
        match self.lock() {
            Ok(mut state) if state.status == TxStatus::Active => self.fail(&mut state, err),
            _ => err,
        }
    }

    fn run<T>(
        &self,
        op: impl FnMut(&mut TransactionAttempt<C::Transaction>, &C, &Deadline) -> Step<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        state.ensure_active()?;
        self.run_locked(&mut state, op)
    }

    // Drives `op` until it succeeds on some attempt, restarting and
    // replaying on every abort.
    fn run_locked<T>(
        &self,
        state: &mut TxState<C::Transaction>,
        mut op: impl FnMut(&mut TransactionAttempt<C::Transaction>, &C, &Deadline) -> Step<T>,
    ) -> Result<T> {
        loop {
            let step = self
                .start_attempt(state)
                .and_then(|attempt| op(attempt, self.client.as_ref(), &self.deadline));
            match step {
                Ok(value) => return Ok(value),
                Err(Interrupt::Aborted {
                    message,
                    retry_delay,
                }) => self.on_abort(state, message, retry_delay)?,
                Err(Interrupt::Failed(err)) => return Err(self.fail(state, err)),
            }
        }
    }

    fn start_attempt<'s>(
        &self,
        state: &'s mut TxState<C::Transaction>,
    ) -> Step<&'s mut TransactionAttempt<C::Transaction>> {
        let seq = state.current_seq();
        self.deadline.check(seq)?;

        let fresh = state.attempt.is_none();
        if fresh {
            let handle = self
                .deadline
                .round_trip(seq, "BEGIN", || self.client.begin_transaction(self.mode()))?;
            state.next_seq += 1;
            let log = std::mem::take(&mut state.pending);
            state.attempt = Some(TransactionAttempt::new(seq, handle, log));
        }

        let attempt = state.attempt.as_mut().ok_or_else(|| {
            Interrupt::Failed(DriverError::Internal("no live attempt".to_string()))
        })?;
        if fresh && !attempt.log().is_empty() {
            // Nobody but the driver saw an implicit transaction's results.
            let verify = self.config.verify_replay && self.options.explicit;
            attempt.replay(&*self.client, &self.deadline, verify)?;
        }
        Ok(attempt)
    }

    fn on_abort(
        &self,
        state: &mut TxState<C::Transaction>,
        message: String,
        retry_delay: Option<Duration>,
    ) -> Result<()> {
        let seq = state.current_seq();
        if let Some(mut attempt) = state.attempt.take() {
            if let Some(handle) = attempt.take_handle() {
                if let Err(err) = self.client.rollback(handle) {
                    warn!("rollback of aborted attempt {seq} failed: {err}");
                }
            }
            state.pending = attempt.into_log();
        }

        if !self.config.retry.allows(state.retries) {
            warn!("attempt {seq} aborted, retry budget exhausted: {message}");
            let err = DriverError::RetryBudgetExceeded {
                attempts: state.next_seq,
                last_abort: message,
            };
            return Err(self.fail(state, err));
        }

        state.retries += 1;
        let delay = retry_delay.unwrap_or_else(|| self.config.retry.backoff(state.retries));
        warn!(
            "attempt {seq} aborted ({message}), retry {} in {delay:?}",
            state.retries
        );
        if let Err(err) = self.deadline.sleep(delay, seq) {
            return Err(self.fail(state, err));
        }
        state.total_backoff = state.total_backoff.saturating_add(delay);
        Ok(())
    }

    // Releases the live handle before the error reaches the caller.
    fn fail(&self, state: &mut TxState<C::Transaction>, err: DriverError) -> DriverError {
        let seq = state.current_seq();
        if let Some(handle) = state.attempt.take().and_then(|mut attempt| attempt.take_handle()) {
            if let Err(rollback_err) = self.client.rollback(handle) {
                warn!("rollback after failure on attempt {seq} failed: {rollback_err}");
            }
        }
        state.pending = ReplayLog::new();
        state.status = TxStatus::Failed;
        debug!("transaction failed on attempt {seq}: {err}");
        err
    }
}

impl<C: DatabaseClient> Drop for LogicalTransaction<C> {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = state.attempt.take().and_then(|mut attempt| attempt.take_handle()) {
            debug!("rolling back transaction dropped while active");
            if let Err(err) = self.client.rollback(handle) {
                warn!("rollback on drop failed: {err}");
            }
        }
    }
}
