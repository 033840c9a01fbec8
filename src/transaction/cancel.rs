use crate::core::{ClientError, DriverError, Result, TimeoutScope};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::attempt::{Interrupt, Step};

// Backoff sleeps wake up this often to notice cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Shared cancellation flag for one logical transaction.
///
/// Cloning shares the flag. Firing it never interrupts a round trip in
/// flight; the transaction notices at its next suspend point.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cancellation and timeout bookkeeping checked at every suspend point.
#[derive(Debug, Clone)]
pub(crate) struct Deadline {
    cancel: CancelHandle,
    started: Instant,
    statement_limit: Option<Duration>,
    transaction_limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn new(
        cancel: CancelHandle,
        statement_limit: Option<Duration>,
        transaction_limit: Option<Duration>,
    ) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            statement_limit,
            transaction_limit,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.transaction_limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    pub(crate) fn check(&self, attempt: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled { attempt });
        }
        if let Some(limit) = self.transaction_limit {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(DriverError::Timeout {
                    scope: TimeoutScope::Transaction,
                    elapsed,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Runs one client call as a suspend point.
    pub(crate) fn round_trip<T>(
        &self,
        attempt: u32,
        sql: &str,
        call: impl FnOnce() -> std::result::Result<T, ClientError>,
    ) -> Step<T> {
        self.check(attempt)?;
        let started = Instant::now();
        let result = call().map_err(|err| Interrupt::from_client(err, sql, attempt))?;
        if let Some(limit) = self.statement_limit {
            let elapsed = started.elapsed();
            if elapsed > limit {
                return Err(Interrupt::Failed(DriverError::Timeout {
                    scope: TimeoutScope::Statement,
                    elapsed,
                    limit,
                }));
            }
        }
        Ok(result)
    }

    /// Sleeps for `delay`, waking up early with an error on cancellation or
    /// when the transaction budget runs out.
    /// A delay past what `Instant` can represent sleeps until cancelled or
    /// timed out.
    pub(crate) fn sleep(&self, delay: Duration, attempt: u32) -> Result<()> {
        let until = Instant::now().checked_add(delay);
        loop {
            self.check(attempt)?;
            let left = match until {
                Some(until) => until.saturating_duration_since(Instant::now()),
                None => SLEEP_SLICE,
            };
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(SLEEP_SLICE));
        }
    }
}
