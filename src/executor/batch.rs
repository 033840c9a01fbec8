use super::router::{plan, Planned};
use crate::client::DatabaseClient;
use crate::core::{DriverError, Result, Statement};
use crate::mutation::VersionGuard;
use crate::transaction::LogicalTransaction;
use log::debug;

/// Statements collected for single-round-trip execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchUnit {
    statements: Vec<Statement>,
}

impl BatchUnit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stmt: Statement) {
        self.statements.push(stmt);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

/// Executes a batch inside a logical transaction in caller order: each
/// run of consecutive DML statements goes out as one batched call, and
/// mutations are buffered where they stand.
pub struct BatchAccumulator<'t, C: DatabaseClient> {
    tx: &'t LogicalTransaction<C>,
    unit: BatchUnit,
}

impl<'t, C: DatabaseClient> BatchAccumulator<'t, C> {
    pub fn new(tx: &'t LogicalTransaction<C>) -> Self {
        Self::from_unit(tx, BatchUnit::new())
    }

    pub const fn from_unit(tx: &'t LogicalTransaction<C>, unit: BatchUnit) -> Self {
        Self { tx, unit }
    }

    pub fn add(&mut self, stmt: Statement) {
        self.unit.add(stmt);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.unit.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unit.is_empty()
    }

    /// Affected-row counts in the order statements were added.
    pub fn execute_all(self) -> Result<Vec<u64>> {
        let tx = self.tx;
        let statements = self.unit.statements;

        let planned = statements
            .iter()
            .map(|stmt| plan(tx, stmt))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| tx.abandon(err))?;

        if let Some((stmt, _)) = statements
            .iter()
            .zip(&planned)
            .find(|(_, p)| matches!(p, Planned::Query | Planned::Ddl))
        {
            return Err(DriverError::InvalidOperation(format!(
                "only DML can be batched: {}",
                stmt.sql
            )));
        }

        let mut counts = Vec::with_capacity(statements.len());
        let mut run = DmlRun::default();
        for (stmt, planned) in statements.into_iter().zip(planned) {
            match planned {
                Planned::Dml(guard) => run.push(stmt, guard),
                Planned::Mutation(mutation) => {
                    counts.extend(run.flush(tx)?);
                    counts.push(tx.buffer_mutation(&mutation)?);
                }
                Planned::Query | Planned::Ddl => {}
            }
        }
        counts.extend(run.flush(tx)?);
        Ok(counts)
    }
}

// Consecutive DML statements waiting for one batched call.
#[derive(Default)]
struct DmlRun {
    stmts: Vec<Statement>,
    guards: Vec<Option<VersionGuard>>,
}

impl DmlRun {
    fn push(&mut self, stmt: Statement, guard: Option<VersionGuard>) {
        self.stmts.push(stmt);
        self.guards.push(guard);
    }

    fn flush<C: DatabaseClient>(&mut self, tx: &LogicalTransaction<C>) -> Result<Vec<u64>> {
        if self.stmts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("batch: {} DML statements in one call", self.stmts.len());
        let stmts = std::mem::take(&mut self.stmts);
        let guards = std::mem::take(&mut self.guards);
        tx.execute_batch_dml(&stmts, &guards)
    }
}
