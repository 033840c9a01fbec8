use crate::classifier::{classify, ClassifiedStatement, StatementKind};
use crate::client::{DatabaseClient, QueryResult};
use crate::config::WritePreference;
use crate::core::{DriverError, Result, Statement};
use crate::mutation::{translate, MutationDescriptor, Translation, VersionGuard};
use crate::transaction::LogicalTransaction;
use log::debug;

/// Where a statement is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Read on the live handle, or single-use outside a transaction.
    DirectRead,
    /// Schema change, outside any data transaction.
    DirectDdl,
    Dml,
    Mutation,
}

/// Path for a statement kind given the transaction context and preference.
#[must_use]
pub const fn choose_path(
    kind: StatementKind,
    explicit: bool,
    preference: WritePreference,
) -> ExecutionPath {
    match (kind, explicit, preference) {
        (StatementKind::Query, _, _) => ExecutionPath::DirectRead,
        (StatementKind::Ddl, _, _) => ExecutionPath::DirectDdl,
        (_, true, WritePreference::AlwaysMutate) => ExecutionPath::Mutation,
        (_, true, _) => ExecutionPath::Dml,
        (_, false, WritePreference::NeverMutate) => ExecutionPath::Dml,
        (_, false, _) => ExecutionPath::Mutation,
    }
}

/// A statement with its path decided and its payload prepared.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Planned {
    Query,
    Ddl,
    Dml(Option<VersionGuard>),
    Mutation(MutationDescriptor),
}

fn dml(classified: &ClassifiedStatement, stmt: &Statement) -> Result<Planned> {
    Ok(Planned::Dml(VersionGuard::for_statement(classified, stmt)?))
}

/// Classifies `stmt` and, for the mutation path, translates it. Statements
/// with no mutation form fall back to DML.
pub(crate) fn plan<C: DatabaseClient>(tx: &LogicalTransaction<C>, stmt: &Statement) -> Result<Planned> {
    let classified = classify(&stmt.sql, &tx.config().version_column)?;
    let path = choose_path(
        classified.kind,
        tx.options().explicit,
        tx.write_preference(),
    );
    debug!("{} statement routed to {path:?}: {}", classified.kind, stmt.sql);

    match path {
        ExecutionPath::DirectRead => Ok(Planned::Query),
        ExecutionPath::DirectDdl => Ok(Planned::Ddl),
        ExecutionPath::Dml => dml(&classified, stmt),
        ExecutionPath::Mutation => match translate(&classified, stmt)? {
            Translation::Mutation(mutation) => Ok(Planned::Mutation(mutation)),
            Translation::Unsupported(reason) => {
                debug!("no mutation form ({reason}), using DML");
                dml(&classified, stmt)
            }
        },
    }
}

pub(crate) fn execute_ddl<C: DatabaseClient>(client: &C, sql: &str) -> Result<QueryResult> {
    client
        .execute_ddl(sql)
        .map_err(|err| DriverError::FatalDatabase {
            sql: sql.to_string(),
            attempt: 0,
            message: err.to_string(),
        })?;
    Ok(QueryResult::Success("DDL executed".to_string()))
}

/// Per-statement dispatch inside a logical transaction.
pub struct ExecutionRouter;

impl ExecutionRouter {
    /// Routes one statement through `tx`.
    ///
    /// DML and mutations return `QueryResult::Affected`; a mutation counts
    /// one per row. A statement that cannot be classified fails the
    /// transaction.
    pub fn execute<C: DatabaseClient>(
        tx: &LogicalTransaction<C>,
        stmt: &Statement,
    ) -> Result<QueryResult> {
        let planned = plan(tx, stmt).map_err(|err| tx.abandon(err))?;
        match planned {
            Planned::Query => tx.execute_query(stmt),
            Planned::Ddl => execute_ddl(tx.client(), &stmt.sql),
            Planned::Dml(guard) => tx.execute_dml(stmt, guard).map(QueryResult::Affected),
            Planned::Mutation(mutation) => tx.buffer_mutation(&mutation).map(QueryResult::Affected),
        }
    }
}
