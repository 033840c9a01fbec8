//! In-memory `DatabaseClient` with snapshot transactions and fault injection.
//!
//! Each read/write transaction works on a private copy of the committed
//! store. DML is applied to that copy immediately (read-your-writes);
//! buffered mutations are applied only at commit. A commit that finds the
//! store changed since its snapshot is aborted, as a distributed database
//! would abort the loser of a conflict.

use super::{ClientResult, CommitResult, DatabaseClient, QueryResult, TransactionMode};
use crate::classifier::{
    self, find_top_level_keyword, identifier, keyword, parse_filter, qualified_identifier,
    skip_preamble, split_top_level_commas, unqualified, ws, Assignment, DmlShape, Filter,
    InsertVariant, Predicate, StatementKind,
};
use crate::core::{ClientError, Statement, Value};
use crate::mutation::{apply_arithmetic, MutationDescriptor, MutationOp};
use chrono::Utc;
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn db_error(message: impl Into<String>) -> ClientError {
    ClientError::Database(message.into())
}

#[derive(Debug, Clone)]
struct MemTable {
    name: String,
    columns: Vec<String>,
    key: Vec<usize>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Upsert,
    Update,
    InsertOrIgnore,
}

fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.same_as(b)
}

impl MemTable {
    fn column_index(&self, name: &str) -> ClientResult<usize> {
        let name = unqualified(name);
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| db_error(format!("column '{name}' not found in table '{}'", self.name)))
    }

    fn find(&self, key: &[Value]) -> Option<usize> {
        self.rows.iter().position(|row| {
            self.key
                .iter()
                .zip(key)
                .all(|(&i, value)| values_equal(&row[i], value))
        })
    }

    /// Writes one row given as (column index, value) pairs; returns rows affected.
    fn write(&mut self, cells: &[(usize, Value)], mode: WriteMode) -> ClientResult<u64> {
        let mut key = Vec::with_capacity(self.key.len());
        for &k in &self.key {
            match cells.iter().find(|(i, _)| *i == k) {
                Some((_, value)) if !value.is_null() => key.push(value.clone()),
                _ => {
                    return Err(db_error(format!(
                        "missing key column '{}' for table '{}'",
                        self.columns[k], self.name
                    )));
                }
            }
        }

        match (self.find(&key), mode) {
            (Some(_), WriteMode::Insert) => Err(db_error(format!(
                "row with key {} already exists in table '{}'",
                display_key(&key),
                self.name
            ))),
            (Some(_), WriteMode::InsertOrIgnore) => Ok(0),
            (Some(at), WriteMode::Upsert | WriteMode::Update) => {
                for (i, value) in cells {
                    self.rows[at][*i] = value.clone();
                }
                Ok(1)
            }
            (None, WriteMode::Update) => Err(db_error(format!(
                "row with key {} not found in table '{}'",
                display_key(&key),
                self.name
            ))),
            (None, _) => {
                let mut row = vec![Value::Null; self.columns.len()];
                for (i, value) in cells {
                    row[*i] = value.clone();
                }
                self.rows.push(row);
                Ok(1)
            }
        }
    }

    fn matching(&self, filter: &Filter, stmt: &Statement) -> ClientResult<Vec<usize>> {
        let terms = match filter {
            Filter::Absent => return Ok((0..self.rows.len()).collect()),
            Filter::Complex(text) => return Err(db_error(format!("unsupported filter '{text}'"))),
            Filter::Conjunction(predicates) => predicates
                .iter()
                .map(|predicate| match predicate {
                    Predicate::Equals { column, operand } => {
                        Ok((self.column_index(column)?, operand.resolve(stmt)?))
                    }
                    Predicate::Other(text) => Err(db_error(format!("unsupported predicate '{text}'"))),
                })
                .collect::<ClientResult<Vec<_>>>()?,
        };
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| terms.iter().all(|(i, value)| values_equal(&row[*i], value)))
            .map(|(at, _)| at)
            .collect())
    }
}

fn display_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn key_list(text: &str) -> ClientResult<Vec<String>> {
    let text = text.trim();
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| db_error(format!("expected key column list, found '{text}'")))?;
    split_top_level_commas(inner)
        .into_iter()
        .map(|item| {
            let item = item.trim();
            // ASC/DESC suffixes are accepted and ignored
            let name = item.split_whitespace().next().unwrap_or(item);
            identifier(name)
                .map(|(_, name)| name)
                .map_err(|_| db_error(format!("bad key column '{item}'")))
        })
        .collect()
}

/// Committed table data. Hooks attached to a `Fault` receive it to simulate
/// a concurrent writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    version: u64,
    tables: BTreeMap<String, MemTable>,
}

impl MemoryStore {
    /// Bumped by every committed change.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.values().map(|t| t.name.clone()).collect()
    }

    /// Column names and rows of `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Option<(Vec<String>, Vec<Vec<Value>>)> {
        self.table(table)
            .ok()
            .map(|t| (t.columns.clone(), t.rows.clone()))
    }

    fn table(&self, name: &str) -> ClientResult<&MemTable> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| db_error(format!("table '{name}' not found")))
    }

    fn table_mut(&mut self, name: &str) -> ClientResult<&mut MemTable> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| db_error(format!("table '{name}' not found")))
    }

    /// Runs a query or DML statement directly against this store.
    pub fn execute(&mut self, stmt: &Statement) -> ClientResult<QueryResult> {
        let classified = classifier::classify(&stmt.sql, "Version")?;
        match classified.kind {
            StatementKind::Query => self.select(stmt),
            StatementKind::Ddl => Err(db_error("DDL must be sent through execute_ddl")),
            _ => {
                let table = classified
                    .table
                    .ok_or_else(|| db_error("DML without a table"))?;
                let affected = self.apply_dml(stmt, &table, &classified.columns, &classified.shape)?;
                self.version += 1;
                Ok(QueryResult::Affected(affected))
            }
        }
    }

    fn apply_dml(
        &mut self,
        stmt: &Statement,
        table: &str,
        columns: &[String],
        shape: &DmlShape,
    ) -> ClientResult<u64> {
        let target = self.table_mut(table)?;
        match shape {
            DmlShape::Insert { variant, rows } => {
                let rows = rows
                    .as_ref()
                    .ok_or_else(|| db_error("only INSERT ... VALUES is supported"))?;
                let indices = if columns.is_empty() {
                    (0..target.columns.len()).collect()
                } else {
                    columns
                        .iter()
                        .map(|c| target.column_index(c))
                        .collect::<ClientResult<Vec<_>>>()?
                };
                let mode = match variant {
                    InsertVariant::Insert => WriteMode::Insert,
                    InsertVariant::InsertOrUpdate => WriteMode::Upsert,
                    InsertVariant::InsertOrIgnore => WriteMode::InsertOrIgnore,
                };
                let mut affected = 0;
                for row in rows {
                    if row.len() != indices.len() {
                        return Err(db_error("VALUES row does not match the column list"));
                    }
                    let cells = indices
                        .iter()
                        .zip(row)
                        .map(|(&i, operand)| Ok((i, operand.resolve(stmt)?)))
                        .collect::<ClientResult<Vec<_>>>()?;
                    affected += target.write(&cells, mode)?;
                }
                Ok(affected)
            }
            DmlShape::Update { assignments, filter } => {
                let matched = target.matching(filter, stmt)?;
                for &at in &matched {
                    for assignment in assignments {
                        let column = target.column_index(assignment.column())?;
                        let value = match assignment {
                            Assignment::Set { operand, .. } => operand.resolve(stmt)?,
                            Assignment::Arithmetic {
                                source, op, operand, ..
                            } => {
                                let current = &target.rows[at][target.column_index(source)?];
                                let operand = operand.resolve(stmt)?;
                                apply_arithmetic(current, *op, &operand).ok_or_else(|| {
                                    db_error(format!("cannot compute {current} and {operand}"))
                                })?
                            }
                            Assignment::Expression { text, .. } => {
                                return Err(db_error(format!("unsupported expression '{text}'")));
                            }
                        };
                        target.rows[at][column] = value;
                    }
                }
                Ok(matched.len() as u64)
            }
            DmlShape::Delete { filter } => {
                let matched = target.matching(filter, stmt)?;
                for at in matched.iter().rev() {
                    target.rows.remove(*at);
                }
                Ok(matched.len() as u64)
            }
            DmlShape::None => Err(db_error("not a DML statement")),
        }
    }

    fn select(&self, stmt: &Statement) -> ClientResult<QueryResult> {
        let unsupported = || db_error(format!("unsupported query: {}", stmt.sql));
        let body = skip_preamble(&stmt.sql).trim_end().trim_end_matches(';');
        let (rest, _) = ws(keyword("SELECT"))(body).map_err(|_| unsupported())?;
        let from = find_top_level_keyword(rest, "FROM").ok_or_else(unsupported)?;
        let projection = &rest[..from];
        let (rest, table_name) =
            ws(qualified_identifier)(&rest[from + "FROM".len()..]).map_err(|_| unsupported())?;
        let filter = match find_top_level_keyword(rest, "WHERE") {
            Some(at) if rest[..at].trim().is_empty() => parse_filter(&rest[at + "WHERE".len()..]),
            None if rest.trim().is_empty() => Filter::Absent,
            _ => return Err(unsupported()),
        };

        let table = self.table(&table_name)?;
        let matched = table.matching(&filter, stmt)?;

        if projection.trim().eq_ignore_ascii_case("COUNT(*)") {
            return Ok(QueryResult::Rows(
                vec![vec![Value::Integer(matched.len() as i64)]],
                vec!["COUNT(*)".to_string()],
            ));
        }
        let indices: Vec<usize> = if projection.trim() == "*" {
            (0..table.columns.len()).collect()
        } else {
            split_top_level_commas(projection)
                .into_iter()
                .map(|item| table.column_index(item.trim()))
                .collect::<ClientResult<_>>()?
        };
        let rows = matched
            .iter()
            .map(|&at| indices.iter().map(|&i| table.rows[at][i].clone()).collect())
            .collect();
        let columns = indices.iter().map(|&i| table.columns[i].clone()).collect();
        Ok(QueryResult::Rows(rows, columns))
    }

    fn apply_mutation(&mut self, mutation: &MutationDescriptor) -> ClientResult<()> {
        let table = self.table_mut(&mutation.table)?;
        let indices = mutation
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<ClientResult<Vec<_>>>()?;
        for row in &mutation.rows {
            let cells: Vec<(usize, Value)> = indices.iter().copied().zip(row.iter().cloned()).collect();
            match mutation.op {
                MutationOp::Insert => table.write(&cells, WriteMode::Insert)?,
                MutationOp::InsertOrUpdate => table.write(&cells, WriteMode::Upsert)?,
                MutationOp::Update => table.write(&cells, WriteMode::Update)?,
                MutationOp::Delete => {
                    let key = table
                        .key
                        .iter()
                        .map(|k| {
                            cells
                                .iter()
                                .find(|(i, _)| i == k)
                                .map(|(_, v)| v.clone())
                                .ok_or_else(|| db_error("delete mutation is missing a key column"))
                        })
                        .collect::<ClientResult<Vec<_>>>()?;
                    if let Some(at) = table.find(&key) {
                        table.rows.remove(at);
                    }
                    0
                }
            };
        }
        Ok(())
    }

    /// `CREATE TABLE t (cols...) PRIMARY KEY (k...)`, `DROP TABLE t`.
    /// `CREATE INDEX` is accepted and ignored.
    pub fn apply_ddl(&mut self, sql: &str) -> ClientResult<()> {
        let body = skip_preamble(sql).trim_end().trim_end_matches(';');
        if let Ok((rest, _)) = ws(keyword("DROP"))(body) {
            let (rest, _) = ws(keyword("TABLE"))(rest).map_err(|_| db_error(format!("unsupported DDL: {sql}")))?;
            let (_, name) = ws(qualified_identifier)(rest).map_err(|_| db_error("DROP TABLE without a name"))?;
            self.tables
                .remove(&name.to_ascii_lowercase())
                .ok_or_else(|| db_error(format!("table '{name}' not found")))?;
            self.version += 1;
            return Ok(());
        }

        let (rest, _) = ws(keyword("CREATE"))(body).map_err(|_| db_error(format!("unsupported DDL: {sql}")))?;
        let rest = match ws(keyword("UNIQUE"))(rest) {
            Ok((rest, _)) => rest,
            Err(_) => rest,
        };
        if ws(keyword("INDEX"))(rest).is_ok() {
            debug!("ignoring index DDL: {sql}");
            return Ok(());
        }
        let (rest, _) = ws(keyword("TABLE"))(rest).map_err(|_| db_error(format!("unsupported DDL: {sql}")))?;
        let (rest, name) = ws(qualified_identifier)(rest).map_err(|_| db_error("CREATE TABLE without a name"))?;
        if self.tables.contains_key(&name.to_ascii_lowercase()) {
            return Err(db_error(format!("table '{name}' already exists")));
        }

        let open = rest.find('(').ok_or_else(|| db_error("CREATE TABLE without columns"))?;
        let close = matching_paren(rest, open).ok_or_else(|| db_error("unbalanced parentheses"))?;
        let mut columns = Vec::new();
        let mut key_names = Vec::new();
        for item in split_top_level_commas(&rest[open + 1..close]) {
            let item = item.trim();
            if let Ok((list, _)) = ws(keyword("PRIMARY"))(item) {
                let (list, _) = ws(keyword("KEY"))(list).map_err(|_| db_error("expected PRIMARY KEY"))?;
                key_names.extend(key_list(list)?);
                continue;
            }
            let (definition, column) =
                ws(identifier)(item).map_err(|_| db_error(format!("bad column definition '{item}'")))?;
            if find_top_level_keyword(definition, "PRIMARY").is_some() {
                key_names.push(column.clone());
            }
            columns.push(column);
        }
        let trailing = rest[close + 1..].trim();
        if !trailing.is_empty() {
            let (list, _) = ws(keyword("PRIMARY"))(trailing)
                .and_then(|(list, _)| ws(keyword("KEY"))(list))
                .map_err(|_| db_error(format!("unexpected '{trailing}' after column list")))?;
            key_names.extend(key_list(list)?);
        }
        if key_names.is_empty() {
            return Err(db_error(format!("table '{name}' has no primary key")));
        }

        let mut table = MemTable {
            name: name.clone(),
            columns,
            key: Vec::new(),
            rows: Vec::new(),
        };
        table.key = key_names
            .iter()
            .map(|k| table.column_index(k))
            .collect::<ClientResult<_>>()?;
        self.tables.insert(name.to_ascii_lowercase(), table);
        self.version += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Begin,
    Execute,
    ExecuteBatch,
    BufferMutation,
    Commit,
    Rollback,
    SingleUse,
    Ddl,
}

/// One entry of the client's call log.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Begin { tx: u64, mode: TransactionMode },
    Execute { tx: u64, sql: String },
    ExecuteBatch { tx: u64, sql: Vec<String> },
    BufferMutation { tx: u64, op: MutationOp, table: String },
    Commit { tx: u64, mutations: usize },
    Rollback { tx: u64 },
    SingleUse { sql: String },
    Ddl { sql: String },
}

impl ClientCall {
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        match self {
            Self::Begin { .. } => CallKind::Begin,
            Self::Execute { .. } => CallKind::Execute,
            Self::ExecuteBatch { .. } => CallKind::ExecuteBatch,
            Self::BufferMutation { .. } => CallKind::BufferMutation,
            Self::Commit { .. } => CallKind::Commit,
            Self::Rollback { .. } => CallKind::Rollback,
            Self::SingleUse { .. } => CallKind::SingleUse,
            Self::Ddl { .. } => CallKind::Ddl,
        }
    }

    fn matches(&self, fragment: &str) -> bool {
        let contains = |sql: &str| sql.to_ascii_lowercase().contains(&fragment.to_ascii_lowercase());
        match self {
            Self::Execute { sql, .. } | Self::SingleUse { sql } | Self::Ddl { sql } => contains(sql),
            Self::ExecuteBatch { sql, .. } => sql.iter().any(|s| contains(s)),
            Self::BufferMutation { table, .. } => contains(table),
            _ => false,
        }
    }
}

type StoreHook = Box<dyn FnOnce(&mut MemoryStore) + Send>;

/// A one-shot failure injected into the next matching client call.
pub struct Fault {
    call: CallKind,
    skip: usize,
    sql_fragment: Option<String>,
    error: Option<ClientError>,
    stall: Option<Duration>,
    hook: Option<StoreHook>,
}

impl Fault {
    fn new(call: CallKind, error: Option<ClientError>) -> Self {
        Self {
            call,
            skip: 0,
            sql_fragment: None,
            error,
            stall: None,
            hook: None,
        }
    }

    /// The call reports `Aborted`.
    #[must_use]
    pub fn abort(call: CallKind) -> Self {
        Self::new(call, Some(ClientError::aborted("injected abort")))
    }

    /// The call reports a non-retryable database error.
    #[must_use]
    pub fn fatal(call: CallKind, message: impl Into<String>) -> Self {
        Self::new(call, Some(ClientError::Database(message.into())))
    }

    /// The call succeeds after sleeping for `delay`.
    #[must_use]
    pub fn stall(call: CallKind, delay: Duration) -> Self {
        let mut fault = Self::new(call, None);
        fault.stall = Some(delay);
        fault
    }

    /// Lets `n` matching calls through before firing.
    #[must_use]
    pub const fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Only calls whose SQL (or mutation table) contains `fragment` match.
    #[must_use]
    pub fn on_sql(mut self, fragment: impl Into<String>) -> Self {
        self.sql_fragment = Some(fragment.into());
        self
    }

    /// Adds a server retry-delay hint to an injected abort.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        if let Some(ClientError::Aborted { retry_delay, .. }) = &mut self.error {
            *retry_delay = Some(delay);
        }
        self
    }

    /// Runs `hook` on the committed store when the fault fires, before the
    /// call fails.
    #[must_use]
    pub fn with_hook(mut self, hook: impl FnOnce(&mut MemoryStore) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fault")
            .field("call", &self.call)
            .field("skip", &self.skip)
            .field("sql_fragment", &self.sql_fragment)
            .field("error", &self.error)
            .field("stall", &self.stall)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Live transaction handle of `MemoryClient`.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    mode: TransactionMode,
    base_version: u64,
    working: MemoryStore,
    wrote: bool,
    mutations: Vec<MutationDescriptor>,
}

impl MemoryTransaction {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct Inner {
    store: MemoryStore,
    next_tx: u64,
    faults: Vec<Fault>,
    calls: Vec<ClientCall>,
}

impl Inner {
    fn take_fault(&mut self, call: &ClientCall) -> Option<Fault> {
        let kind = call.kind();
        let at = self.faults.iter().position(|f| {
            f.call == kind
                && f.sql_fragment
                    .as_deref()
                    .is_none_or(|fragment| call.matches(fragment))
        })?;
        if self.faults[at].skip > 0 {
            self.faults[at].skip -= 1;
            return None;
        }
        Some(self.faults.remove(at))
    }
}

#[derive(Default)]
pub struct MemoryClient {
    inner: Mutex<Inner>,
}

impl MemoryClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client with the given tables already in place.
    pub fn with_schema(ddl: &[&str]) -> ClientResult<Self> {
        let client = Self::new();
        for sql in ddl {
            client.execute_ddl(sql)?;
        }
        Ok(client)
    }

    fn lock(&self) -> ClientResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| db_error("memory client lock poisoned"))
    }

    /// Logs the call and fires a pending fault for it, if any.
    fn enter(&self, call: ClientCall) -> ClientResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock()?;
        let fault = inner.take_fault(&call);
        inner.calls.push(call);
        let Some(fault) = fault else {
            return Ok(inner);
        };
        debug!("memory client: firing {fault:?}");
        if let Some(hook) = fault.hook {
            hook(&mut inner.store);
        }
        if let Some(delay) = fault.stall {
            drop(inner);
            std::thread::sleep(delay);
            inner = self.lock()?;
        }
        match fault.error {
            Some(err) => Err(err),
            None => Ok(inner),
        }
    }

    pub fn inject(&self, fault: Fault) {
        if let Ok(mut inner) = self.lock() {
            inner.faults.push(fault);
        }
    }

    /// Faults not yet fired.
    #[must_use]
    pub fn pending_faults(&self) -> usize {
        self.lock().map_or(0, |inner| inner.faults.len())
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ClientCall> {
        self.lock().map(|inner| inner.calls.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn count(&self, kind: CallKind) -> usize {
        self.lock()
            .map_or(0, |inner| inner.calls.iter().filter(|c| c.kind() == kind).count())
    }

    pub fn clear_calls(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.calls.clear();
        }
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.lock().map(|inner| inner.store.table_names()).unwrap_or_default()
    }

    /// Committed rows of `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Option<(Vec<String>, Vec<Vec<Value>>)> {
        self.lock().ok().and_then(|inner| inner.store.rows(table))
    }

    /// Auto-committed write by another session; not logged.
    pub fn write(&self, stmt: &Statement) -> ClientResult<u64> {
        let mut inner = self.lock()?;
        let result = inner.store.execute(stmt)?;
        Ok(result.affected().unwrap_or(0))
    }
}

impl DatabaseClient for MemoryClient {
    type Transaction = MemoryTransaction;

    fn begin_transaction(&self, mode: TransactionMode) -> ClientResult<MemoryTransaction> {
        let id = self.lock()?.next_tx + 1;
        let mut inner = self.enter(ClientCall::Begin { tx: id, mode })?;
        inner.next_tx = id;
        Ok(MemoryTransaction {
            id,
            mode,
            base_version: inner.store.version,
            working: inner.store.clone(),
            wrote: false,
            mutations: Vec::new(),
        })
    }

    fn execute(&self, tx: &mut MemoryTransaction, stmt: &Statement) -> ClientResult<QueryResult> {
        let _inner = self.enter(ClientCall::Execute {
            tx: tx.id,
            sql: stmt.sql.clone(),
        })?;
        let kind = classifier::statement_kind(&stmt.sql)?;
        if kind.is_dml() {
            if tx.mode == TransactionMode::ReadOnly {
                return Err(db_error("DML in a read-only transaction"));
            }
            tx.wrote = true;
        }
        tx.working.execute(stmt)
    }

    fn execute_batch(&self, tx: &mut MemoryTransaction, stmts: &[Statement]) -> ClientResult<Vec<u64>> {
        let _inner = self.enter(ClientCall::ExecuteBatch {
            tx: tx.id,
            sql: stmts.iter().map(|s| s.sql.clone()).collect(),
        })?;
        if tx.mode == TransactionMode::ReadOnly {
            return Err(db_error("DML in a read-only transaction"));
        }
        // All or nothing within the call.
        let mut working = tx.working.clone();
        let mut counts = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            if !classifier::statement_kind(&stmt.sql)?.is_dml() {
                return Err(db_error(format!("only DML can be batched: {}", stmt.sql)));
            }
            counts.push(working.execute(stmt)?.affected().unwrap_or(0));
        }
        tx.working = working;
        tx.wrote = true;
        Ok(counts)
    }

    fn buffer_mutation(&self, tx: &mut MemoryTransaction, mutation: &MutationDescriptor) -> ClientResult<()> {
        let _inner = self.enter(ClientCall::BufferMutation {
            tx: tx.id,
            op: mutation.op,
            table: mutation.table.clone(),
        })?;
        if tx.mode == TransactionMode::ReadOnly {
            return Err(db_error("mutation in a read-only transaction"));
        }
        tx.mutations.push(mutation.clone());
        Ok(())
    }

    fn commit(&self, tx: MemoryTransaction) -> ClientResult<CommitResult> {
        let MemoryTransaction {
            id,
            base_version,
            mut working,
            wrote,
            mutations,
            ..
        } = tx;
        let mut inner = self.enter(ClientCall::Commit {
            tx: id,
            mutations: mutations.len(),
        })?;
        if !wrote && mutations.is_empty() {
            return Ok(CommitResult {
                commit_timestamp: Some(Utc::now()),
            });
        }
        if inner.store.version != base_version {
            return Err(ClientError::aborted(format!(
                "transaction {id} conflicts with a concurrent commit"
            )));
        }
        for mutation in &mutations {
            working.apply_mutation(mutation)?;
        }
        working.version = inner.store.version + 1;
        inner.store = working;
        Ok(CommitResult {
            commit_timestamp: Some(Utc::now()),
        })
    }

    fn rollback(&self, tx: MemoryTransaction) -> ClientResult<()> {
        let _inner = self.enter(ClientCall::Rollback { tx: tx.id })?;
        Ok(())
    }

    fn execute_single_use(&self, stmt: &Statement) -> ClientResult<QueryResult> {
        let inner = self.enter(ClientCall::SingleUse {
            sql: stmt.sql.clone(),
        })?;
        if classifier::statement_kind(&stmt.sql)? != StatementKind::Query {
            return Err(db_error("single-use transactions are read-only"));
        }
        inner.store.select(stmt)
    }

    fn execute_ddl(&self, sql: &str) -> ClientResult<()> {
        let mut inner = self.enter(ClientCall::Ddl {
            sql: sql.to_string(),
        })?;
        inner.store.apply_ddl(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNTS: &str =
        "CREATE TABLE Accounts (Id INT64 NOT NULL, Balance INT64, Version INT64) PRIMARY KEY (Id)";

    fn client() -> MemoryClient {
        let client = MemoryClient::with_schema(&[ACCOUNTS]).unwrap();
        client
            .write(&Statement::new(
                "INSERT INTO Accounts (Id, Balance, Version) VALUES (1, 1000, 5), (2, 50, 1)",
            ))
            .unwrap();
        client
    }

    #[test]
    fn test_create_table_variants() {
        let mut store = MemoryStore::default();
        store
            .apply_ddl("CREATE TABLE Singers (SingerId INT64 NOT NULL, Name STRING(MAX)) PRIMARY KEY (SingerId)")
            .unwrap();
        store.apply_ddl("create table Notes (Id INT64 PRIMARY KEY, Body STRING(100))").unwrap();
        store.apply_ddl("CREATE INDEX idx ON Singers (Name)").unwrap();
        assert_eq!(store.table_names(), vec!["Notes", "Singers"]);
        assert!(store.apply_ddl("CREATE TABLE NoKey (Id INT64)").is_err());
        store.apply_ddl("DROP TABLE Notes").unwrap();
        assert_eq!(store.table_names(), vec!["Singers"]);
    }

    #[test]
    fn test_dml_and_select() {
        let mut store = MemoryStore::default();
        store.apply_ddl(ACCOUNTS).unwrap();
        let insert = Statement::new("INSERT INTO Accounts (Id, Balance, Version) VALUES (@id, 10, 1)").bind("id", 7);
        assert_eq!(store.execute(&insert).unwrap(), QueryResult::Affected(1));
        assert!(store.execute(&insert).is_err());

        let update = Statement::new("UPDATE Accounts SET Balance = Balance - 4, Version = 2 WHERE Id = 7 AND Version = 1");
        assert_eq!(store.execute(&update).unwrap(), QueryResult::Affected(1));
        assert_eq!(store.execute(&update).unwrap(), QueryResult::Affected(0));

        let select = Statement::new("SELECT Balance, Version FROM Accounts WHERE Id = $1")
            .bind("p1", 7);
        assert_eq!(
            store.execute(&select).unwrap().rows(),
            &[vec![Value::Integer(6), Value::Integer(2)]]
        );

        let count = store.execute(&Statement::new("SELECT COUNT(*) FROM Accounts")).unwrap();
        assert_eq!(count.rows(), &[vec![Value::Integer(1)]]);

        let delete = Statement::new("DELETE FROM Accounts WHERE Id = 7");
        assert_eq!(store.execute(&delete).unwrap(), QueryResult::Affected(1));
    }

    #[test]
    fn test_transaction_isolation_and_commit() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        client
            .execute(&mut tx, &Statement::new("UPDATE Accounts SET Balance = 0 WHERE Id = 1"))
            .unwrap();
        let seen = client
            .execute(&mut tx, &Statement::new("SELECT Balance FROM Accounts WHERE Id = 1"))
            .unwrap();
        assert_eq!(seen.rows(), &[vec![Value::Integer(0)]]);
        assert_eq!(client.rows("Accounts").unwrap().1[0][1], Value::Integer(1000));

        client.commit(tx).unwrap();
        assert_eq!(client.rows("Accounts").unwrap().1[0][1], Value::Integer(0));
    }

    #[test]
    fn test_concurrent_commit_aborts() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        client
            .execute(&mut tx, &Statement::new("UPDATE Accounts SET Balance = 0 WHERE Id = 1"))
            .unwrap();
        client
            .write(&Statement::new("UPDATE Accounts SET Balance = 1 WHERE Id = 2"))
            .unwrap();
        assert!(client.commit(tx).unwrap_err().is_aborted());
    }

    #[test]
    fn test_mutations_apply_at_commit() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        let mutation = MutationDescriptor {
            op: MutationOp::Update,
            table: "Accounts".to_string(),
            columns: vec!["Id".to_string(), "Balance".to_string()],
            rows: vec![vec![Value::Integer(2), Value::Integer(75)]],
            locking_read: None,
        };
        client.buffer_mutation(&mut tx, &mutation).unwrap();
        let before = client
            .execute(&mut tx, &Statement::new("SELECT Balance FROM Accounts WHERE Id = 2"))
            .unwrap();
        assert_eq!(before.rows(), &[vec![Value::Integer(50)]]);
        client.commit(tx).unwrap();
        assert_eq!(client.rows("Accounts").unwrap().1[1][1], Value::Integer(75));
        assert!(matches!(
            client.calls().last(),
            Some(ClientCall::Commit { mutations: 1, .. })
        ));
    }

    #[test]
    fn test_update_mutation_requires_row() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        let mutation = MutationDescriptor {
            op: MutationOp::Update,
            table: "Accounts".to_string(),
            columns: vec!["Id".to_string(), "Balance".to_string()],
            rows: vec![vec![Value::Integer(99), Value::Integer(1)]],
            locking_read: None,
        };
        client.buffer_mutation(&mut tx, &mutation).unwrap();
        assert!(matches!(client.commit(tx), Err(ClientError::Database(_))));
    }

    #[test]
    fn test_fault_fires_once_after_skips() {
        let client = client();
        client.inject(Fault::abort(CallKind::Execute).after(1).on_sql("Balance"));
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        let select = Statement::new("SELECT Balance FROM Accounts");
        assert!(client.execute(&mut tx, &Statement::new("SELECT Id FROM Accounts")).is_ok());
        assert!(client.execute(&mut tx, &select).is_ok());
        assert!(client.execute(&mut tx, &select).unwrap_err().is_aborted());
        assert!(client.execute(&mut tx, &select).is_ok());
        assert_eq!(client.pending_faults(), 0);
        assert_eq!(client.count(CallKind::Execute), 4);
    }

    #[test]
    fn test_fault_hook_changes_committed_store() {
        let client = client();
        client.inject(Fault::abort(CallKind::Commit).with_hook(|store| {
            store
                .execute(&Statement::new("UPDATE Accounts SET Version = 6 WHERE Id = 1"))
                .unwrap();
        }));
        let tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        assert!(client.commit(tx).unwrap_err().is_aborted());
        assert_eq!(client.rows("Accounts").unwrap().1[0][2], Value::Integer(6));
    }

    #[test]
    fn test_batch_is_atomic() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadWrite).unwrap();
        let result = client.execute_batch(
            &mut tx,
            &[
                Statement::new("UPDATE Accounts SET Balance = 0 WHERE Id = 1"),
                Statement::new("INSERT INTO Accounts (Id) VALUES (2)"),
            ],
        );
        assert!(result.is_err());
        let balance = client
            .execute(&mut tx, &Statement::new("SELECT Balance FROM Accounts WHERE Id = 1"))
            .unwrap();
        assert_eq!(balance.rows(), &[vec![Value::Integer(1000)]]);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let client = client();
        let mut tx = client.begin_transaction(TransactionMode::ReadOnly).unwrap();
        assert!(client
            .execute(&mut tx, &Statement::new("DELETE FROM Accounts WHERE Id = 1"))
            .is_err());
    }
}
