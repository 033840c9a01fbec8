//! Translation of classified DML into buffered mutations.
//!
//! A mutation carries no WHERE clause, so a version-checked UPDATE/DELETE
//! or an arithmetic UPDATE gets a companion locking read: run inside the
//! same transaction attempt it returns the current version for a
//! client-side comparison and the values the new ones are computed from,
//! and locks the row until the attempt commits or aborts.

use crate::classifier::{
    ArithOp, Assignment, ClassifiedStatement, DmlShape, Filter, InsertVariant, Operand, Predicate,
    VersionPredicate,
};
use crate::client::QueryResult;
use crate::core::{DriverError, Result, Statement, Value};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOp {
    Insert,
    InsertOrUpdate,
    Update,
    Delete,
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Insert => "Insert",
            Self::InsertOrUpdate => "InsertOrUpdate",
            Self::Update => "Update",
            Self::Delete => "Delete",
        };
        write!(f, "{name}")
    }
}

/// Expected value of the version column.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: String,
    pub expected: Value,
}

impl VersionCheck {
    fn conflict(&self, table: &str, found: String) -> DriverError {
        DriverError::OptimisticConcurrency {
            table: table.to_string(),
            column: self.column.clone(),
            expected: self.expected.to_string(),
            found,
        }
    }

    /// Compares the locked row's version with the expected one.
    pub fn verify(&self, table: &str, current: Option<&Value>) -> Result<()> {
        match current {
            Some(current) if current.same_as(&self.expected) => Ok(()),
            Some(current) => Err(self.conflict(table, current.to_string())),
            None => Err(self.conflict(table, "no value".to_string())),
        }
    }
}

/// `column = source +/- operand`, computed from the locked row.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedValue {
    /// Index into the descriptor's columns.
    pub position: usize,
    pub source: String,
    pub op: ArithOp,
    pub operand: Value,
}

/// Read run inside the attempt before a mutation is buffered. It locks the
/// row and returns the current version plus the current values that
/// arithmetic SET clauses build on.
#[derive(Debug, Clone, PartialEq)]
pub struct LockingRead {
    /// Selects the version column, if checked, then each derived source.
    pub statement: Statement,
    pub version: Option<VersionCheck>,
    pub derived: Vec<DerivedValue>,
}

impl LockingRead {
    fn build(
        table: &str,
        key: &[(String, Value)],
        version: Option<VersionCheck>,
        derived: Vec<DerivedValue>,
    ) -> Option<Self> {
        if version.is_none() && derived.is_empty() {
            return None;
        }
        let columns: Vec<&str> = version
            .iter()
            .map(|v| v.column.as_str())
            .chain(derived.iter().map(|d| d.source.as_str()))
            .collect();
        let statement = locking_read(table, key, &columns);
        Some(Self {
            statement,
            version,
            derived,
        })
    }

    /// Checks the version and fills in derived values, returning the
    /// descriptor to buffer.
    ///
    /// A missing row fails a versioned check: an update carrying a version
    /// predicate is only valid for a row that already exists. Without one
    /// the mutation touches no rows, as the DML would.
    pub fn resolve(&self, mutation: &MutationDescriptor, result: &QueryResult) -> Result<MutationDescriptor> {
        let QueryResult::Rows(rows, _) = result else {
            return Err(DriverError::Internal(format!(
                "locking read on '{}' did not return rows",
                mutation.table
            )));
        };
        let mut resolved = MutationDescriptor {
            locking_read: None,
            ..mutation.clone()
        };
        let row = match rows.as_slice() {
            [] => {
                if let Some(version) = &self.version {
                    return Err(version.conflict(&mutation.table, "no row".to_string()));
                }
                resolved.rows.clear();
                return Ok(resolved);
            }
            [row] => row,
            _ => {
                return Err(DriverError::malformed(
                    &self.statement.sql,
                    format!("key predicates matched {} rows", rows.len()),
                ));
            }
        };

        let mut values = row.iter();
        if let Some(version) = &self.version {
            version.verify(&mutation.table, values.next())?;
        }
        for derived in &self.derived {
            let Some(current) = values.next() else {
                return Err(DriverError::malformed(
                    &self.statement.sql,
                    format!("locking read returned no value for {}", derived.source),
                ));
            };
            let value = apply_arithmetic(current, derived.op, &derived.operand).ok_or_else(|| {
                DriverError::malformed(
                    &self.statement.sql,
                    format!("cannot compute {current} and {}", derived.operand),
                )
            })?;
            for cells in &mut resolved.rows {
                if let Some(cell) = cells.get_mut(derived.position) {
                    *cell = value.clone();
                }
            }
        }
        Ok(resolved)
    }
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Numeric(d) => Some(*d),
        other => other.as_int().map(Decimal::from),
    }
}

/// `current +/- operand` with SQL null propagation. `None` on overflow or
/// non-numeric input.
#[must_use]
pub fn apply_arithmetic(current: &Value, op: ArithOp, operand: &Value) -> Option<Value> {
    if current.is_null() || operand.is_null() {
        return Some(Value::Null);
    }
    if let (Some(a), Some(b)) = (current.as_int(), operand.as_int()) {
        let result = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Subtract => a.checked_sub(b),
        };
        return result.map(Value::Integer);
    }
    if matches!(current, Value::Numeric(_)) || matches!(operand, Value::Numeric(_)) {
        let (a, b) = (to_decimal(current)?, to_decimal(operand)?);
        let result = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Subtract => a.checked_sub(b),
        };
        return result.map(Value::Numeric);
    }
    let (a, b) = (current.as_f64()?, operand.as_f64()?);
    Some(Value::Real(match op {
        ArithOp::Add => a + b,
        ArithOp::Subtract => a - b,
    }))
}

/// Version predicate of a statement sent as DML. The database applies the
/// predicate itself, so a 0-row result is the conflict signal.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGuard {
    pub table: String,
    pub column: String,
    pub expected: Value,
}

impl VersionGuard {
    pub fn for_statement(classified: &ClassifiedStatement, stmt: &Statement) -> Result<Option<Self>> {
        let (Some(table), Some(predicate)) = (&classified.table, &classified.version_predicate) else {
            return Ok(None);
        };
        Ok(Some(Self {
            table: table.clone(),
            column: predicate.column.clone(),
            expected: predicate.operand.resolve(stmt)?,
        }))
    }

    pub fn check(&self, affected: u64) -> Result<()> {
        if affected > 0 {
            return Ok(());
        }
        Err(DriverError::OptimisticConcurrency {
            table: self.table.clone(),
            column: self.column.clone(),
            expected: self.expected.to_string(),
            found: "no matching row".to_string(),
        })
    }
}

/// A buffered row operation derived from a DML statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDescriptor {
    pub op: MutationOp,
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub locking_read: Option<LockingRead>,
}

impl MutationDescriptor {
    /// Mutations report one affected row per row, never a match count.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Mutation(MutationDescriptor),
    /// The statement has no mutation equivalent and must go through DML.
    Unsupported(String),
}

fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| {
            if part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && part.chars().next().is_some_and(|c| !c.is_ascii_digit())
            {
                part.to_string()
            } else {
                format!("`{part}`")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// `SELECT <c1>, <c2> FROM <table> WHERE <k1> = @k1 AND ...`
#[must_use]
pub fn locking_read(table: &str, key: &[(String, Value)], columns: &[&str]) -> Statement {
    let predicates = key
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{} = @k{}", quote_ident(column), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let selected = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {selected} FROM {} WHERE {predicates}", quote_ident(table));
    key.iter()
        .enumerate()
        .fold(Statement::new(sql), |stmt, (i, (_, value))| {
            stmt.bind(format!("k{}", i + 1), value.clone())
        })
}

// Key equalities of a filter, excluding the version predicate's column.
fn key_predicates<'a>(
    filter: &'a Filter,
    version_column: Option<&str>,
) -> std::result::Result<Vec<(&'a str, &'a Operand)>, String> {
    let predicates = match filter {
        Filter::Absent => return Err("no WHERE clause identifies the row".to_string()),
        Filter::Complex(text) => return Err(format!("WHERE clause '{text}' is not a conjunction")),
        Filter::Conjunction(predicates) => predicates,
    };
    let mut key = Vec::new();
    for predicate in predicates {
        match predicate {
            Predicate::Equals { column, .. }
                if version_column.is_some_and(|v| v.eq_ignore_ascii_case(column)) => {}
            Predicate::Equals { column, operand } => key.push((column.as_str(), operand)),
            Predicate::Other(text) => {
                return Err(format!("WHERE term '{text}' is not a key equality"));
            }
        }
    }
    if key.is_empty() {
        return Err("no key predicates in WHERE clause".to_string());
    }
    Ok(key)
}

fn resolve_key(stmt: &Statement, key: &[(&str, &Operand)]) -> Result<Vec<(String, Value)>> {
    key.iter()
        .map(|(column, operand)| Ok(((*column).to_string(), operand.resolve(stmt)?)))
        .collect()
}

fn version_check(predicate: &VersionPredicate, stmt: &Statement) -> Result<VersionCheck> {
    Ok(VersionCheck {
        column: predicate.column.clone(),
        expected: predicate.operand.resolve(stmt)?,
    })
}

/// Translates a classified DML statement and its bound values into a
/// mutation descriptor.
pub fn translate(classified: &ClassifiedStatement, stmt: &Statement) -> Result<Translation> {
    let Some(table) = classified.table.clone() else {
        return Ok(Translation::Unsupported("statement has no target table".to_string()));
    };
    let version = classified.version_predicate.as_ref();

    match &classified.shape {
        DmlShape::None => Ok(Translation::Unsupported(format!(
            "{} statements have no mutation form",
            classified.kind
        ))),
        DmlShape::Insert { variant, rows } => {
            let op = match variant {
                InsertVariant::Insert => MutationOp::Insert,
                InsertVariant::InsertOrUpdate => MutationOp::InsertOrUpdate,
                InsertVariant::InsertOrIgnore => {
                    return Ok(Translation::Unsupported(
                        "INSERT OR IGNORE has no mutation equivalent".to_string(),
                    ));
                }
            };
            if classified.columns.is_empty() {
                return Ok(Translation::Unsupported("INSERT without a column list".to_string()));
            }
            let Some(rows) = rows else {
                return Ok(Translation::Unsupported("INSERT without a VALUES list".to_string()));
            };
            let rows = rows
                .iter()
                .map(|row| row.iter().map(|operand| operand.resolve(stmt)).collect())
                .collect::<Result<Vec<Vec<Value>>>>()?;
            Ok(Translation::Mutation(MutationDescriptor {
                op,
                table,
                columns: classified.columns.clone(),
                rows,
                locking_read: None,
            }))
        }
        DmlShape::Update { assignments, filter } => {
            let key = match key_predicates(filter, version.map(|v| v.column.as_str())) {
                Ok(key) => key,
                Err(reason) => return Ok(Translation::Unsupported(reason)),
            };
            let mut set = Vec::with_capacity(assignments.len());
            let mut derived = Vec::new();
            for assignment in assignments {
                let column = assignment.column();
                if key.iter().any(|(k, _)| k.eq_ignore_ascii_case(column)) {
                    return Ok(Translation::Unsupported(format!("SET changes key column {column}")));
                }
                let value = match assignment {
                    Assignment::Set { operand, .. } => operand.resolve(stmt)?,
                    Assignment::Arithmetic {
                        source, op, operand, ..
                    } => {
                        derived.push(DerivedValue {
                            position: key.len() + set.len(),
                            source: source.clone(),
                            op: *op,
                            operand: operand.resolve(stmt)?,
                        });
                        // Filled in from the locking read
                        Value::Null
                    }
                    Assignment::Expression { .. } => {
                        return Ok(Translation::Unsupported(format!(
                            "SET {column} is not a plain value or arithmetic"
                        )));
                    }
                };
                set.push((column.to_string(), value));
            }

            let key = resolve_key(stmt, &key)?;
            let version = version.map(|v| version_check(v, stmt)).transpose()?;
            // A version predicate or a computed value means the row must
            // already exist.
            let op = if version.is_some() || !derived.is_empty() {
                MutationOp::Update
            } else {
                MutationOp::InsertOrUpdate
            };
            let locking_read = LockingRead::build(&table, &key, version, derived);
            let (columns, row): (Vec<String>, Vec<Value>) = key.into_iter().chain(set).unzip();
            Ok(Translation::Mutation(MutationDescriptor {
                op,
                table,
                columns,
                rows: vec![row],
                locking_read,
            }))
        }
        DmlShape::Delete { filter } => {
            let key = match key_predicates(filter, version.map(|v| v.column.as_str())) {
                Ok(key) => key,
                Err(reason) => return Ok(Translation::Unsupported(reason)),
            };
            let key = resolve_key(stmt, &key)?;
            let version = version.map(|v| version_check(v, stmt)).transpose()?;
            let locking_read = LockingRead::build(&table, &key, version, Vec::new());
            let (columns, row): (Vec<String>, Vec<Value>) = key.into_iter().unzip();
            Ok(Translation::Mutation(MutationDescriptor {
                op: MutationOp::Delete,
                table,
                columns,
                rows: vec![row],
                locking_read,
            }))
        }
    }
}
