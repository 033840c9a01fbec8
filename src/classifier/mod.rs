//! Statement classification: statement kind by leading keyword, and for DML
//! the target table, columns, row/assignment/filter shape and any
//! optimistic-concurrency version predicate.
//!
//! Classification is a pure function of the SQL text and the configured
//! version column; calling it twice yields identical results.

mod clauses;
mod common;
mod dml;

use crate::core::{DriverError, ParamRef, Result, Statement, Value};

pub(crate) use clauses::{find_top_level_keyword, parse_filter, skip_preamble, split_top_level_commas};
pub(crate) use common::{identifier, keyword, qualified_identifier, unqualified, ws};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Query,
    InsertLikeDml,
    UpdateDml,
    DeleteDml,
    Ddl,
}

impl StatementKind {
    #[must_use]
    pub const fn is_dml(self) -> bool {
        matches!(self, Self::InsertLikeDml | Self::UpdateDml | Self::DeleteDml)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::InsertLikeDml => "insert",
            Self::UpdateDml => "update",
            Self::DeleteDml => "delete",
            Self::Ddl => "DDL",
        };
        write!(f, "{name}")
    }
}

/// A value position in SQL text: a placeholder or an inline literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Param(ParamRef),
    Literal(Value),
}

impl Operand {
    /// Resolves the operand against the statement's bound parameters.
    pub fn resolve(&self, stmt: &Statement) -> Result<Value> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Param(reference) => stmt.param(reference).cloned().ok_or_else(|| {
                DriverError::malformed(&stmt.sql, format!("parameter {reference} is not bound"))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertVariant {
    Insert,
    InsertOrUpdate,
    InsertOrIgnore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// `col = @p` / `col = 'x'`
    Set { column: String, operand: Operand },
    /// `col = other ± operand`
    Arithmetic {
        column: String,
        source: String,
        op: ArithOp,
        operand: Operand,
    },
    /// Anything else; never translatable to a mutation.
    Expression { column: String, text: String },
}

impl Assignment {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Set { column, .. }
            | Self::Arithmetic { column, .. }
            | Self::Expression { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals { column: String, operand: Operand },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Absent,
    /// Top-level `AND` of terms.
    Conjunction(Vec<Predicate>),
    /// Contains a top-level `OR` or otherwise unsplittable text.
    Complex(String),
}

/// Equality predicate on the version column, e.g. `Version = @p3`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionPredicate {
    pub column: String,
    pub operand: Operand,
}

impl VersionPredicate {
    /// Index of the bound parameter carrying the expected version, if the
    /// predicate compares against a placeholder.
    #[must_use]
    pub fn param_index(&self, stmt: &Statement) -> Option<usize> {
        match &self.operand {
            Operand::Param(reference) => reference.index_in(&stmt.params),
            Operand::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DmlShape {
    None,
    Insert {
        variant: InsertVariant,
        /// `None` for `INSERT ... SELECT` or trailing clauses.
        rows: Option<Vec<Vec<Operand>>>,
    },
    Update {
        assignments: Vec<Assignment>,
        filter: Filter,
    },
    Delete {
        filter: Filter,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedStatement {
    pub kind: StatementKind,
    pub table: Option<String>,
    /// INSERT target columns or UPDATE SET columns.
    pub columns: Vec<String>,
    pub version_predicate: Option<VersionPredicate>,
    pub shape: DmlShape,
}

impl ClassifiedStatement {
    const fn bare(kind: StatementKind) -> Self {
        Self {
            kind,
            table: None,
            columns: Vec::new(),
            version_predicate: None,
            shape: DmlShape::None,
        }
    }
}

/// Statement kind from the leading keyword alone.
pub fn statement_kind(sql: &str) -> Result<StatementKind> {
    let body = clauses::skip_preamble(sql);
    if body.starts_with('(') {
        return Ok(StatementKind::Query);
    }
    let word = body
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();
    match word.as_str() {
        "SELECT" | "WITH" => Ok(StatementKind::Query),
        "INSERT" => Ok(StatementKind::InsertLikeDml),
        "UPDATE" => Ok(StatementKind::UpdateDml),
        "DELETE" => Ok(StatementKind::DeleteDml),
        "CREATE" | "ALTER" | "DROP" => Ok(StatementKind::Ddl),
        "" => Err(DriverError::malformed(sql, "empty statement")),
        other => Err(DriverError::malformed(
            sql,
            format!("unrecognized leading keyword '{other}'"),
        )),
    }
}

/// Classifies `sql`, extracting DML structure and the predicate on
/// `version_column`.
pub fn classify(sql: &str, version_column: &str) -> Result<ClassifiedStatement> {
    let kind = statement_kind(sql)?;
    let body = clauses::skip_preamble(sql)
        .trim_end()
        .trim_end_matches(';')
        .trim_end();

    match kind {
        StatementKind::Query | StatementKind::Ddl => Ok(ClassifiedStatement::bare(kind)),
        StatementKind::InsertLikeDml => dml::classify_insert(sql, body),
        StatementKind::UpdateDml => dml::classify_update(sql, body, version_column),
        StatementKind::DeleteDml => dml::classify_delete(sql, body, version_column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_by_leading_keyword() {
        assert_eq!(statement_kind("select 1").unwrap(), StatementKind::Query);
        assert_eq!(statement_kind("WITH x AS (SELECT 1) SELECT * FROM x").unwrap(), StatementKind::Query);
        assert_eq!(statement_kind("(SELECT 1) UNION ALL (SELECT 2)").unwrap(), StatementKind::Query);
        assert_eq!(statement_kind("/* hint */ INSERT INTO t (a) VALUES (1)").unwrap(), StatementKind::InsertLikeDml);
        assert_eq!(statement_kind("CREATE TABLE t (id INT64) PRIMARY KEY (id)").unwrap(), StatementKind::Ddl);
        assert_eq!(statement_kind("drop index idx").unwrap(), StatementKind::Ddl);
        assert!(matches!(statement_kind("BEGIN"), Err(DriverError::MalformedStatement { .. })));
        assert!(matches!(statement_kind("   "), Err(DriverError::MalformedStatement { .. })));
    }

    #[test]
    fn test_classify_insert() {
        let c = classify("INSERT INTO Singers (Id, Name) VALUES (@p1, @p2), (3, 'x');", "Version").unwrap();
        assert_eq!(c.kind, StatementKind::InsertLikeDml);
        assert_eq!(c.table.as_deref(), Some("Singers"));
        assert_eq!(c.columns, vec!["Id", "Name"]);
        let DmlShape::Insert { variant, rows: Some(rows) } = c.shape else {
            panic!("expected insert rows");
        };
        assert_eq!(variant, InsertVariant::Insert);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], Operand::Literal(Value::Text("x".to_string())));
    }

    #[test]
    fn test_classify_insert_variants() {
        let c = classify("INSERT OR UPDATE Singers (Id) VALUES ($1)", "Version").unwrap();
        assert!(matches!(c.shape, DmlShape::Insert { variant: InsertVariant::InsertOrUpdate, .. }));
        assert_eq!(c.table.as_deref(), Some("Singers"));

        let c = classify("insert or ignore into `Singers` (Id) values (1)", "Version").unwrap();
        assert!(matches!(c.shape, DmlShape::Insert { variant: InsertVariant::InsertOrIgnore, .. }));

        let c = classify("INSERT INTO Archive (Id) SELECT Id FROM Singers", "Version").unwrap();
        assert!(matches!(c.shape, DmlShape::Insert { rows: None, .. }));
    }

    #[test]
    fn test_classify_insert_arity_mismatch() {
        let err = classify("INSERT INTO t (a, b) VALUES (1)", "Version").unwrap_err();
        assert!(matches!(err, DriverError::MalformedStatement { .. }));
    }

    #[test]
    fn test_missing_table_is_malformed() {
        for sql in ["INSERT INTO VALUES (1)", "UPDATE SET a = 1", "DELETE FROM", "DELETE WHERE Id = 1"] {
            let err = classify(sql, "Version").unwrap_err();
            assert!(matches!(err, DriverError::MalformedStatement { .. }), "{sql}");
        }
        assert!(classify("UPDATE Accounts WHERE Id = 1", "Version").is_err());
    }

    #[test]
    fn test_classify_versioned_update() {
        let sql = "UPDATE Accounts SET Balance = @p1, Version = @p2 WHERE Id = @p3 AND Version = @p4";
        let c = classify(sql, "Version").unwrap();
        assert_eq!(c.kind, StatementKind::UpdateDml);
        assert_eq!(c.columns, vec!["Balance", "Version"]);
        let predicate = c.version_predicate.clone().unwrap();
        assert_eq!(predicate.column, "Version");
        assert_eq!(predicate.operand, Operand::Param(ParamRef::Named("p4".to_string())));

        let stmt = Statement::new(sql)
            .bind("p1", 10)
            .bind("p2", 6)
            .bind("p3", 1)
            .bind("p4", 5);
        assert_eq!(predicate.param_index(&stmt), Some(3));
    }

    #[test]
    fn test_classify_literal_version_update() {
        let c = classify("UPDATE Accounts SET Balance=Balance-100 WHERE Id=1 AND Version=5", "Version").unwrap();
        let predicate = c.version_predicate.unwrap();
        assert_eq!(predicate.operand, Operand::Literal(Value::Integer(5)));
        let DmlShape::Update { assignments, .. } = c.shape else {
            panic!("expected update");
        };
        assert!(matches!(assignments[0], Assignment::Arithmetic { .. }));
    }

    #[test]
    fn test_update_with_alias() {
        let c = classify("UPDATE Accounts AS a SET a.Balance = 1 WHERE a.Id = 2", "Version").unwrap();
        assert_eq!(c.table.as_deref(), Some("Accounts"));
        assert_eq!(c.columns, vec!["Balance"]);
    }

    #[test]
    fn test_version_predicate_ignored_under_or() {
        let c = classify("DELETE FROM Accounts WHERE Id = 1 OR Version = 5", "Version").unwrap();
        assert!(c.version_predicate.is_none());
        assert!(matches!(c.shape, DmlShape::Delete { filter: Filter::Complex(_) }));
    }

    #[test]
    fn test_classify_delete() {
        let c = classify("DELETE Accounts WHERE Id = $1 AND Version = $2", "version").unwrap();
        assert_eq!(c.kind, StatementKind::DeleteDml);
        assert_eq!(c.table.as_deref(), Some("Accounts"));
        assert!(c.version_predicate.is_some());

        let c = classify("DELETE FROM Accounts", "Version").unwrap();
        assert!(matches!(c.shape, DmlShape::Delete { filter: Filter::Absent }));
    }

    #[test]
    fn test_classify_is_idempotent() {
        for sql in [
            "UPDATE Accounts SET Balance=Balance-100 WHERE Id=1 AND Version=5",
            "INSERT INTO Singers (Id, Name) VALUES (@p1, @p2)",
            "SELECT * FROM Singers",
            "DELETE FROM Singers WHERE Id = 1",
        ] {
            assert_eq!(classify(sql, "Version").unwrap(), classify(sql, "Version").unwrap());
        }
    }

    #[test]
    fn test_unbound_operand_is_malformed() {
        let stmt = Statement::new("DELETE FROM t WHERE Id = @missing");
        let operand = Operand::Param(ParamRef::Named("missing".to_string()));
        assert!(matches!(operand.resolve(&stmt), Err(DriverError::MalformedStatement { .. })));
    }
}
