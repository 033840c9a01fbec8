use crate::client::QueryResult;
use crate::core::{Result, Statement};
use crate::mutation::{MutationDescriptor, VersionGuard};
use sha2::{Digest, Sha256};

/// What the caller observed from one statement, compared on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Count(u64),
    /// Row count plus SHA-256 of the bincode-encoded rows and column names.
    Rows { count: usize, checksum: [u8; 32] },
    Done,
}

impl Outcome {
    pub fn of(result: &QueryResult) -> Result<Self> {
        Ok(match result {
            QueryResult::Affected(n) => Self::Count(*n),
            QueryResult::Rows(rows, columns) => {
                let bytes = bincode::serialize(&(rows, columns))?;
                Self::Rows {
                    count: rows.len(),
                    checksum: Sha256::digest(&bytes).into(),
                }
            }
            QueryResult::Success(_) => Self::Done,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEntry {
    Statement {
        stmt: Statement,
        outcome: Outcome,
        guard: Option<VersionGuard>,
    },
    Batch {
        stmts: Vec<Statement>,
        counts: Vec<u64>,
        guards: Vec<Option<VersionGuard>>,
    },
    /// Replayed by re-running the locking read and re-buffering. `count`
    /// is the rows the resolved mutation touched.
    Mutation {
        mutation: MutationDescriptor,
        count: u64,
    },
}

impl ReplayEntry {
    /// SQL for error context; the first statement of a batch, or the
    /// locking read of a mutation that has one.
    #[must_use]
    pub fn sql(&self) -> &str {
        match self {
            Self::Statement { stmt, .. } => &stmt.sql,
            Self::Batch { stmts, .. } => stmts.first().map_or("", |s| s.sql.as_str()),
            Self::Mutation { mutation, .. } => mutation
                .locking_read
                .as_ref()
                .map_or(mutation.table.as_str(), |read| read.statement.sql.as_str()),
        }
    }
}

/// Ordered record of everything one logical transaction has done so far.
/// Entries are appended after they succeed and are never reordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayLog {
    entries: Vec<ReplayEntry>,
}

impl ReplayLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ReplayEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReplayEntry> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, ReplayEntry> {
        self.entries.iter_mut()
    }

    /// Affected-row counts in execution order, one per statement or
    /// mutation. Queries are skipped.
    #[must_use]
    pub fn counts(&self) -> Vec<u64> {
        self.entries
            .iter()
            .flat_map(|entry| match entry {
                ReplayEntry::Statement {
                    outcome: Outcome::Count(n),
                    ..
                } => vec![*n],
                ReplayEntry::Statement { .. } => Vec::new(),
                ReplayEntry::Batch { counts, .. } => counts.clone(),
                ReplayEntry::Mutation { count, .. } => vec![*count],
            })
            .collect()
    }

    /// Number of statements that replay sends to the database.
    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry {
                ReplayEntry::Statement { .. } => 1,
                ReplayEntry::Batch { stmts, .. } => stmts.len(),
                ReplayEntry::Mutation { mutation, .. } => usize::from(mutation.locking_read.is_some()),
            })
            .sum()
    }
}

impl<'a> IntoIterator for &'a ReplayLog {
    type Item = &'a ReplayEntry;
    type IntoIter = std::slice::Iter<'a, ReplayEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::mutation::MutationOp;

    fn rows(values: &[i64]) -> QueryResult {
        QueryResult::Rows(
            values.iter().map(|v| vec![Value::Integer(*v)]).collect(),
            vec!["Id".to_string()],
        )
    }

    #[test]
    fn test_outcome_checksums_rows() {
        let a = Outcome::of(&rows(&[1, 2])).unwrap();
        assert_eq!(a, Outcome::of(&rows(&[1, 2])).unwrap());
        assert_ne!(a, Outcome::of(&rows(&[1, 3])).unwrap());
        assert_ne!(a, Outcome::of(&rows(&[2, 1])).unwrap());
        assert_eq!(Outcome::of(&QueryResult::Affected(4)).unwrap(), Outcome::Count(4));
    }

    #[test]
    fn test_log_counts_statements_sent_on_replay() {
        let mut log = ReplayLog::new();
        log.push(ReplayEntry::Statement {
            stmt: Statement::new("UPDATE t SET a = 1 WHERE Id = 1"),
            outcome: Outcome::Count(1),
            guard: None,
        });
        log.push(ReplayEntry::Batch {
            stmts: vec![Statement::new("DELETE FROM t WHERE Id = 2"); 2],
            counts: vec![1, 0],
            guards: vec![None, None],
        });
        log.push(ReplayEntry::Statement {
            stmt: Statement::new("SELECT a FROM t"),
            outcome: Outcome::of(&rows(&[1])).unwrap(),
            guard: None,
        });
        log.push(ReplayEntry::Mutation {
            mutation: MutationDescriptor {
                op: MutationOp::Insert,
                table: "t".to_string(),
                columns: vec!["Id".to_string()],
                rows: vec![vec![Value::Integer(3)]],
                locking_read: None,
            },
            count: 1,
        });
        assert_eq!(log.len(), 4);
        assert_eq!(log.statement_count(), 4);
        assert_eq!(log.counts(), vec![1, 1, 0, 1]);
        assert_eq!(log.iter().last().map(ReplayEntry::sql), Some("t"));
    }
}
