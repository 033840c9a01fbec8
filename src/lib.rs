// txreplay - transactional client wrapper for ORMs
// Transparent retry of aborted transactions, DML/mutation write routing

// Clippy configuration - allow non-critical warnings
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

// Values, statements, errors
pub mod core;

// SQL classification (kind, table, columns, version predicate, DML shape)
pub mod classifier;

// DML -> buffered mutation translation, version checks
pub mod mutation;

// Database client abstraction and the in-memory backend
pub mod client;

// Retry state machine, replay log, cancellation
pub mod transaction;

// Statement routing and batching
pub mod executor;

// Driver configuration (file + environment)
pub mod config;

// ORM-facing entry points
pub mod connection;
pub mod async_connection;

// Re-export commonly used types for convenience
pub use async_connection::{AsyncConnection, AsyncTransaction};
pub use classifier::{classify, statement_kind, ClassifiedStatement, StatementKind};
pub use client::{CommitResult, DatabaseClient, MemoryClient, QueryResult, TransactionMode};
pub use config::{DriverConfig, WritePreference};
pub use connection::{Connection, ExecutionContext};
pub use core::{ClientError, DriverError, Result, Statement, TimeoutScope, Value};
pub use executor::{BatchAccumulator, BatchUnit, ExecutionPath, ExecutionRouter};
pub use mutation::{DerivedValue, LockingRead, MutationDescriptor, MutationOp, Translation, VersionCheck};
pub use transaction::{CancelHandle, CommitStats, LogicalTransaction, RetryPolicy, TransactionOptions, TxStatus};
