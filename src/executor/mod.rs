//! Executor module - decides where each statement goes and runs it
//!
//! Structure:
//! - router: statement classification, path choice, single-statement dispatch
//! - batch: DML/mutation partitioning for multi-statement units

pub mod batch;
pub mod router;

pub use batch::{BatchAccumulator, BatchUnit};
pub use router::{choose_path, ExecutionPath, ExecutionRouter};
pub(crate) use router::execute_ddl;
