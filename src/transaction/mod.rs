// Transaction module - retry state machine, replay log, cancellation

mod attempt;
mod cancel;
mod logical;
mod replay;
mod retry;

pub use attempt::TransactionAttempt;
pub(crate) use attempt::Interrupt;
pub(crate) use cancel::Deadline;
pub use cancel::CancelHandle;
pub use logical::{CommitStats, LogicalTransaction, TransactionOptions, TxStatus};
pub use replay::{Outcome, ReplayEntry, ReplayLog};
pub use retry::RetryPolicy;
