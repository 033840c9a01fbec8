// Module declarations
pub mod error;
pub mod value;
pub mod statement;

// Re-exports for convenience
pub use error::{ClientError, DriverError, Result, TimeoutScope};
pub use value::Value;
pub use statement::{Param, ParamRef, Statement};
