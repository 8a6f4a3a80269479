pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;

pub use audit::{FailureCause, LogEvent, ProtectedLog};
pub use config::ProtectedLogConfig;
pub use error::ProtectedLogError;
