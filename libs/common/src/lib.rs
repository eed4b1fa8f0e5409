//! Shared plumbing for the Modbus master services
//!
//! Provides the pieces every service binary needs before it can do real work:
//! - logging bootstrap (console + daily rolling file)
//! - layered configuration loading (defaults, file, environment)
//! - shutdown signal handling

pub mod config_loader;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
pub use logging::{LogConfig, LogGuard};
