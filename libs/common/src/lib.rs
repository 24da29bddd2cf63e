//! Scout basic library
//!
//! Provides functions shared by the scout crates:
//! - logging bootstrap (console + daily rolling file)
//! - layered configuration loading
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::load_layered;
pub use logging::{LogConfig, LogGuard, LoggingConfig};
pub use shutdown::wait_for_shutdown;

