//! # sp-observability
//!
//! Logging setup shared by the connector runtime and its command-line host.
//!
//! Logs go to stderr so that command output on stdout stays machine readable.

pub mod logging;

pub use logging::{init_logging, init_logging_with_config, LogFormat, LoggingConfig};
