//! Vulnerability scanners.

pub mod tenable_io;

pub use tenable_io::{TenableIoConfig, TenableIoIntegration};
