//! DevOps platforms.

pub mod azure_devops;

pub use azure_devops::{AzureDevOpsConfig, AzureDevOpsIntegration};
