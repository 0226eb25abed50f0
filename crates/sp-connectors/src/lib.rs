//! # sp-connectors
//!
//! Vendor integrations for a SOAR host and the primitives they share:
//! command arguments, result envelopes, checkpoints, an authenticated
//! HTTP client, markdown tables and paging helpers.
//!
//! Each integration implements [`Integration`] and is driven by
//! [`runtime::execute`], one command per invocation.

pub mod args;
pub mod checkpoint;
pub mod dedup;
pub mod http;
pub mod markdown;
pub mod pagination;
pub mod registry;
pub mod results;
pub mod runtime;
pub mod secure_string;
pub mod testing;
pub mod time;
pub mod traits;

pub mod asset;
pub mod devops;
pub mod email;
pub mod identity;
pub mod vulnerability;

pub use args::CommandArgs;
pub use checkpoint::{CheckpointStore, FileCheckpointStore, LastRun, MemoryCheckpointStore};
pub use dedup::{Checkpoint, CheckpointTracker, DedupWindow};
pub use http::{HttpClient, RateLimitConfig};
pub use markdown::{table_to_markdown, TableBuilder};
pub use registry::{build_integration, IntegrationKind};
pub use results::{
    CommandOutput, CommandResults, EntryFormat, EntryType, EventBatch, FileResult, Incident,
    ScheduledCommand,
};
pub use runtime::{Invocation, InvocationOutcome, TEST_MODULE};
pub use secure_string::SecureString;
pub use traits::{
    AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult, Integration, TransportSettings,
};

pub use asset::{ArmisConfig, ArmisIntegration};
pub use devops::{AzureDevOpsConfig, AzureDevOpsIntegration};
pub use email::{FireEyeEtpConfig, FireEyeEtpIntegration, TrendMicroConfig, TrendMicroIntegration};
pub use identity::{SalesforceIamConfig, SalesforceIamIntegration};
pub use vulnerability::{TenableIoConfig, TenableIoIntegration};
