//! Identity lifecycle (IAM) integrations.

pub mod iam;
pub mod salesforce_iam;

pub use iam::{FieldMapper, IamAction, IamError, IamResult, IamUserProfile};
pub use salesforce_iam::{SalesforceIamConfig, SalesforceIamIntegration};
