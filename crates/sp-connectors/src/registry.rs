//! Builds integrations from instance configuration.

use crate::asset::ArmisIntegration;
use crate::devops::AzureDevOpsIntegration;
use crate::email::{FireEyeEtpIntegration, TrendMicroIntegration};
use crate::identity::SalesforceIamIntegration;
use crate::traits::{ConnectorError, ConnectorResult, Integration};
use crate::vulnerability::TenableIoIntegration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Every integration this crate can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Armis,
    FireeyeEtp,
    TrendMicroEmail,
    TenableIo,
    AzureDevops,
    SalesforceIam,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 6] = [
        IntegrationKind::Armis,
        IntegrationKind::FireeyeEtp,
        IntegrationKind::TrendMicroEmail,
        IntegrationKind::TenableIo,
        IntegrationKind::AzureDevops,
        IntegrationKind::SalesforceIam,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationKind::Armis => "armis",
            IntegrationKind::FireeyeEtp => "fireeye_etp",
            IntegrationKind::TrendMicroEmail => "trend_micro_email",
            IntegrationKind::TenableIo => "tenable_io",
            IntegrationKind::AzureDevops => "azure_devops",
            IntegrationKind::SalesforceIam => "salesforce_iam",
        }
    }

    /// One-line description for listings.
    pub fn description(self) -> &'static str {
        match self {
            IntegrationKind::Armis => "Armis alert and threat-activity event collector",
            IntegrationKind::FireeyeEtp => "FireEye Email Threat Prevention event collector",
            IntegrationKind::TrendMicroEmail => "Trend Micro Email Security event collector",
            IntegrationKind::TenableIo => "Tenable Vulnerability Management scans, assets and exports",
            IntegrationKind::AzureDevops => "Azure DevOps repositories, pipelines, pull requests and work items",
            IntegrationKind::SalesforceIam => "Salesforce user lifecycle management",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntegrationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                ConnectorError::ConfigError(format!(
                    "Unknown integration kind '{}'. Available: {}",
                    s,
                    IntegrationKind::ALL.map(|k| k.as_str()).join(", ")
                ))
            })
    }
}

fn parse_params<T: DeserializeOwned>(kind: IntegrationKind, params: Value) -> ConnectorResult<T> {
    serde_json::from_value(params).map_err(|e| {
        ConnectorError::ConfigError(format!("Invalid parameters for {}: {}", kind, e))
    })
}

/// Builds the integration `kind` from its instance parameters.
pub fn build_integration(kind: IntegrationKind, params: Value) -> ConnectorResult<Box<dyn Integration>> {
    Ok(match kind {
        IntegrationKind::Armis => Box::new(ArmisIntegration::new(parse_params(kind, params)?)?),
        IntegrationKind::FireeyeEtp => {
            Box::new(FireEyeEtpIntegration::new(parse_params(kind, params)?)?)
        }
        IntegrationKind::TrendMicroEmail => {
            Box::new(TrendMicroIntegration::new(parse_params(kind, params)?)?)
        }
        IntegrationKind::TenableIo => {
            Box::new(TenableIoIntegration::new(parse_params(kind, params)?)?)
        }
        IntegrationKind::AzureDevops => {
            Box::new(AzureDevOpsIntegration::new(parse_params(kind, params)?)?)
        }
        IntegrationKind::SalesforceIam => {
            Box::new(SalesforceIamIntegration::new(parse_params(kind, params)?)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in IntegrationKind::ALL {
            assert_eq!(kind.as_str().parse::<IntegrationKind>().unwrap(), kind);
        }
        let err = "splunk".parse::<IntegrationKind>().unwrap_err();
        assert!(err.to_string().contains("Unknown integration kind 'splunk'"));
    }

    #[test]
    fn test_build_reports_bad_params() {
        let err = build_integration(IntegrationKind::TenableIo, json!({"url": "https://x"}))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Invalid parameters for tenable_io"));
    }

    #[test]
    fn test_build_integration() {
        let integration = build_integration(
            IntegrationKind::Armis,
            json!({"server_url": "https://armis.example.com", "api_key": "secret"}),
        )
        .unwrap();
        assert_eq!(integration.name(), "Armis");
        assert!(integration.commands().contains(&"armis-get-events"));
    }
}
