//! Shared connector types.
//!
//! Every integration wraps one vendor API behind an [`Integration`]: a set of
//! named commands the host can dispatch, plus an optional fetch cycle that
//! reads and rewrites the host-persisted checkpoint.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::results::CommandOutput;
use crate::secure_string::SecureString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by connectors.
///
/// The host treats all of them alike: the command is aborted and the message
/// is reported to the user.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A non-success status the generic mapping does not special-case.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// A failure the vendor adapter has already phrased for the user.
    #[error("{0}")]
    VendorError(String),

    /// The vendor answered 204 for a listing request.
    #[error("No content")]
    NoContent,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Command {0} does not exist for this integration.")]
    UnknownCommand(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    /// Shorthand for argument validation failures.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Connection settings for one vendor API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Instance name, used in logs.
    pub name: String,
    /// Base URL every request path is joined to.
    pub base_url: String,
    pub auth: AuthConfig,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries for server errors and transport failures.
    pub max_retries: u32,
    pub verify_tls: bool,
    /// Headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl ConnectorConfig {
    /// Settings with no authentication and the usual defaults.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth: AuthConfig::None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            verify_tls: true,
            headers: HashMap::new(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

pub fn default_timeout_secs() -> u64 {
    60
}

pub fn default_max_retries() -> u32 {
    2
}

fn default_verify_tls() -> bool {
    true
}

/// Transport parameters every instance accepts next to its vendor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportSettings {
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            verify_tls: default_verify_tls(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl TransportSettings {
    /// Connection settings for `base_url` using these transport parameters.
    pub fn connector_config(&self, name: &str, base_url: &str) -> ConnectorConfig {
        let mut config = ConnectorConfig::new(name, base_url)
            .with_verify_tls(self.verify_tls)
            .with_max_retries(self.max_retries);
        config.timeout_secs = self.timeout_secs;
        config
    }
}

/// How requests are authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    /// Static key sent in a named header.
    ApiKey {
        key: SecureString,
        header_name: String,
    },
    Basic {
        username: String,
        password: SecureString,
    },
    /// OAuth2 client credentials grant, token cached until shortly before expiry.
    OAuth2 {
        client_id: String,
        client_secret: SecureString,
        token_url: String,
        scopes: Vec<String>,
    },
}

/// One vendor integration as seen by the host.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Brand name of the integration (e.g. "Armis").
    fn name(&self) -> &str;

    /// Vendor reported with pushed events.
    fn vendor(&self) -> &str {
        self.name()
    }

    /// Commands this integration answers, excluding `test-module`.
    fn commands(&self) -> Vec<&'static str>;

    /// Connectivity and credentials check. Returns `"ok"` on success.
    async fn test_module(&self) -> ConnectorResult<String>;

    /// Runs one command.
    ///
    /// `last_run` is the checkpoint loaded by the host before the invocation;
    /// fetch commands overwrite it in place and the host persists it afterwards.
    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConnectorError::UnknownCommand("foo".into()).to_string(),
            "Command foo does not exist for this integration."
        );
        assert_eq!(
            ConnectorError::Api {
                status: 409,
                body: "conflict".into()
            }
            .to_string(),
            "API error (409): conflict"
        );
        assert_eq!(
            ConnectorError::invalid_argument("bad limit").to_string(),
            "bad limit"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectorConfig::new("test", "https://api.example.com")
            .with_header("Accept", "application/json")
            .with_verify_tls(false)
            .with_max_retries(0);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.max_retries, 0);
        assert!(!config.verify_tls);
        assert_eq!(config.headers.get("Accept").unwrap(), "application/json");
        assert!(matches!(config.auth, AuthConfig::None));
    }

    #[test]
    fn test_auth_config_deserialize() {
        let auth: AuthConfig = serde_json::from_str(
            r#"{"type": "api_key", "key": "k", "header_name": "x-api-key"}"#,
        )
        .unwrap();
        match auth {
            AuthConfig::ApiKey { key, header_name } => {
                assert_eq!(key.expose_secret(), "k");
                assert_eq!(header_name, "x-api-key");
            }
            other => panic!("unexpected auth {:?}", other),
        }
    }
}
