//! Identity lifecycle framework shared by IAM integrations.
//!
//! A command receives a user profile (the platform's normalized user record),
//! maps it to the vendor's attributes, acts on the vendor, and reports the
//! outcome through [`IamUserProfile::to_results`].

use crate::args::CommandArgs;
use crate::markdown::table_to_markdown;
use crate::results::CommandResults;
use crate::traits::{ConnectorError, ConnectorResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle operation reported with each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IamAction {
    #[serde(rename = "get")]
    GetUser,
    #[serde(rename = "create")]
    CreateUser,
    #[serde(rename = "update")]
    UpdateUser,
    #[serde(rename = "disable")]
    DisableUser,
    #[serde(rename = "enable")]
    EnableUser,
}

impl IamAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IamAction::GetUser => "get",
            IamAction::CreateUser => "create",
            IamAction::UpdateUser => "update",
            IamAction::DisableUser => "disable",
            IamAction::EnableUser => "enable",
        }
    }
}

impl fmt::Display for IamAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known lifecycle errors as `(code, message)`.
pub struct IamError;

impl IamError {
    pub const USER_DOES_NOT_EXIST: (i64, &'static str) = (404, "User does not exist");
    pub const USER_ALREADY_EXISTS: (i64, &'static str) = (409, "User already exists");
}

pub const COMMAND_DISABLED_REASON: &str = "Command is disabled.";

/// Profile field to vendor attribute maps, one per direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapper {
    /// Profile field to vendor attribute, used when writing to the vendor.
    #[serde(default)]
    pub outgoing: BTreeMap<String, String>,
    /// Vendor attribute to profile field, used when reading from the vendor.
    #[serde(default)]
    pub incoming: BTreeMap<String, String>,
}

impl FieldMapper {
    pub fn new(outgoing: BTreeMap<String, String>, incoming: BTreeMap<String, String>) -> Self {
        Self { outgoing, incoming }
    }

    /// A mapper whose incoming side is the inverse of `outgoing`.
    pub fn symmetric(outgoing: BTreeMap<String, String>) -> Self {
        let incoming = outgoing
            .iter()
            .map(|(profile, vendor)| (vendor.clone(), profile.clone()))
            .collect();
        Self { outgoing, incoming }
    }
}

/// Outcome fields of one lifecycle command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IamResult {
    pub action: Option<IamAction>,
    pub success: bool,
    pub active: Option<bool>,
    pub id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub error_code: Value,
    pub error_message: Option<String>,
    pub details: Value,
    pub skipped: bool,
    pub reason: Option<String>,
}

impl IamResult {
    pub fn success(action: IamAction) -> Self {
        Self {
            action: Some(action),
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(action: IamAction, code: Value, message: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            success: false,
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A command that did nothing on purpose.
    pub fn skipped(action: IamAction, reason: impl Into<String>) -> Self {
        Self {
            action: Some(action),
            success: true,
            skipped: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, id: Option<String>, username: Option<String>, email: Option<String>) -> Self {
        self.id = id;
        self.username = username;
        self.email = email;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A user profile plus the result of the command acting on it.
#[derive(Debug, Clone)]
pub struct IamUserProfile {
    profile: Map<String, Value>,
    brand: String,
    instance_name: String,
    result: IamResult,
}

impl IamUserProfile {
    pub fn new(profile: Map<String, Value>, brand: &str, instance_name: &str) -> Self {
        Self {
            profile,
            brand: brand.to_string(),
            instance_name: instance_name.to_string(),
            result: IamResult::default(),
        }
    }

    /// Reads the `user-profile` argument, given as an object or as a JSON string.
    pub fn from_args(args: &CommandArgs, brand: &str, instance_name: &str) -> ConnectorResult<Self> {
        let profile = match args.get_json("user-profile")? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ConnectorError::invalid_argument(
                    "user-profile must be a JSON object",
                ))
            }
            None => {
                return Err(ConnectorError::invalid_argument(
                    "Missing required argument: user-profile",
                ))
            }
        };
        Ok(Self::new(profile, brand, instance_name))
    }

    pub fn profile(&self) -> &Map<String, Value> {
        &self.profile
    }

    pub fn result(&self) -> &IamResult {
        &self.result
    }

    /// Case-insensitive profile lookup; null and empty strings count as absent.
    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.profile
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
    }

    pub fn email(&self) -> Option<String> {
        self.get_attribute("email")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Vendor attributes for this profile using the outgoing map.
    pub fn map_object(&self, mapper: &FieldMapper) -> Map<String, Value> {
        mapper
            .outgoing
            .iter()
            .filter_map(|(field, attribute)| {
                self.get_attribute(field)
                    .map(|value| (attribute.clone(), value.clone()))
            })
            .collect()
    }

    /// Copies vendor data into the profile using the incoming map.
    pub fn update_with_app_data(&mut self, app_data: &Value, mapper: &FieldMapper) {
        let Some(data) = app_data.as_object() else {
            return;
        };
        for (attribute, field) in &mapper.incoming {
            if let Some(value) = data.get(attribute).filter(|v| !v.is_null()) {
                self.profile.insert(field.clone(), value.clone());
            }
        }
    }

    pub fn set_result(&mut self, result: IamResult) {
        self.result = result;
    }

    /// Vendor-side outputs of the last result.
    pub fn outputs(&self) -> Value {
        let r = &self.result;
        json!({
            "brand": self.brand,
            "instanceName": self.instance_name,
            "action": r.action.map(IamAction::as_str),
            "success": r.success,
            "active": r.active,
            "id": r.id,
            "username": r.username,
            "email": r.email.clone().or_else(|| self.email()),
            "errorCode": r.error_code,
            "errorMessage": r.error_message,
            "details": r.details,
            "skipped": r.skipped,
            "reason": r.reason,
        })
    }

    pub fn to_results(&self) -> CommandResults {
        let outputs = self.outputs();
        let readable = table_to_markdown(
            &format!("IAM {} results ({})", self.result.action.map(IamAction::as_str).unwrap_or("unknown"), self.brand),
            &outputs,
            Some(&["brand", "instanceName", "success", "active", "id", "username", "email", "errorCode", "errorMessage", "reason"]),
        );
        CommandResults {
            outputs_prefix: Some("IAM.Vendor".to_string()),
            outputs: Some(outputs.clone()),
            raw_response: Some(outputs),
            readable_output: Some(readable),
            ..CommandResults::default()
        }
        .with_context(
            "IAM.UserProfile(val.email && val.email == obj.email)",
            Value::Object(self.profile.clone()),
        )
    }

    pub fn to_entry(&self) -> Value {
        self.to_results().to_entry()
    }
}

/// Message and code for a failed lifecycle command.
///
/// Vendor HTTP errors keep the raw body for CRUD commands; other commands
/// surface the first vendor message when the body is a JSON error list.
pub fn handle_exception(error: &ConnectorError, is_crud_command: bool) -> (String, Value) {
    match error {
        ConnectorError::Api { status, body } => {
            if is_crud_command {
                return (body.clone(), json!(status));
            }
            match serde_json::from_str::<Value>(body) {
                Ok(parsed) => {
                    let first = parsed.as_array().and_then(|a| a.first()).unwrap_or(&parsed);
                    let message = first
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| body.clone());
                    let code = first.get("errorCode").cloned().unwrap_or(json!(status));
                    (message, code)
                }
                Err(_) => (body.clone(), Value::String(String::new())),
            }
        }
        other => (other.to_string(), Value::String(String::new())),
    }
}
