//! Salesforce user lifecycle (IAM) integration.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::http::HttpClient;
use crate::identity::iam::{
    handle_exception, FieldMapper, IamAction, IamError, IamResult, IamUserProfile,
    COMMAND_DISABLED_REASON,
};
use crate::results::CommandOutput;
use crate::secure_string::SecureString;
use crate::traits::{ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

const BRAND: &str = "Salesforce IAM";

/// Instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesforceIamConfig {
    /// Instance URL, e.g. `https://example.my.salesforce.com`.
    pub url: String,
    pub client_id: String,
    pub client_secret: SecureString,
    pub username: String,
    pub password: SecureString,
    /// Appended to the password for the password grant.
    #[serde(default)]
    pub secret_token: Option<SecureString>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "enabled")]
    pub create_user_enabled: bool,
    #[serde(default = "enabled")]
    pub update_user_enabled: bool,
    #[serde(default = "enabled")]
    pub enable_user_enabled: bool,
    #[serde(default = "enabled")]
    pub disable_user_enabled: bool,
    #[serde(default)]
    pub create_if_not_exists: bool,
    /// Profile field to Salesforce attribute.
    #[serde(default = "default_mapper_out")]
    pub mapper_out: BTreeMap<String, String>,
    /// Salesforce attribute to profile field. Defaults to the inverse of `mapper_out`.
    #[serde(default)]
    pub mapper_in: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_api_version() -> String {
    "v44.0".to_string()
}

fn default_instance_name() -> String {
    "Salesforce IAM".to_string()
}

fn enabled() -> bool {
    true
}

fn default_mapper_out() -> BTreeMap<String, String> {
    [
        ("email", "Email"),
        ("username", "Username"),
        ("givenname", "FirstName"),
        ("surname", "LastName"),
        ("alias", "Alias"),
        ("timezonesidkey", "TimeZoneSidKey"),
        ("localesidkey", "LocaleSidKey"),
        ("emailencodingkey", "EmailEncodingKey"),
        ("profileid", "ProfileId"),
        ("languagelocalekey", "LanguageLocaleKey"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// SOQL string literal for `value`.
fn soql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn string_field(user: &Value, key: &str) -> Option<String> {
    user.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Salesforce REST client with a cached password-grant token.
pub struct SalesforceClient {
    config: SalesforceIamConfig,
    client: HttpClient,
    token: RwLock<Option<SecureString>>,
}

impl SalesforceClient {
    pub fn new(config: SalesforceIamConfig) -> ConnectorResult<Self> {
        let connector = config
            .transport
            .connector_config("salesforce-iam", &config.url)
            .with_header("Accept", "application/json");
        let client = HttpClient::new(connector)?;
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    /// Password grant against `/services/oauth2/token`.
    #[instrument(skip(self))]
    pub async fn get_access_token(&self) -> ConnectorResult<SecureString> {
        let mut password = self.config.password.expose_secret().to_string();
        if let Some(token) = &self.config.secret_token {
            password.push_str(token.expose_secret());
        }
        let form = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("username", self.config.username.as_str()),
            ("password", password.as_str()),
        ];
        let request = self
            .client
            .request(Method::POST, "services/oauth2/token")
            .form(&form);
        let response: Value = self.client.send_json(request).await.map_err(|e| {
            warn!(error = %e, "Salesforce token request failed");
            ConnectorError::AuthenticationFailed(format!(
                "Could not get an access token from Salesforce: {}",
                e
            ))
        })?;
        let token = response
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConnectorError::AuthenticationFailed(
                    "Salesforce token response did not include an access token".into(),
                )
            })?;
        debug!("Obtained Salesforce access token");
        Ok(SecureString::new(token.to_string()))
    }

    async fn token(&self) -> ConnectorResult<SecureString> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let token = self.get_access_token().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    fn data_path(&self, rest: &str) -> String {
        format!("services/data/{}/{}", self.config.api_version, rest)
    }

    /// Sends an authenticated request; any non-success status becomes [`ConnectorError::Api`]
    /// with the raw body. A 401 drops the cached token and retries once.
    async fn call(&self, build: impl Fn() -> RequestBuilder) -> ConnectorResult<Value> {
        for attempt in 0..2 {
            let token = self.token().await?;
            let request = build().bearer_auth(token.expose_secret());
            let response = self.client.send_unchecked(request).await?;
            let status = response.status();
            if status.as_u16() == 401 && attempt == 0 {
                info!("Salesforce token rejected, requesting a new one");
                *self.token.write().await = None;
                continue;
            }
            let body = response
                .text()
                .await
                .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
            if !status.is_success() {
                return Err(ConnectorError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| ConnectorError::InvalidResponse(e.to_string()));
        }
        Err(ConnectorError::AuthenticationFailed(
            "Salesforce rejected a freshly issued token".into(),
        ))
    }

    /// `(Id, IsActive)` of the user with this email, if one exists.
    pub async fn get_user_id_and_activity(&self, email: &str) -> ConnectorResult<(Option<String>, Option<bool>)> {
        let query = format!("SELECT Id, IsActive FROM User WHERE Email = {}", soql_literal(email));
        let path = self.data_path("query/");
        let response = self
            .call(|| self.client.request(Method::GET, &path).query(&[("q", query.as_str())]))
            .await?;
        let record = response.pointer("/records/0");
        Ok((
            record.and_then(|r| string_field(r, "Id")),
            record.and_then(|r| r.get("IsActive")).and_then(Value::as_bool),
        ))
    }

    pub async fn get_user(&self, user_id: &str) -> ConnectorResult<Value> {
        let path = self.data_path(&format!("sobjects/User/{}", user_id));
        self.call(|| self.client.request(Method::GET, &path)).await
    }

    pub async fn create_user(&self, attributes: &Map<String, Value>) -> ConnectorResult<Value> {
        let path = self.data_path("sobjects/User");
        self.call(|| self.client.request(Method::POST, &path).json(attributes))
            .await
    }

    pub async fn update_user(&self, user_id: &str, attributes: &Map<String, Value>) -> ConnectorResult<Value> {
        let path = self.data_path(&format!("sobjects/User/{}", user_id));
        self.call(|| self.client.request(Method::PATCH, &path).json(attributes))
            .await
    }

    pub async fn set_active(&self, user_id: &str, active: bool) -> ConnectorResult<Value> {
        let mut body = Map::new();
        body.insert("IsActive".into(), json!(active));
        self.update_user(user_id, &body).await
    }
}

/// Lifecycle command switches.
#[derive(Debug, Clone, Copy)]
pub struct CommandSwitches {
    pub create_user_enabled: bool,
    pub update_user_enabled: bool,
    pub enable_user_enabled: bool,
    pub disable_user_enabled: bool,
    pub create_if_not_exists: bool,
}

pub struct SalesforceIamIntegration {
    client: SalesforceClient,
    mapper: FieldMapper,
    switches: CommandSwitches,
    instance_name: String,
}

impl SalesforceIamIntegration {
    pub fn new(config: SalesforceIamConfig) -> ConnectorResult<Self> {
        let mapper = match &config.mapper_in {
            Some(incoming) => FieldMapper::new(config.mapper_out.clone(), incoming.clone()),
            None => FieldMapper::symmetric(config.mapper_out.clone()),
        };
        let switches = CommandSwitches {
            create_user_enabled: config.create_user_enabled,
            update_user_enabled: config.update_user_enabled,
            enable_user_enabled: config.enable_user_enabled,
            disable_user_enabled: config.disable_user_enabled,
            create_if_not_exists: config.create_if_not_exists,
        };
        let instance_name = config.instance_name.clone();
        info!(url = %config.url, "Salesforce IAM integration initialized");
        Ok(Self {
            client: SalesforceClient::new(config)?,
            mapper,
            switches,
            instance_name,
        })
    }

    fn profile(&self, args: &CommandArgs) -> ConnectorResult<IamUserProfile> {
        IamUserProfile::from_args(args, BRAND, &self.instance_name)
    }

    fn required_email(profile: &IamUserProfile) -> ConnectorResult<String> {
        profile
            .email()
            .ok_or_else(|| ConnectorError::invalid_argument("The user profile does not contain an email."))
    }

    /// Reports an error as a failed result of `action`.
    fn fail(profile: &mut IamUserProfile, action: IamAction, error: &ConnectorError, is_crud: bool) {
        let (message, code) = handle_exception(error, is_crud);
        warn!(action = %action, error = %message, "IAM command failed");
        profile.set_result(IamResult::failure(action, code, message));
    }

    pub async fn get_user_command(&self, args: &CommandArgs) -> ConnectorResult<IamUserProfile> {
        let mut profile = self.profile(args)?;
        if let Err(e) = self.get_user(&mut profile).await {
            Self::fail(&mut profile, IamAction::GetUser, &e, false);
        }
        Ok(profile)
    }

    async fn get_user(&self, profile: &mut IamUserProfile) -> ConnectorResult<()> {
        let email = Self::required_email(profile)?;
        let (user_id, _) = self.client.get_user_id_and_activity(&email).await?;
        let Some(user_id) = user_id else {
            let (code, message) = IamError::USER_DOES_NOT_EXIST;
            profile.set_result(IamResult::failure(IamAction::GetUser, json!(code), message));
            return Ok(());
        };

        let user = self.client.get_user(&user_id).await?;
        profile.update_with_app_data(&user, &self.mapper);
        profile.set_result(
            IamResult::success(IamAction::GetUser)
                .with_user(
                    string_field(&user, "Id"),
                    string_field(&user, "Username"),
                    string_field(&user, "Email"),
                )
                .with_active(user.get("IsActive").and_then(Value::as_bool).unwrap_or(false))
                .with_details(user),
        );
        Ok(())
    }

    pub async fn create_user_command(&self, args: &CommandArgs) -> ConnectorResult<IamUserProfile> {
        let mut profile = self.profile(args)?;
        if !self.switches.create_user_enabled {
            profile.set_result(IamResult::skipped(IamAction::CreateUser, COMMAND_DISABLED_REASON));
            return Ok(profile);
        }
        if let Err(e) = self.create_user(&mut profile).await {
            Self::fail(&mut profile, IamAction::CreateUser, &e, true);
        }
        Ok(profile)
    }

    async fn create_user(&self, profile: &mut IamUserProfile) -> ConnectorResult<()> {
        let email = Self::required_email(profile)?;
        let (user_id, active) = self.client.get_user_id_and_activity(&email).await?;
        if let Some(user_id) = user_id {
            // Existing users are updated.
            debug!(user_id = %user_id, "User exists, updating instead of creating");
            return self
                .update_existing_user(profile, &user_id, active.unwrap_or(false))
                .await;
        }
        self.create_new_user(profile).await
    }

    async fn create_new_user(&self, profile: &mut IamUserProfile) -> ConnectorResult<()> {
        let attributes = profile.map_object(&self.mapper);
        let created = self.client.create_user(&attributes).await?;
        profile.set_result(
            IamResult::success(IamAction::CreateUser)
                .with_user(
                    string_field(&created, "id"),
                    attributes
                        .get("Username")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    profile.email(),
                )
                .with_active(true)
                .with_details(created),
        );
        Ok(())
    }

    async fn update_existing_user(&self, profile: &mut IamUserProfile, user_id: &str, active: bool) -> ConnectorResult<()> {
        if !self.switches.update_user_enabled {
            profile.set_result(IamResult::skipped(IamAction::UpdateUser, COMMAND_DISABLED_REASON));
            return Ok(());
        }
        let mut attributes = profile.map_object(&self.mapper);
        let mut now_active = active;
        if !active && self.switches.enable_user_enabled {
            attributes.insert("IsActive".into(), json!(true));
            now_active = true;
        }
        self.client.update_user(user_id, &attributes).await?;
        profile.set_result(
            IamResult::success(IamAction::UpdateUser)
                .with_user(
                    Some(user_id.to_string()),
                    attributes
                        .get("Username")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    profile.email(),
                )
                .with_active(now_active)
                .with_details(Value::Object(attributes)),
        );
        Ok(())
    }

    pub async fn update_user_command(&self, args: &CommandArgs) -> ConnectorResult<IamUserProfile> {
        let mut profile = self.profile(args)?;
        if !self.switches.update_user_enabled {
            profile.set_result(IamResult::skipped(IamAction::UpdateUser, COMMAND_DISABLED_REASON));
            return Ok(profile);
        }
        if let Err(e) = self.update_user(&mut profile).await {
            Self::fail(&mut profile, IamAction::UpdateUser, &e, true);
        }
        Ok(profile)
    }

    async fn update_user(&self, profile: &mut IamUserProfile) -> ConnectorResult<()> {
        let email = Self::required_email(profile)?;
        let (user_id, active) = self.client.get_user_id_and_activity(&email).await?;
        match user_id {
            Some(user_id) => {
                self.update_existing_user(profile, &user_id, active.unwrap_or(false))
                    .await
            }
            None if self.switches.create_if_not_exists && self.switches.create_user_enabled => {
                self.create_new_user(profile).await
            }
            None => {
                let (_, message) = IamError::USER_DOES_NOT_EXIST;
                profile.set_result(IamResult::skipped(IamAction::UpdateUser, message));
                Ok(())
            }
        }
    }

    pub async fn disable_user_command(&self, args: &CommandArgs) -> ConnectorResult<IamUserProfile> {
        let mut profile = self.profile(args)?;
        if !self.switches.disable_user_enabled {
            profile.set_result(IamResult::skipped(IamAction::DisableUser, COMMAND_DISABLED_REASON));
            return Ok(profile);
        }
        if let Err(e) = self.disable_user(&mut profile).await {
            Self::fail(&mut profile, IamAction::DisableUser, &e, true);
        }
        Ok(profile)
    }

    async fn disable_user(&self, profile: &mut IamUserProfile) -> ConnectorResult<()> {
        let email = Self::required_email(profile)?;
        let (user_id, _) = self.client.get_user_id_and_activity(&email).await?;
        let Some(user_id) = user_id else {
            let (_, message) = IamError::USER_DOES_NOT_EXIST;
            profile.set_result(IamResult::skipped(IamAction::DisableUser, message));
            return Ok(());
        };
        self.client.set_active(&user_id, false).await?;
        profile.set_result(
            IamResult::success(IamAction::DisableUser)
                .with_user(Some(user_id), None, Some(email))
                .with_active(false),
        );
        Ok(())
    }
}

#[async_trait]
impl Integration for SalesforceIamIntegration {
    fn name(&self) -> &str {
        BRAND
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["iam-get-user", "iam-create-user", "iam-update-user", "iam-disable-user"]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        self.client.get_access_token().await?;
        Ok("ok".to_string())
    }

    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        _last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput> {
        let profile = match command {
            "iam-get-user" => self.get_user_command(args).await?,
            "iam-create-user" => self.create_user_command(args).await?,
            "iam-update-user" => self.update_user_command(args).await?,
            "iam-disable-user" => self.disable_user_command(args).await?,
            other => return Err(ConnectorError::UnknownCommand(other.to_string())),
        };
        Ok(profile.to_results().into())
    }
}
