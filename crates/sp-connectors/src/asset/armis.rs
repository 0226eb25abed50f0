//! Armis asset-management event collector.
//!
//! Pulls alerts and "Threat Detected" activities through the AQL search
//! endpoint and forwards them as events.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::dedup::{Checkpoint, CheckpointTracker, DedupWindow};
use crate::http::HttpClient;
use crate::markdown::table_to_markdown;
use crate::results::{CommandOutput, CommandResults, EventBatch};
use crate::secure_string::SecureString;
use crate::time::{format_iso_z, parse_date_arg};
use crate::traits::{ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

pub const VENDOR: &str = "armis";
pub const PRODUCT: &str = "armis";

const ACCESS_TOKEN_KEY: &str = "access_token";

/// Armis instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmisConfig {
    /// Tenant URL; `/api/v1` is appended.
    pub server_url: String,
    #[serde(alias = "credentials")]
    pub api_key: SecureString,
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
    #[serde(default = "default_first_fetch")]
    pub first_fetch: String,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_max_fetch() -> usize {
    1000
}

fn default_first_fetch() -> String {
    "3 days".to_string()
}

/// The two event types collected, each with its id field and checkpoint keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmisEventType {
    Alerts,
    Threats,
}

impl ArmisEventType {
    pub fn id_field(self) -> &'static str {
        match self {
            ArmisEventType::Alerts => "alertId",
            ArmisEventType::Threats => "activityUUID",
        }
    }

    pub fn aql(self, time_frame_secs: i64) -> String {
        match self {
            ArmisEventType::Alerts => format!("in:alerts timeFrame:\"{} seconds\"", time_frame_secs),
            ArmisEventType::Threats => format!(
                "in:activity type:\"Threat Detected\" timeFrame:\"{} seconds\"",
                time_frame_secs
            ),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            ArmisEventType::Alerts => "alerts",
            ArmisEventType::Threats => "threats",
        }
    }

    pub fn ids_key(self) -> String {
        format!("{}_last_fetch_ids", self.prefix())
    }

    pub fn time_key(self) -> String {
        format!("{}_last_fetch_time", self.prefix())
    }
}

/// Result page of `GET /search/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: SearchData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchData {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub results: Vec<Value>,
}

pub struct ArmisIntegration {
    config: ArmisConfig,
    client: HttpClient,
    token: RwLock<Option<SecureString>>,
}

impl ArmisIntegration {
    pub fn new(config: ArmisConfig) -> ConnectorResult<Self> {
        let base_url = format!("{}/api/v1", config.server_url.trim_end_matches('/'));
        let connector = config
            .transport
            .connector_config("armis", &base_url)
            .with_header("Accept", "application/json");
        let client = HttpClient::new(connector)?;
        info!(server = %config.server_url, "Armis integration initialized");
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    /// Requests a fresh access token with the API secret.
    #[instrument(skip(self))]
    pub async fn get_access_token(&self) -> ConnectorResult<SecureString> {
        let request = self
            .client
            .request(Method::POST, "/access_token/")
            .query(&[("secret_key", self.config.api_key.expose_secret())])
            .header("Content-Type", "application/x-www-form-urlencoded");
        let response: Value = self.client.send_json(request).await?;
        match response
            .pointer("/data/access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            Some(token) => {
                debug!("Obtained new Armis access token");
                Ok(SecureString::from(token))
            }
            None => Err(ConnectorError::AuthenticationFailed(
                "Could not get access token from the Armis API.".to_string(),
            )),
        }
    }

    /// Probes a token with a one-second alert search.
    pub async fn is_valid_access_token(&self, token: &SecureString) -> bool {
        self.search_with_token(token, ArmisEventType::Alerts, 1, 1)
            .await
            .is_ok()
    }

    /// Returns the token in use, reusing the checkpointed one while it still works.
    async fn ensure_token(&self, stored: Option<&str>) -> ConnectorResult<SecureString> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }

        if let Some(stored) = stored {
            let candidate = SecureString::from(stored);
            if self.is_valid_access_token(&candidate).await {
                *self.token.write().await = Some(candidate.clone());
                return Ok(candidate);
            }
            debug!("Stored access token rejected, requesting a new one");
        }

        let token = self.get_access_token().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn search_with_token(
        &self,
        token: &SecureString,
        event_type: ArmisEventType,
        length: usize,
        time_frame_secs: i64,
    ) -> ConnectorResult<SearchResponse> {
        let length = length.to_string();
        let aql = event_type.aql(time_frame_secs);
        let request = self
            .client
            .request(Method::GET, "/search/")
            .header("Authorization", token.expose_secret())
            .query(&[
                ("aql", aql.as_str()),
                ("includeTotal", "true"),
                ("length", length.as_str()),
                ("orderBy", "time"),
            ]);
        self.client.send_json(request).await
    }

    /// Runs an AQL search, refreshing the token once if it was rejected.
    #[instrument(skip(self, token))]
    pub async fn search(
        &self,
        token: &SecureString,
        event_type: ArmisEventType,
        length: usize,
        time_frame_secs: i64,
    ) -> ConnectorResult<(SearchResponse, SecureString)> {
        match self
            .search_with_token(token, event_type, length, time_frame_secs)
            .await
        {
            Err(ConnectorError::AuthenticationFailed(_)) => {
                warn!("Access token expired, refreshing");
                let fresh = self.get_access_token().await?;
                *self.token.write().await = Some(fresh.clone());
                let response = self
                    .search_with_token(&fresh, event_type, length, time_frame_secs)
                    .await?;
                Ok((response, fresh))
            }
            other => other.map(|response| (response, token.clone())),
        }
    }

    /// One fetch cycle. Returns the new events and writes the next checkpoint.
    #[instrument(skip(self, last_run))]
    pub async fn fetch_events(
        &self,
        max_fetch: usize,
        last_run: &mut LastRun,
    ) -> ConnectorResult<Vec<Value>> {
        let first_fetch = parse_date_arg(&self.config.first_fetch)?;
        let mut token = self.ensure_token(last_run.get_str(ACCESS_TOKEN_KEY)).await?;
        let now = Utc::now();

        let mut events = Vec::new();
        let mut budget = max_fetch;

        for event_type in [ArmisEventType::Alerts, ArmisEventType::Threats] {
            let previous = stored_checkpoint(last_run, event_type);
            let start = previous.timestamp.unwrap_or(first_fetch);
            let time_frame = (now - start).num_seconds() + 1;

            if budget == 0 {
                debug!(?event_type, "Fetch budget exhausted");
                continue;
            }

            let (response, used_token) = self.search(&token, event_type, budget, time_frame).await?;
            token = used_token;
            budget = budget.saturating_sub(response.data.count.max(response.data.results.len()));

            let window = DedupWindow::from_checkpoint(&previous);
            let fresh = window.filter(
                response.data.results,
                |event| event_id(event, event_type),
                event_time,
            );

            let mut tracker = CheckpointTracker::new();
            for event in &fresh {
                if let Some(ts) = event_time(event) {
                    tracker.observe(&event_id(event, event_type), ts);
                }
            }
            let next = tracker.finish(previous);

            debug!(?event_type, fetched = fresh.len(), "Deduplicated events");
            write_checkpoint(last_run, event_type, &next);
            events.extend(fresh);
        }

        last_run.set(ACCESS_TOKEN_KEY, token.expose_secret());
        add_time_to_events(&mut events);
        info!(count = events.len(), "Fetched Armis events");
        Ok(events)
    }

    async fn get_events_command(&self, args: &CommandArgs, last_run: &LastRun) -> ConnectorResult<CommandOutput> {
        let limit = args.get_number_or("limit", self.config.max_fetch as i64)?.max(0) as usize;
        let should_push = args.get_bool_or("should_push_events", false)?;

        let mut scratch = last_run.clone();
        let events = self.fetch_events(limit, &mut scratch).await?;

        let readable = table_to_markdown("Armis Events", &Value::Array(events.clone()), None);
        let preview = CommandResults::readable(readable).with_raw_response(Value::Array(events.clone()));

        if should_push {
            Ok(CommandOutput::Events {
                batch: EventBatch::new(VENDOR, PRODUCT, events),
                preview: Some(preview),
            })
        } else {
            Ok(preview.into())
        }
    }
}

fn event_id(event: &Value, event_type: ArmisEventType) -> String {
    match event.get(event_type.id_field()) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn event_time(event: &Value) -> Option<DateTime<Utc>> {
    event
        .get("time")
        .and_then(Value::as_str)
        .and_then(|t| parse_date_arg(t).ok())
}

fn stored_checkpoint(last_run: &LastRun, event_type: ArmisEventType) -> Checkpoint<DateTime<Utc>> {
    let timestamp = last_run
        .get_str(&event_type.time_key())
        .and_then(|t| parse_date_arg(t).ok());
    Checkpoint::new(timestamp, last_run.get_str_list(&event_type.ids_key()))
}

fn write_checkpoint(last_run: &mut LastRun, event_type: ArmisEventType, checkpoint: &Checkpoint<DateTime<Utc>>) {
    last_run.set(&event_type.ids_key(), checkpoint.ids.clone());
    match &checkpoint.timestamp {
        Some(ts) => last_run.set(
            &event_type.time_key(),
            ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
        None => last_run.set(&event_type.time_key(), Value::Null),
    }
}

/// Sets `_time` from the event's `time` field.
pub fn add_time_to_events(events: &mut [Value]) {
    for event in events.iter_mut() {
        let time = event_time(event).map(|t| format_iso_z(&t));
        if let Value::Object(map) = event {
            map.insert("_time".to_string(), time.map(Value::String).unwrap_or(Value::Null));
        }
    }
}

#[async_trait]
impl Integration for ArmisIntegration {
    fn name(&self) -> &str {
        "Armis"
    }

    fn vendor(&self) -> &str {
        VENDOR
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["fetch-events", "armis-get-events"]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        let token = self.ensure_token(None).await?;
        self.search(&token, ArmisEventType::Alerts, 1, 1).await?;
        Ok("ok".to_string())
    }

    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput> {
        match command {
            "fetch-events" => {
                let events = self.fetch_events(self.config.max_fetch, last_run).await?;
                Ok(CommandOutput::Events {
                    batch: EventBatch::new(VENDOR, PRODUCT, events),
                    preview: None,
                })
            }
            "armis-get-events" => self.get_events_command(args, last_run).await,
            other => Err(ConnectorError::UnknownCommand(other.to_string())),
        }
    }
}
