//! Trend Micro Email Security event collector.
//!
//! Reads mail tracking logs (accepted and blocked traffic) and policy event
//! logs. Log records carry no id of their own, so one is derived from a few
//! fields for deduplication across fetch windows.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::dedup::{Checkpoint, DedupWindow};
use crate::http::HttpClient;
use crate::markdown::table_to_markdown;
use crate::pagination::{collect_pages, Page};
use crate::results::{CommandOutput, CommandResults, EventBatch};
use crate::secure_string::SecureString;
use crate::time::{format_iso_z, parse_date_arg, ISO_Z_FORMAT};
use crate::traits::{AuthConfig, ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

pub const VENDOR: &str = "trend micro";
pub const PRODUCT: &str = "email security";

const MAX_PAGE_SIZE: usize = 500;

/// Instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendMicroConfig {
    pub url: String,
    pub username: String,
    #[serde(alias = "credentials")]
    pub api_key: SecureString,
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
    /// Start of the first fetch window; one hour ago when unset.
    #[serde(default)]
    pub first_fetch: Option<String>,
    #[serde(default = "default_hide_sensitive")]
    pub hide_sensitive: bool,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_max_fetch() -> usize {
    5000
}

fn default_hide_sensitive() -> bool {
    true
}

/// Log streams, in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    AcceptedTraffic,
    BlockedTraffic,
    PolicyLogs,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::AcceptedTraffic,
        EventType::BlockedTraffic,
        EventType::PolicyLogs,
    ];

    pub fn value(self) -> &'static str {
        match self {
            EventType::AcceptedTraffic => "accepted_traffic",
            EventType::BlockedTraffic => "blocked_traffic",
            EventType::PolicyLogs => "policy_logs",
        }
    }

    fn path(self) -> &'static str {
        match self {
            EventType::PolicyLogs => "/api/v1/log/policyeventlog",
            _ => "/api/v1/log/mailtrackinglog",
        }
    }

    /// Fields concatenated into the synthetic event id.
    fn id_fields(self) -> [&'static str; 3] {
        match self {
            EventType::PolicyLogs => ["messageID", "policyName", "action"],
            _ => ["messageID", "mailID", "size"],
        }
    }

    pub fn time_key(self) -> String {
        format!("time_{}_from", self.value())
    }

    pub fn ids_key(self) -> String {
        format!("fetched_event_ids_of_{}", self.value())
    }

    pub fn token_key(self) -> String {
        format!("next_token_{}", self.value())
    }
}

/// Id derivation and duplicate checks for one event type.
#[derive(Debug, Clone)]
pub struct Deduplicate {
    event_type: EventType,
    window: DedupWindow<DateTime<Utc>>,
}

impl Deduplicate {
    pub fn new(ids_fetched: Vec<String>, event_type: EventType) -> Self {
        Self {
            event_type,
            window: DedupWindow::new(ids_fetched, None),
        }
    }

    /// Concatenates the id fields, skipping null and missing ones.
    pub fn generate_id_for_event(&self, event: &Value) -> String {
        self.event_type
            .id_fields()
            .iter()
            .filter_map(|field| match event.get(*field) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
            .collect()
    }

    /// Latest `genTime` at second precision, formatted `%Y-%m-%dT%H:%M:%SZ`.
    pub fn get_last_time_event(&self, events: &[Value]) -> Option<String> {
        events.iter().filter_map(gen_time).max().map(|t| format_iso_z(&t))
    }

    /// Ids of events whose `genTime` equals `latest_time`.
    fn get_event_ids_with_duplication_risk(&self, events: &[Value], latest_time: &str) -> Vec<String> {
        let Ok(latest) = parse_date_arg(latest_time) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for event in events {
            if gen_time(event) == Some(latest) {
                let id = self.generate_id_for_event(event);
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// True when the id was delivered already and the event is not after `time_from`.
    pub fn is_duplicate(&self, event: &Value, time_from: &str) -> bool {
        let bound = parse_date_arg(time_from).ok();
        let window = DedupWindow {
            seen_ids: self.window.seen_ids.clone(),
            lower_bound: bound,
        };
        !window.is_new(&self.generate_id_for_event(event), gen_time(event).as_ref())
    }
}

/// `genTime` truncated to whole seconds.
fn gen_time(event: &Value) -> Option<DateTime<Utc>> {
    let raw = event.get("genTime")?.as_str()?;
    let parsed = parse_date_arg(raw).ok()?;
    parsed.duration_trunc(Duration::seconds(1)).ok()
}

/// Start of the first window: `start_time` resolved, or one hour ago.
pub fn set_first_fetch(start_time: Option<&str>) -> ConnectorResult<String> {
    set_first_fetch_at(start_time, Utc::now())
}

pub fn set_first_fetch_at(start_time: Option<&str>, now: DateTime<Utc>) -> ConnectorResult<String> {
    let start = match start_time {
        Some(s) if !s.trim().is_empty() => crate::time::parse_date_arg_at(s, now)?,
        _ => now - Duration::hours(1),
    };
    Ok(start.format(ISO_Z_FORMAT).to_string())
}

/// Drops `subject` and every attachment `fileName`.
pub fn remove_sensitive_from_events(event: &mut Value) {
    if let Value::Object(map) = event {
        map.remove("subject");
        if let Some(Value::Array(attachments)) = map.get_mut("attachments") {
            for attachment in attachments.iter_mut() {
                if let Value::Object(a) = attachment {
                    a.remove("fileName");
                }
            }
        }
    }
}

/// Query of one log request.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub start: String,
    pub end: String,
    pub limit: usize,
    pub token: Option<String>,
}

pub struct TrendMicroIntegration {
    config: TrendMicroConfig,
    client: HttpClient,
}

impl TrendMicroIntegration {
    pub fn new(config: TrendMicroConfig) -> ConnectorResult<Self> {
        let connector = config
            .transport
            .connector_config("trend-micro-email-security", &config.url)
            .with_auth(AuthConfig::Basic {
                username: config.username.clone(),
                password: config.api_key.clone(),
            })
            .with_header("Accept", "application/json");
        let client = HttpClient::new(connector)?;
        info!(url = %config.url, "Trend Micro Email Security integration initialized");
        Ok(Self { config, client })
    }

    /// One page of logs. A 204 answer is [`ConnectorError::NoContent`].
    #[instrument(skip(self, query), fields(event_type = event_type.value()))]
    pub async fn get_logs(&self, event_type: EventType, query: &LogQuery) -> ConnectorResult<Page<Value>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if event_type != EventType::PolicyLogs {
            params.push(("type", event_type.value().to_string()));
        }
        params.push(("start", query.start.clone()));
        params.push(("end", query.end.clone()));
        params.push(("limit", query.limit.min(MAX_PAGE_SIZE).to_string()));
        if let Some(token) = &query.token {
            let decoded = urlencoding::decode(token)
                .map(|t| t.into_owned())
                .unwrap_or_else(|_| token.clone());
            params.push(("token", decoded));
        }

        let request = self.client.request(Method::GET, event_type.path()).query(&params);
        let response = self.client.send(request).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(ConnectorError::NoContent);
        }
        let body: Value = HttpClient::parse_json(response).await?;
        let logs = match body.get("logs") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let next_token = body
            .get("nextToken")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Page::new(logs, next_token))
    }

    /// Pages through one event type and drops events delivered in the previous window.
    pub async fn fetch_by_event_type(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        ids_fetched: Vec<String>,
        event_type: EventType,
        next_token: Option<String>,
    ) -> ConnectorResult<(Vec<Value>, Option<String>)> {
        let collected = collect_pages(limit, next_token, |token, remaining| {
            let query = LogQuery {
                start: start.to_string(),
                end: end.to_string(),
                limit: remaining,
                token,
            };
            async move { self.get_logs(event_type, &query).await }
        })
        .await?;

        let dedup = Deduplicate::new(ids_fetched, event_type);
        let mut events: Vec<Value> = collected
            .items
            .into_iter()
            .filter(|event| !dedup.is_duplicate(event, start))
            .collect();

        for event in events.iter_mut() {
            if self.config.hide_sensitive {
                remove_sensitive_from_events(event);
            }
            let time = event.get("genTime").cloned().unwrap_or(Value::Null);
            if let Value::Object(map) = event {
                map.insert("_time".to_string(), time);
                map.insert("logType".to_string(), Value::String(event_type.value().to_string()));
            }
        }

        debug!(event_type = event_type.value(), count = events.len(), "Fetched logs");
        Ok((events, collected.next_token))
    }

    /// One fetch cycle across all event types; rewrites `last_run` in place.
    #[instrument(skip(self, last_run))]
    pub async fn fetch_events(
        &self,
        limit: usize,
        first_fetch: &str,
        last_run: &mut LastRun,
    ) -> ConnectorResult<Vec<Value>> {
        let end = format_iso_z(&Utc::now());
        let mut all = Vec::new();

        for event_type in EventType::ALL {
            let start = last_run
                .get_str(&event_type.time_key())
                .unwrap_or(first_fetch)
                .to_string();
            let ids = last_run.get_str_list(&event_type.ids_key());
            let token = last_run.get_str(&event_type.token_key()).map(str::to_string);

            let (events, next_token) = self
                .fetch_by_event_type(&start, &end, limit, ids.clone(), event_type, token)
                .await?;

            managing_set_last_run(&events, last_run, &start, &ids, event_type, next_token);
            all.extend(events);
        }

        info!(count = all.len(), "Fetched Trend Micro events");
        Ok(all)
    }

    fn first_fetch(&self) -> ConnectorResult<String> {
        set_first_fetch(self.config.first_fetch.as_deref())
    }

    async fn get_events_command(&self, args: &CommandArgs, last_run: &LastRun) -> ConnectorResult<CommandOutput> {
        let limit = args.get_number_or("max_fetch", self.config.max_fetch as i64)?.max(0) as usize;
        let start = match args.get_str("start_time") {
            Some(start) => set_first_fetch(Some(&start))?,
            None => self.first_fetch()?,
        };
        let should_push = args.get_bool_or("should_push_events", false)?;

        let mut scratch = if args.contains("start_time") {
            LastRun::new()
        } else {
            last_run.clone()
        };
        let events = self.fetch_events(limit, &start, &mut scratch).await?;

        let readable = table_to_markdown("Events", &Value::Array(events.clone()), None);
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

/// Writes the checkpoint keys of one event type. A type without events keeps its keys.
pub fn managing_set_last_run(
    events: &[Value],
    last_run: &mut LastRun,
    start: &str,
    previous_ids: &[String],
    event_type: EventType,
    next_token: Option<String>,
) {
    if events.is_empty() {
        return;
    }
    let dedup = Deduplicate::new(Vec::new(), event_type);
    let newest = match dedup.get_last_time_event(events) {
        Some(latest) => Checkpoint::new(
            parse_date_arg(&latest).ok(),
            dedup.get_event_ids_with_duplication_risk(events, &latest),
        ),
        None => Checkpoint::default(),
    };
    let next = Checkpoint::new(parse_date_arg(start).ok(), previous_ids.to_vec()).advance(newest);

    let time_from = next
        .timestamp
        .map(|t| format_iso_z(&t))
        .unwrap_or_else(|| start.to_string());
    last_run.set(&event_type.time_key(), time_from);
    last_run.set(&event_type.ids_key(), next.ids);
    match next_token {
        Some(token) => last_run.set(&event_type.token_key(), token),
        None => {
            last_run.remove(&event_type.token_key());
        }
    }
}

#[async_trait]
impl Integration for TrendMicroIntegration {
    fn name(&self) -> &str {
        "Trend Micro Email Security Event Collector"
    }

    fn vendor(&self) -> &str {
        VENDOR
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["fetch-events", "trend-micro-get-events"]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        let query = LogQuery {
            start: self.first_fetch()?,
            end: format_iso_z(&Utc::now()),
            limit: 1,
            token: None,
        };
        match self.get_logs(EventType::AcceptedTraffic, &query).await {
            Ok(_) | Err(ConnectorError::NoContent) => Ok("ok".to_string()),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput> {
        match command {
            "fetch-events" => {
                let first_fetch = self.first_fetch()?;
                let events = self
                    .fetch_events(self.config.max_fetch, &first_fetch, last_run)
                    .await?;
                Ok(CommandOutput::Events {
                    batch: EventBatch::new(VENDOR, PRODUCT, events),
                    preview: None,
                })
            }
            "trend-micro-get-events" => self.get_events_command(args, last_run).await,
            other => Err(ConnectorError::UnknownCommand(other.to_string())),
        }
    }
}
