//! FireEye Email Threat Prevention event collector.
//!
//! Collects alerts, email trace records and user activity logs. Each listing
//! endpoint is queried forward from the newest timestamp already delivered,
//! so boundary records come back and are dropped by id.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::dedup::{Checkpoint, CheckpointTracker, DedupWindow};
use crate::http::HttpClient;
use crate::markdown::table_to_markdown;
use crate::results::{CommandOutput, CommandResults, EventBatch};
use crate::secure_string::SecureString;
use crate::time::{format_iso_z, parse_date_arg};
use crate::traits::{AuthConfig, ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

pub const VENDOR: &str = "fireeye";
pub const PRODUCT: &str = "etp";

pub const LAST_RUN_KEY: &str = "Last Run";
const CHECKPOINT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// ETP instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireEyeEtpConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(alias = "credentials")]
    pub api_key: SecureString,
    #[serde(default)]
    pub outbound_traffic: bool,
    #[serde(default = "default_hide_sensitive")]
    pub hide_sensitive: bool,
    #[serde(default = "default_max_fetch")]
    pub max_fetch_alerts: usize,
    #[serde(default = "default_max_fetch")]
    pub max_fetch_email_trace: usize,
    #[serde(default = "default_max_fetch")]
    pub max_fetch_activity_log: usize,
    #[serde(default = "default_first_fetch")]
    pub first_fetch: String,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_server_url() -> String {
    "https://etp.us.fireeye.com".to_string()
}

fn default_hide_sensitive() -> bool {
    true
}

fn default_max_fetch() -> usize {
    1000
}

fn default_first_fetch() -> String {
    "3 days".to_string()
}

/// One collected stream and its limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub name: String,
    pub max_fetch: usize,
    pub max_page_size: usize,
    pub outbound: bool,
}

impl EventType {
    pub fn new(name: &str, max_fetch: usize, outbound: bool) -> Self {
        Self::with_page_size(name, max_fetch, 200, outbound)
    }

    pub fn with_page_size(name: &str, max_fetch: usize, max_page_size: usize, outbound: bool) -> Self {
        Self {
            name: name.to_string(),
            max_fetch,
            max_page_size,
            outbound,
        }
    }

    fn endpoint(&self) -> ConnectorResult<&'static str> {
        match self.name.as_str() {
            "alerts" => Ok("/api/v2/public/alerts/search"),
            "email_trace" => Ok("/api/v1/messages/trace"),
            "activity_log" => Ok("/api/v1/users/activitylogs/search"),
            other => Err(ConnectorError::ConfigError(format!("Unknown event type {}", other))),
        }
    }

    /// JSON pointer of the record timestamp, relative to the formatted event.
    fn time_pointer(&self) -> &'static str {
        match self.name.as_str() {
            "alerts" => "/meta/last_modified_on",
            "email_trace" => "/lastModifiedDateTime",
            _ => "/time",
        }
    }

    /// Dotted paths removed when sensitive data is hidden.
    fn sensitive_paths(&self) -> &'static [&'static str] {
        match self.name.as_str() {
            "alerts" => &["email.headers.subject", "email.headers.to", "email.attachment"],
            "email_trace" => &["subject", "attachmentNames"],
            _ => &[],
        }
    }

    fn request_body(&self, since: &DateTime<Utc>, size: usize) -> Value {
        let since = since.format(QUERY_TIME_FORMAT).to_string();
        let mut body = match self.name.as_str() {
            "activity_log" => json!({
                "attributes": {"time": {"value": since, "filter": ">="}},
                "size": size
            }),
            _ => json!({
                "attributes": {"lastModifiedDateTime": {"value": since, "filter": ">="}},
                "size": size
            }),
        };
        if self.outbound && self.name != "activity_log" {
            body["attributes"]["traffic_type"] = json!("outbound");
        }
        body
    }
}

/// Per-event-type progress stored under the `Last Run` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCheckpoint {
    #[serde(default)]
    pub last_fetch_last_ids: Vec<String>,
    #[serde(default)]
    pub last_fetch_timestamp: Option<String>,
}

impl EventCheckpoint {
    fn to_checkpoint(&self) -> Checkpoint<DateTime<Utc>> {
        let timestamp = self
            .last_fetch_timestamp
            .as_deref()
            .and_then(|ts| parse_event_time(ts).ok());
        Checkpoint::new(timestamp, self.last_fetch_last_ids.clone())
    }

    fn from_checkpoint(checkpoint: &Checkpoint<DateTime<Utc>>) -> Self {
        Self {
            last_fetch_last_ids: checkpoint.ids.clone(),
            last_fetch_timestamp: checkpoint
                .timestamp
                .map(|ts| ts.format(CHECKPOINT_TIME_FORMAT).to_string()),
        }
    }
}

/// Checkpoint of every event type being collected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EtpLastRun {
    pub event_types: BTreeMap<String, EventCheckpoint>,
}

impl EtpLastRun {
    /// Reads the stored checkpoint for the types being run; missing types start at `first_fetch`.
    pub fn from_last_run(last_run: &LastRun, event_types: &[EventType], first_fetch: &DateTime<Utc>) -> Self {
        let stored = last_run.get(LAST_RUN_KEY).and_then(Value::as_object);
        let event_types = event_types
            .iter()
            .map(|event_type| {
                let checkpoint = stored
                    .and_then(|s| s.get(&event_type.name))
                    .and_then(|v| serde_json::from_value::<EventCheckpoint>(v.clone()).ok())
                    .filter(|c| c.last_fetch_timestamp.is_some())
                    .unwrap_or_else(|| EventCheckpoint {
                        last_fetch_last_ids: Vec::new(),
                        last_fetch_timestamp: Some(first_fetch.format(CHECKPOINT_TIME_FORMAT).to_string()),
                    });
                (event_type.name.clone(), checkpoint)
            })
            .collect();
        Self { event_types }
    }

    /// `{"Last Run": {...}}`, or `{}` when no event type is collected.
    pub fn to_last_run(&self) -> LastRun {
        let mut last_run = LastRun::new();
        if self.event_types.is_empty() {
            return last_run;
        }
        let mut types = Map::new();
        for (name, checkpoint) in &self.event_types {
            types.insert(
                name.clone(),
                serde_json::to_value(checkpoint).unwrap_or(Value::Null),
            );
        }
        last_run.set(LAST_RUN_KEY, Value::Object(types));
        last_run
    }
}

/// Parses ETP timestamps: `YYYY-MM-DDTHH:MM:SS[.ffffff]` followed by
/// `+0000Z`, `+0000` or `Z`.
pub fn from_fake_isozformat(value: &str) -> ConnectorResult<DateTime<Utc>> {
    let invalid = || ConnectorError::InvalidResponse(format!("Invalid ETP timestamp: {}", value));
    if value.len() < 11 || value.as_bytes().get(10) != Some(&b'T') {
        return Err(invalid());
    }
    let naive = value
        .strip_suffix("+0000Z")
        .or_else(|| value.strip_suffix("+0000"))
        .or_else(|| value.strip_suffix('Z'))
        .unwrap_or(value);
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| Utc.from_utc_datetime(&dt))
        .map_err(|_| invalid())
}

fn parse_event_time(value: &str) -> ConnectorResult<DateTime<Utc>> {
    from_fake_isozformat(value).or_else(|_| parse_date_arg(value))
}

/// Flattens a `{id, attributes}` record and hides sensitive fields.
pub fn format_event(record: &Value, event_type: &EventType, hide_sensitive: bool) -> Value {
    let mut event = Map::new();
    event.insert("id".to_string(), record.get("id").cloned().unwrap_or(Value::Null));
    if let Some(Value::Object(attributes)) = record.get("attributes") {
        for (k, v) in attributes {
            event.insert(k.clone(), v.clone());
        }
    }
    let mut event = Value::Object(event);

    if hide_sensitive {
        for path in event_type.sensitive_paths() {
            remove_path(&mut event, path);
        }
    }

    let time = event
        .pointer(event_type.time_pointer())
        .and_then(Value::as_str)
        .and_then(|t| parse_event_time(t).ok())
        .map(|t| format_iso_z(&t));
    if let (Value::Object(map), Some(time)) = (&mut event, time) {
        map.insert("_time".to_string(), Value::String(time));
    }
    event
}

fn remove_path(value: &mut Value, dotted: &str) {
    let mut parts: Vec<&str> = dotted.split('.').collect();
    let Some(last) = parts.pop() else { return };
    let mut current = value;
    for part in parts {
        match current.get_mut(part) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(last);
    }
}

pub struct FireEyeEtpIntegration {
    config: FireEyeEtpConfig,
    client: HttpClient,
}

impl FireEyeEtpIntegration {
    pub fn new(config: FireEyeEtpConfig) -> ConnectorResult<Self> {
        let connector = config
            .transport
            .connector_config("fireeye-etp", &config.server_url)
            .with_auth(AuthConfig::ApiKey {
                key: config.api_key.clone(),
                header_name: "x-fireeye-api-key".to_string(),
            })
            .with_header("Accept", "application/json");
        let client = HttpClient::new(connector)?;
        info!(server = %config.server_url, "FireEye ETP integration initialized");
        Ok(Self { config, client })
    }

    /// Event types with a non-zero fetch limit, in collection order.
    pub fn event_types(&self) -> Vec<EventType> {
        let outbound = self.config.outbound_traffic;
        [
            ("alerts", self.config.max_fetch_alerts),
            ("email_trace", self.config.max_fetch_email_trace),
            ("activity_log", self.config.max_fetch_activity_log),
        ]
        .into_iter()
        .filter(|(_, max)| *max > 0)
        .map(|(name, max)| EventType::new(name, max, outbound))
        .collect()
    }

    /// Raw records of one page.
    #[instrument(skip(self, event_type), fields(event_type = %event_type.name))]
    pub async fn get_page(
        &self,
        event_type: &EventType,
        since: &DateTime<Utc>,
        size: usize,
    ) -> ConnectorResult<Vec<Value>> {
        let body = event_type.request_body(since, size);
        let response: Value = self.client.post_json(event_type.endpoint()?, &body).await?;
        Ok(match response.get("data") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    /// Collects new events of one type and returns them with the next checkpoint.
    pub async fn fetch_event_type(
        &self,
        event_type: &EventType,
        previous: &EventCheckpoint,
    ) -> ConnectorResult<(Vec<Value>, EventCheckpoint)> {
        let previous = previous.to_checkpoint();
        let Some(mut cursor) = previous.timestamp else {
            return Err(ConnectorError::Internal(format!(
                "No start time for {}",
                event_type.name
            )));
        };

        let mut window = DedupWindow::from_checkpoint(&previous);
        let mut tracker = CheckpointTracker::new();
        let mut events = Vec::new();

        while events.len() < event_type.max_fetch {
            let size = event_type.max_page_size.min(event_type.max_fetch - events.len());
            let page = self.get_page(event_type, &cursor, size).await?;
            if page.is_empty() {
                break;
            }

            let mut fresh = 0;
            for record in page {
                let event = format_event(&record, event_type, self.config.hide_sensitive);
                let id = record_id(&record);
                let ts = event
                    .pointer(event_type.time_pointer())
                    .and_then(Value::as_str)
                    .and_then(|t| parse_event_time(t).ok());
                if !window.is_new(&id, ts.as_ref()) {
                    continue;
                }
                window.mark_seen(id.clone());
                if let Some(ts) = ts {
                    tracker.observe(&id, ts);
                    if ts > cursor {
                        cursor = ts;
                    }
                }
                events.push(event);
                fresh += 1;
                if events.len() >= event_type.max_fetch {
                    break;
                }
            }

            if fresh == 0 {
                debug!(event_type = %event_type.name, "Page contained only delivered events");
                break;
            }
            window.lower_bound = Some(cursor);
        }

        let next = tracker.finish(previous);
        Ok((events, EventCheckpoint::from_checkpoint(&next)))
    }

    /// Runs every event type once. Returns the events and the new checkpoint.
    #[instrument(skip(self, last_run))]
    pub async fn fetch_events(
        &self,
        event_types: &[EventType],
        last_run: &LastRun,
        first_fetch: &DateTime<Utc>,
    ) -> ConnectorResult<(Vec<Value>, EtpLastRun)> {
        let mut state = EtpLastRun::from_last_run(last_run, event_types, first_fetch);
        let mut all = Vec::new();
        for event_type in event_types {
            let previous = state.event_types.get(&event_type.name).cloned().unwrap_or_default();
            let (events, next) = self.fetch_event_type(event_type, &previous).await?;
            info!(event_type = %event_type.name, count = events.len(), "Fetched ETP events");
            state.event_types.insert(event_type.name.clone(), next);
            all.extend(events);
        }
        Ok((all, state))
    }

    async fn get_events_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let since = match args.get_datetime("since_time")? {
            Some(since) => since,
            None => parse_date_arg(&self.config.first_fetch)?,
        };
        let limit = args.get_number("limit")?;
        let should_push = args.get_bool_or("should_push_events", false)?;

        let event_types: Vec<EventType> = self
            .event_types()
            .into_iter()
            .map(|mut t| {
                if let Some(limit) = limit {
                    t.max_fetch = limit.max(0) as usize;
                }
                t
            })
            .filter(|t| t.max_fetch > 0)
            .collect();

        let (events, _) = self.fetch_events(&event_types, &LastRun::new(), &since).await?;
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

fn record_id(record: &Value) -> String {
    match record.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl Integration for FireEyeEtpIntegration {
    fn name(&self) -> &str {
        "FireEye ETP Event Collector"
    }

    fn vendor(&self) -> &str {
        VENDOR
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["fetch-events", "fireeye-etp-get-events"]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        let since = parse_date_arg(&self.config.first_fetch)?;
        let alerts = EventType::new("alerts", 1, self.config.outbound_traffic);
        self.get_page(&alerts, &since, 1).await?;
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
                let first_fetch = parse_date_arg(&self.config.first_fetch)?;
                let (events, state) = self
                    .fetch_events(&self.event_types(), last_run, &first_fetch)
                    .await?;
                *last_run = state.to_last_run();
                Ok(CommandOutput::Events {
                    batch: EventBatch::new(VENDOR, PRODUCT, events),
                    preview: None,
                })
            }
            "fireeye-etp-get-events" => self.get_events_command(args).await,
            other => Err(ConnectorError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_from_fake_isozformat() {
        assert_eq!(
            from_fake_isozformat("2023-08-01T14:15:26.123456+0000Z").unwrap(),
            dt("2023-08-01T14:15:26.123456Z")
        );
        assert_eq!(
            from_fake_isozformat("2023-08-01T14:15:26+0000Z").unwrap(),
            dt("2023-08-01T14:15:26Z")
        );
        assert_eq!(
            from_fake_isozformat("2023-08-01T14:15:26+0000").unwrap(),
            dt("2023-08-01T14:15:26Z")
        );
        assert_eq!(
            from_fake_isozformat("2023-08-01T14:15:26Z").unwrap(),
            dt("2023-08-01T14:15:26Z")
        );
        assert!(from_fake_isozformat("2023-08-01 14:15:26+0000Z").is_err());
    }

    fn alert_record() -> Value {
        json!({
            "id": "a1",
            "attributes": {
                "email": {
                    "headers": {"subject": "secret", "to": "bob@example.com", "from": "eve@example.com"},
                    "attachment": "invoice.pdf",
                    "status": "quarantined"
                },
                "meta": {"last_modified_on": "2023-07-19T12:37:00.028000+0000Z"}
            }
        })
    }

    #[test]
    fn test_format_alert_hidden() {
        let alerts = EventType::with_page_size("alerts", 20, 200, false);
        let event = format_event(&alert_record(), &alerts, true);
        assert_eq!(event["id"], "a1");
        assert!(event["email"]["headers"].get("subject").is_none());
        assert!(event["email"]["headers"].get("to").is_none());
        assert!(event["email"].get("attachment").is_none());
        assert_eq!(event["email"]["headers"]["from"], "eve@example.com");
        assert_eq!(event["_time"], "2023-07-19T12:37:00Z");
    }

    #[test]
    fn test_format_alert_visible() {
        let alerts = EventType::with_page_size("alerts", 20, 200, true);
        let event = format_event(&alert_record(), &alerts, false);
        assert_eq!(event["email"]["headers"]["subject"], "secret");
        assert_eq!(event["email"]["attachment"], "invoice.pdf");
    }

    #[test]
    fn test_format_email_trace_and_activity_log() {
        let record = json!({
            "id": "t1",
            "attributes": {"subject": "s", "attachmentNames": "a.zip", "lastModifiedDateTime": "2023-07-19T12:20:00.020000"}
        });
        let trace = format_event(&record, &EventType::new("email_trace", 20, false), true);
        assert!(trace.get("subject").is_none());
        assert!(trace.get("attachmentNames").is_none());
        assert_eq!(trace["_time"], "2023-07-19T12:20:00Z");

        let activity = json!({"id": "l1", "attributes": {"subject": "kept", "time": "2023-07-19T12:20:00Z"}});
        let log = format_event(&activity, &EventType::new("activity_log", 20, false), true);
        assert_eq!(log["subject"], "kept");
    }

    #[test]
    fn test_last_run_round_trip() {
        let mut stored = LastRun::new();
        stored.set(
            LAST_RUN_KEY,
            json!({
                "alerts": {"last_fetch_last_ids": ["a", "b"], "last_fetch_timestamp": "2023-07-19T12:37:00.028000"},
                "email_trace": {"last_fetch_last_ids": [], "last_fetch_timestamp": "2023-07-19T12:20:00.020000"}
            }),
        );
        let first_fetch = dt("2023-07-01T00:00:00Z");
        let types = vec![EventType::new("alerts", 25, false)];
        let state = EtpLastRun::from_last_run(&stored, &types, &first_fetch);
        assert_eq!(state.event_types.len(), 1);
        let last_run = state.to_last_run();
        let inner = last_run.get(LAST_RUN_KEY).unwrap();
        assert_eq!(inner["alerts"]["last_fetch_last_ids"], json!(["a", "b"]));
        assert_eq!(inner["alerts"]["last_fetch_timestamp"], "2023-07-19T12:37:00.028000");
        assert!(inner.get("email_trace").is_none());
    }

    #[test]
    fn test_missing_type_starts_at_first_fetch() {
        let first_fetch = dt("2023-07-01T00:00:00Z");
        let types = vec![EventType::new("activity_log", 25, false)];
        let state = EtpLastRun::from_last_run(&LastRun::new(), &types, &first_fetch);
        assert_eq!(
            state.event_types["activity_log"].last_fetch_timestamp.as_deref(),
            Some("2023-07-01T00:00:00.000000")
        );
    }

    #[test]
    fn test_empty_event_types_serialize_to_empty() {
        assert!(EtpLastRun::default().to_last_run().is_empty());
    }

    #[test]
    fn test_outbound_body() {
        let since = dt("2023-07-01T00:00:00Z");
        let body = EventType::new("alerts", 10, true).request_body(&since, 5);
        assert_eq!(body["size"], 5);
        assert_eq!(body["attributes"]["traffic_type"], "outbound");
        assert_eq!(
            body["attributes"]["lastModifiedDateTime"]["value"],
            "2023-07-01T00:00:00.000"
        );
        let log = EventType::new("activity_log", 10, true).request_body(&since, 5);
        assert!(log["attributes"].get("traffic_type").is_none());
    }
}
