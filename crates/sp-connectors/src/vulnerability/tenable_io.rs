//! Tenable Vulnerability Management (Tenable.io) integration.
//!
//! Scan control, workbench lookups, and the asynchronous asset, vulnerability
//! and scan-report exports. Exports are polling commands: the first call starts
//! the job and asks the host to re-run the command until the job finishes.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::http::{HttpClient, RateLimitConfig};
use crate::markdown::{format_cell, table_to_markdown, TableBuilder};
use crate::results::{CommandOutput, CommandResults, FileResult, ScheduledCommand};
use crate::secure_string::SecureString;
use crate::time::parse_date_arg_at;
use crate::traits::{AuthConfig, ConnectorError, ConnectorResult, Integration, TransportSettings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

pub const SCAN_PREFIX: &str = "TenableIO.Scan";
const SCAN_KEY: &str = "Id";

pub const ASSET_HEADERS: [&str; 11] = [
    "ASSET ID",
    "DNS NAME (FQDN)",
    "SYSTEM TYPE",
    "OPERATING SYSTEM",
    "IPV4 ADDRESS",
    "NETWORK",
    "FIRST SEEN",
    "LAST SEEN",
    "LAST LICENSED SCAN",
    "SOURCE",
    "TAGS",
];

pub const VULNERABILITY_HEADERS: [&str; 16] = [
    "ASSET ID",
    "ASSET NAME",
    "IPV4 ADDRESS",
    "OPERATING SYSTEM",
    "SYSTEM TYPE",
    "DNS NAME (FQDN)",
    "SEVERITY",
    "PLUGIN ID",
    "PLUGIN NAME",
    "VULNERABILITY PRIORITY RATING",
    "PROTOCOL",
    "PORT",
    "FIRST SEEN",
    "LAST SEEN",
    "DESCRIPTION",
    "SOLUTION",
];

const VPR_RANGE_ERROR: &str = "Please specify valid vprScoreRange. VPR values range are 0.1-10.0.";

/// Instance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenableIoConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(alias = "access-key")]
    pub access_key: SecureString,
    #[serde(alias = "secret-key")]
    pub secret_key: SecureString,
    #[serde(flatten)]
    pub transport: TransportSettings,
}

fn default_url() -> String {
    "https://cloud.tenable.com".to_string()
}

/// Severity label for a numeric severity.
pub fn severity_label(severity: i64) -> &'static str {
    match severity {
        1 => "Low",
        2 => "Medium",
        3 => "High",
        4 => "Critical",
        _ => "None",
    }
}

/// Decodes a Tenable response, phrasing failures by status code.
pub fn decode_response(status: u16, body: &str) -> ConnectorResult<Value> {
    let message = match status {
        200..=299 => {
            return serde_json::from_str(body).map_err(|_| {
                ConnectorError::VendorError(format!(
                    "Error processing request. Unexpected response from Tenable IO:\n{}",
                    body
                ))
            })
        }
        400 => "Got response status code: 400 - Possible reasons:\n\
                * The requested scan or history ID is invalid.\n\
                * The request parameters are malformed."
            .to_string(),
        404 => "Got response status code: 404 - Tenable Vulnerability Management cannot find the specified scan."
            .to_string(),
        429 => "Got response status code: 429 - Too Many Requests".to_string(),
        other => format!(
            "Error processing request. Got response status code: {}. Full Response:\n{}",
            other, body
        ),
    };
    Err(ConnectorError::VendorError(message))
}

/// Reads and decodes a response with [`decode_response`].
pub async fn get_json(response: Response) -> ConnectorResult<Value> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
    decode_response(status, &body)
}

/// Parses `low-high` with `0.1 <= low < high <= 10.0`.
pub fn validate_range(range: &str) -> ConnectorResult<(f64, f64)> {
    let invalid = || ConnectorError::VendorError(VPR_RANGE_ERROR.to_string());
    let (low, high) = range.split_once('-').ok_or_else(invalid)?;
    let low: f64 = low.trim().parse().map_err(|_| invalid())?;
    let high: f64 = high.trim().parse().map_err(|_| invalid())?;
    if low >= 0.1 && high <= 10.0 && low < high {
        Ok((low, high))
    } else {
        Err(invalid())
    }
}

/// Builds the `vpr_score` export filter from the VPR arguments.
pub fn build_vpr_score(args: &CommandArgs) -> ConnectorResult<Option<Value>> {
    let range = args.get_str("vprScoreRange");
    let operator = args.get_str("vprScoreOperator");
    let value = args.get_str("vprScoreValue");

    if range.is_some() && operator.is_some() {
        return Err(ConnectorError::VendorError(
            "Please specify only one of vprScoreRange or vprScoreOperator".to_string(),
        ));
    }

    if let Some(range) = range {
        let (low, high) = validate_range(&range)?;
        return Ok(Some(json!({"gte": low, "lte": high})));
    }

    match (operator, value) {
        (None, None) => Ok(None),
        (Some(operator), Some(value)) => {
            let value: f64 = value.trim().parse().map_err(|_| {
                ConnectorError::invalid_argument(format!("Invalid vprScoreValue: {}", value))
            })?;
            let mut score = json!({
                "eq": null, "neq": null, "gt": null, "lt": null, "gte": null, "lte": null
            });
            match operator.trim().to_ascii_lowercase().as_str() {
                "equal" | "eq" => score["eq"] = json!([value]),
                "not equal" | "neq" => score["neq"] = json!([value]),
                op @ ("gt" | "lt" | "gte" | "lte") => score[op] = json!(value),
                other => {
                    return Err(ConnectorError::invalid_argument(format!(
                        "Invalid vprScoreOperator: {}",
                        other
                    )))
                }
            }
            Ok(Some(score))
        }
        _ => Err(ConnectorError::VendorError(
            "Please specify vprScoreValue and vprScoreOperator".to_string(),
        )),
    }
}

/// Epoch seconds from an epoch string or a relative/absolute date.
pub fn relational_date_to_epoch_date_format(date: &str) -> ConnectorResult<i64> {
    relational_date_to_epoch_at(date, Utc::now())
}

pub fn relational_date_to_epoch_at(date: &str, now: DateTime<Utc>) -> ConnectorResult<i64> {
    let date = date.trim();
    if let Ok(epoch) = date.parse::<i64>() {
        return Ok(epoch);
    }
    Ok(parse_date_arg_at(date, now)?.timestamp())
}

fn string_list(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Array(items)) => Value::String(
            items
                .iter()
                .map(format_cell)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn asset_row(asset: &Value) -> Value {
    let sources = asset.get("sources").and_then(Value::as_array).map(|sources| {
        Value::Array(
            sources
                .iter()
                .filter_map(|s| s.get("name").cloned())
                .collect(),
        )
    });
    let tags = asset.get("tags").and_then(Value::as_array).map(|tags| {
        Value::Array(
            tags.iter()
                .map(|t| {
                    let key = t.get("key").map(format_cell).unwrap_or_default();
                    let value = t.get("value").map(format_cell).unwrap_or_default();
                    Value::String(format!("{}:{}", key, value))
                })
                .collect(),
        )
    });
    json!({
        "ASSET ID": asset.get("id"),
        "DNS NAME (FQDN)": string_list(asset.get("fqdns")),
        "SYSTEM TYPE": string_list(asset.get("system_types")),
        "OPERATING SYSTEM": string_list(asset.get("operating_systems")),
        "IPV4 ADDRESS": string_list(asset.get("ipv4s")),
        "NETWORK": asset.get("network_name"),
        "FIRST SEEN": asset.get("first_seen"),
        "LAST SEEN": asset.get("last_seen"),
        "LAST LICENSED SCAN": asset.get("last_licensed_scan_date"),
        "SOURCE": string_list(sources.as_ref()),
        "TAGS": string_list(tags.as_ref()),
    })
}

/// Results of a finished asset export.
pub fn export_assets_build_command_result(assets: Vec<Value>) -> CommandResults {
    let rows: Vec<Value> = assets.iter().map(asset_row).collect();
    let readable = TableBuilder::new("Assets").headers(&ASSET_HEADERS).render(&rows);
    CommandResults::new()
        .outputs("TenableIO.Asset", Some("id"), Value::Array(assets.clone()))
        .with_readable(readable)
        .with_raw_response(Value::Array(assets))
}

fn vulnerability_row(vuln: &Value) -> Value {
    let at = |pointer: &str| vuln.pointer(pointer).cloned().unwrap_or(Value::Null);
    json!({
        "ASSET ID": at("/asset/uuid"),
        "ASSET NAME": at("/asset/hostname"),
        "IPV4 ADDRESS": at("/asset/ipv4"),
        "OPERATING SYSTEM": string_list(vuln.pointer("/asset/operating_system")),
        "SYSTEM TYPE": at("/asset/device_type"),
        "DNS NAME (FQDN)": at("/asset/fqdn"),
        "SEVERITY": at("/severity"),
        "PLUGIN ID": at("/plugin/id"),
        "PLUGIN NAME": at("/plugin/name"),
        "VULNERABILITY PRIORITY RATING": at("/plugin/vpr/score"),
        "PROTOCOL": at("/port/protocol"),
        "PORT": at("/port/port"),
        "FIRST SEEN": at("/first_found"),
        "LAST SEEN": at("/last_found"),
        "DESCRIPTION": at("/plugin/description"),
        "SOLUTION": at("/plugin/solution"),
    })
}

/// Results of a finished vulnerability export.
pub fn export_vulnerabilities_build_command_result(vulnerabilities: Vec<Value>) -> CommandResults {
    let rows: Vec<Value> = vulnerabilities.iter().map(vulnerability_row).collect();
    let readable = TableBuilder::new("Vulnerabilities")
        .headers(&VULNERABILITY_HEADERS)
        .render(&rows);
    CommandResults::new()
        .outputs("TenableIO.Vulnerability", None, Value::Array(vulnerabilities.clone()))
        .with_readable(readable)
        .with_raw_response(Value::Array(vulnerabilities))
}

/// `snake_case` keys to `PascalCase`.
fn pascal_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let key: String = k
                .split('_')
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect();
            (key, v.clone())
        })
        .collect()
}

/// Which bulk export a polling command drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportKind {
    Assets,
    Vulnerabilities,
}

impl ExportKind {
    fn path(self) -> &'static str {
        match self {
            ExportKind::Assets => "assets/export",
            ExportKind::Vulnerabilities => "vulns/export",
        }
    }

    fn command(self) -> &'static str {
        match self {
            ExportKind::Assets => "tenable-io-export-assets",
            ExportKind::Vulnerabilities => "tenable-io-export-vulnerabilities",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ExportKind::Assets => "assets",
            ExportKind::Vulnerabilities => "vulnerabilities",
        }
    }
}

pub struct TenableIoIntegration {
    client: HttpClient,
}

impl TenableIoIntegration {
    pub fn new(config: TenableIoConfig) -> ConnectorResult<Self> {
        let api_keys = format!(
            "accessKey={};secretKey={}",
            config.access_key.expose_secret(),
            config.secret_key.expose_secret()
        );
        let connector = config
            .transport
            .connector_config("tenable-io", &config.url)
            .with_auth(AuthConfig::ApiKey {
                key: SecureString::new(api_keys),
                header_name: "X-ApiKeys".to_string(),
            })
            .with_header("Accept", "application/json");
        let rate_limit = RateLimitConfig {
            max_requests: 200,
            period: Duration::from_secs(60),
            burst_size: 20,
        };
        let client = HttpClient::with_rate_limit(connector, Some(rate_limit))?;
        info!(url = %config.url, "Tenable.io integration initialized");
        Ok(Self { client })
    }

    async fn call(&self, request: RequestBuilder) -> ConnectorResult<Value> {
        get_json(self.client.send_unchecked(request).await?).await
    }

    async fn get(&self, path: &str) -> ConnectorResult<Value> {
        self.call(self.client.request(Method::GET, path)).await
    }

    async fn get_with_query(&self, path: &str, query: &[(String, String)]) -> ConnectorResult<Value> {
        self.call(self.client.request(Method::GET, path).query(query)).await
    }

    async fn post(&self, path: &str, body: &Value) -> ConnectorResult<Value> {
        self.call(self.client.request(Method::POST, path).json(body)).await
    }

    /// `info` block of a scan.
    pub async fn get_scan_info(&self, scan_id: &str) -> ConnectorResult<Value> {
        let details = self.get(&format!("scans/{}", scan_id)).await?;
        Ok(details.get("info").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_scan_status(&self, scan_id: &str) -> ConnectorResult<String> {
        let info = self.get_scan_info(scan_id).await?;
        Ok(info
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    #[instrument(skip(self, args))]
    async fn list_scans_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let mut query = Vec::new();
        if let Some(folder) = args.get_str("folderId") {
            query.push(("folder_id".to_string(), folder));
        }
        let response = self.get_with_query("scans/", &query).await?;
        let scans = response
            .get("scans")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut outputs = Vec::with_capacity(scans.len());
        for scan in &scans {
            let id = scan.get("id").map(format_cell).unwrap_or_default();
            let info = self.get_scan_info(&id).await?;
            outputs.push(json!({
                "Id": scan.get("id"),
                "Name": scan.get("name"),
                "Targets": info.get("targets"),
                "Status": scan.get("status"),
                "StartTime": info.get("scan_start"),
                "EndTime": info.get("scan_end"),
                "Enabled": scan.get("enabled"),
                "Type": scan.get("type"),
                "Owner": scan.get("owner"),
                "Scanner": info.get("scanner_name"),
                "Policy": info.get("policy"),
                "CreationDate": scan.get("creation_date"),
                "LastModificationDate": scan.get("last_modification_date"),
                "FolderId": scan.get("folder_id"),
            }));
        }

        let readable = TableBuilder::new("Tenable.io - List of Scans")
            .headers(&["Id", "Name", "Status", "Targets", "Owner", "Scanner", "Policy", "Enabled", "Type"])
            .render(&outputs);
        Ok(CommandResults::new()
            .outputs(SCAN_PREFIX, Some(SCAN_KEY), Value::Array(outputs))
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn launch_scan_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let scan_id = args.require_str("scanId")?;
        let status = self.get_scan_status(&scan_id).await?;
        if status == "running" || status == "pending" {
            return Err(ConnectorError::VendorError(format!(
                "Can not launch scan {} while its status is {}",
                scan_id, status
            )));
        }

        let targets = args.get_list("scanTargets");
        let body = if targets.is_empty() {
            json!({})
        } else {
            json!({"alt_targets": targets})
        };
        let response = self.post(&format!("scans/{}/launch", scan_id), &body).await?;

        let output = json!({
            "Id": scan_id,
            "Targets": targets.join(","),
            "Status": "pending",
        });
        let readable = table_to_markdown(
            "The requested scan was launched successfully",
            &output,
            Some(&["Id", "Targets", "Status"]),
        );
        Ok(CommandResults::new()
            .outputs(SCAN_PREFIX, Some(SCAN_KEY), output)
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    async fn get_scan_status_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let scan_id = args.require_str("scanId")?;
        let status = self.get_scan_status(&scan_id).await?;
        let output = json!({"Id": scan_id, "Status": status});
        let readable = table_to_markdown(&format!("Scan status for {}", scan_id), &output, None);
        Ok(CommandResults::new()
            .outputs(SCAN_PREFIX, Some(SCAN_KEY), output)
            .with_readable(readable)
            .into())
    }

    /// Pauses or resumes each scan in `scanId`; scans in the wrong state produce error entries.
    async fn pause_or_resume(&self, args: &CommandArgs, pause: bool) -> ConnectorResult<CommandOutput> {
        let (command, required, action, new_status) = if pause {
            ("tenable-io-pause-scan", "running", "pause", "Pausing")
        } else {
            ("tenable-io-resume-scan", "paused", "resume", "Resuming")
        };

        let ids = args.get_list("scanId");
        if ids.is_empty() {
            return Err(ConnectorError::invalid_argument("Missing required argument: scanId"));
        }

        let mut results = Vec::with_capacity(ids.len());
        for scan_id in ids {
            let status = self.get_scan_status(&scan_id).await?;
            if status != required {
                results.push(CommandResults::error(format!(
                    "Command '{}' cannot be called while scan status is {} for scanID {}",
                    command, status, scan_id
                )));
                continue;
            }
            self.post(&format!("scans/{}/{}", scan_id, action), &json!({}))
                .await?;
            let output = json!({"Id": scan_id, "Status": new_status});
            let title = if pause {
                "The requested scan was paused successfully"
            } else {
                "The requested scan was resumed successfully"
            };
            results.push(
                CommandResults::new()
                    .outputs(SCAN_PREFIX, Some(SCAN_KEY), output.clone())
                    .with_readable(table_to_markdown(title, &output, Some(&["Id", "Status"]))),
            );
        }
        Ok(CommandOutput::Results(results))
    }

    async fn get_vulnerability_details_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let vuln_id = args.require_str("vulnerabilityId")?;
        let mut query = Vec::new();
        if let Some(range) = args.get_str("dateRange") {
            query.push(("date_range".to_string(), range));
        }
        let response = self
            .get_with_query(&format!("workbenches/vulnerabilities/{}/info", vuln_id), &query)
            .await?;
        let info = response
            .get("info")
            .and_then(Value::as_object)
            .map(pascal_keys)
            .unwrap_or_default();
        let output = Value::Object(info);
        let readable = table_to_markdown(
            &format!("Vulnerability details - {}", vuln_id),
            &output,
            None,
        );
        Ok(CommandResults::new()
            .outputs("TenableIO.Vulnerabilities", None, output)
            .with_readable(readable)
            .with_raw_response(response)
            .into())
    }

    /// Id of the first workbench asset matching a hostname or an IP.
    async fn find_asset_id(&self, field: &str, value: &str, date_range: Option<String>) -> ConnectorResult<Option<String>> {
        let mut query = vec![
            ("filter.0.quality".to_string(), "eq".to_string()),
            ("filter.0.filter".to_string(), field.to_string()),
            ("filter.0.value".to_string(), value.to_string()),
        ];
        if let Some(range) = date_range {
            query.push(("date_range".to_string(), range));
        }
        let response = self.get_with_query("workbenches/assets", &query).await?;
        Ok(response
            .pointer("/assets/0/id")
            .map(format_cell)
            .filter(|id| !id.is_empty()))
    }

    async fn get_vulnerabilities_by_asset_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let (field, target) = match (args.get_str("hostname"), args.get_str("ip")) {
            (Some(hostname), _) => ("host.target", hostname),
            (None, Some(ip)) => ("ipv4", ip),
            (None, None) => {
                return Err(ConnectorError::invalid_argument(
                    "Please provide one of the following arguments: hostname, ip",
                ))
            }
        };
        let date_range = args.get_str("dateRange");

        let Some(asset_id) = self.find_asset_id(field, &target, date_range.clone()).await? else {
            return Ok(CommandResults::readable(format!("No asset found for {}", target)).into());
        };

        let mut query = Vec::new();
        if let Some(range) = date_range {
            query.push(("date_range".to_string(), range));
        }
        let response = self
            .get_with_query(&format!("workbenches/assets/{}/vulnerabilities/", asset_id), &query)
            .await?;
        let vulnerabilities: Vec<Value> = response
            .get("vulnerabilities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| {
                        json!({
                            "Id": v.get("plugin_id"),
                            "Name": v.get("plugin_name"),
                            "Severity": severity_label(v.get("severity").and_then(Value::as_i64).unwrap_or(0)),
                            "Family": v.get("plugin_family"),
                            "VulnerabilityOccurences": v.get("count"),
                            "VulnerabilityState": v.get("vulnerability_state"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ids: Vec<Value> = vulnerabilities.iter().filter_map(|v| v.get("Id").cloned()).collect();
        let readable = table_to_markdown(
            &format!("Vulnerabilities for asset {}", target),
            &Value::Array(vulnerabilities.clone()),
            Some(&["Id", "Name", "Severity", "Family", "VulnerabilityOccurences", "VulnerabilityState"]),
        );
        Ok(CommandOutput::Results(vec![
            CommandResults::new()
                .outputs("TenableIO.Vulnerabilities", None, Value::Array(vulnerabilities))
                .with_readable(readable)
                .with_raw_response(response),
            CommandResults::new().outputs(
                "TenableIO.Assets",
                Some("Hostname"),
                json!({"Hostname": target, "Vulnerabilities": ids}),
            ),
        ]))
    }

    async fn get_asset_details_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let ip = args.require_str("ip")?;
        let Some(asset_id) = self.find_asset_id("ipv4", &ip, None).await? else {
            return Ok(CommandResults::readable(format!("Asset not found for ip {}", ip)).into());
        };

        let info = self.get(&format!("workbenches/assets/{}/info", asset_id)).await?;
        let attributes = self
            .get(&format!("api/v3/assets/{}/attributes", asset_id))
            .await?;

        let mut details = info
            .get("info")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let attribute_list: Vec<Value> = attributes
            .get("attributes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| {
                        let name = a.get("name")?.as_str()?;
                        let mut entry = Map::new();
                        entry.insert(name.to_string(), a.get("value").cloned().unwrap_or(Value::Null));
                        Some(Value::Object(entry))
                    })
                    .collect()
            })
            .unwrap_or_default();
        details.insert("attributes".to_string(), Value::Array(attribute_list));
        let details = Value::Object(details);

        let readable = TableBuilder::new(&format!("Asset Info for {}", ip))
            .remove_null(true)
            .render(std::slice::from_ref(&details));
        Ok(CommandResults::new()
            .outputs("TenableIO.AssetDetails", Some("id"), details)
            .with_readable(readable)
            .into())
    }

    fn export_filters(&self, kind: ExportKind, args: &CommandArgs) -> ConnectorResult<Value> {
        let mut filters = Map::new();
        let epoch = |key: &str| -> ConnectorResult<Option<i64>> {
            args.get_str(key)
                .map(|v| relational_date_to_epoch_date_format(&v))
                .transpose()
        };

        match kind {
            ExportKind::Assets => {
                for (arg, filter) in [
                    ("createdAt", "created_at"),
                    ("updatedAt", "updated_at"),
                    ("terminatedAt", "terminated_at"),
                    ("deletedAt", "deleted_at"),
                    ("firstScanTime", "first_scan_time"),
                    ("lastAuthenticatedScanTime", "last_authenticated_scan_time"),
                    ("lastAssessed", "last_assessed"),
                ] {
                    if let Some(ts) = epoch(arg)? {
                        filters.insert(filter.to_string(), json!(ts));
                    }
                }
                let sources = args.get_list("sources");
                if !sources.is_empty() {
                    filters.insert("sources".to_string(), json!(sources));
                }
                if let Some(has_results) = args.get_bool("hasPluginResults")? {
                    filters.insert("has_plugin_results".to_string(), json!(has_results));
                }
                if let Some(sysid) = args.get_bool("serviceNowSysId")? {
                    filters.insert("servicenow_sysid".to_string(), json!(sysid));
                }
            }
            ExportKind::Vulnerabilities => {
                for (arg, filter) in [
                    ("firstFound", "first_found"),
                    ("lastFound", "last_found"),
                    ("lastFixed", "last_fixed"),
                    ("since", "since"),
                ] {
                    if let Some(ts) = epoch(arg)? {
                        filters.insert(filter.to_string(), json!(ts));
                    }
                }
                for (arg, filter) in [("severity", "severity"), ("state", "state"), ("pluginFamily", "plugin_family")] {
                    let values: Vec<String> = args.get_list(arg).into_iter().map(|v| v.to_lowercase()).collect();
                    if !values.is_empty() {
                        filters.insert(filter.to_string(), json!(values));
                    }
                }
                let plugin_ids: Vec<i64> = args
                    .get_list("pluginId")
                    .iter()
                    .filter_map(|id| id.parse().ok())
                    .collect();
                if !plugin_ids.is_empty() {
                    filters.insert("plugin_id".to_string(), json!(plugin_ids));
                }
                if let Some(cidr) = args.get_str("cidrRange") {
                    filters.insert("cidr_range".to_string(), json!(cidr));
                }
                if let Some(vpr) = build_vpr_score(args)? {
                    filters.insert("vpr_score".to_string(), vpr);
                }
            }
        }

        if let (Some(category), Some(value)) = (args.get_str("tagCategory"), args.get_str("tagValue")) {
            let values = args.get_list("tagValue");
            let values = if values.is_empty() { vec![value] } else { values };
            filters.insert(format!("tag.{}", category), json!(values));
        }

        Ok(Value::Object(filters))
    }

    /// Starts an export and returns its uuid.
    async fn export_request(&self, kind: ExportKind, args: &CommandArgs) -> ConnectorResult<String> {
        let mut body = Map::new();
        match kind {
            ExportKind::Assets => {
                body.insert("chunk_size".into(), json!(args.get_number_or("chunkSize", 100)?));
            }
            ExportKind::Vulnerabilities => {
                body.insert("num_assets".into(), json!(args.get_number_or("numAssets", 50)?));
            }
        }
        body.insert("filters".into(), self.export_filters(kind, args)?);

        let response = self.post(kind.path(), &Value::Object(body)).await?;
        response
            .get("export_uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::VendorError(format!("Unexpected response from Tenable IO: {}", response))
            })
    }

    /// Polls, reschedules or completes an asset/vulnerability export.
    async fn export_command(&self, kind: ExportKind, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let interval = args.get_number_or("intervalInSeconds", 15)?.max(1) as u64;
        let timeout = args.get_number_or("timeout", 600)?.max(1) as u64;
        let waiting = format!("Waiting for export {} to finish...", kind.label());

        let Some(export_uuid) = args.get_str("exportUuid") else {
            let uuid = self.export_request(kind, args).await?;
            debug!(export_uuid = %uuid, "Export started");
            let next_args = args.clone().with("exportUuid", uuid);
            let scheduled = ScheduledCommand::new(kind.command(), next_args, interval).with_timeout(timeout);
            return Ok(CommandResults::readable(waiting).with_scheduled(scheduled).into());
        };

        let status = self
            .get(&format!("{}/{}/status", kind.path(), export_uuid))
            .await?;
        let state = status.get("status").and_then(Value::as_str).unwrap_or_default();
        match state {
            "FINISHED" => {
                let chunks: Vec<i64> = status
                    .get("chunks_available")
                    .and_then(Value::as_array)
                    .map(|c| c.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let mut records = Vec::new();
                for chunk in chunks {
                    let data = self
                        .get(&format!("{}/{}/chunks/{}", kind.path(), export_uuid, chunk))
                        .await?;
                    if let Value::Array(items) = data {
                        records.extend(items);
                    }
                }
                info!(export_uuid = %export_uuid, count = records.len(), "Export finished");
                Ok(match kind {
                    ExportKind::Assets => export_assets_build_command_result(records),
                    ExportKind::Vulnerabilities => export_vulnerabilities_build_command_result(records),
                }
                .into())
            }
            "ERROR" | "CANCELLED" => Err(ConnectorError::VendorError(format!(
                "Tenable IO encountered an error while exporting {} with uuid {}. Status: {}",
                kind.label(),
                export_uuid,
                state
            ))),
            _ => {
                let scheduled =
                    ScheduledCommand::new(kind.command(), args.clone(), interval).with_timeout(timeout);
                Ok(CommandResults::readable(waiting).with_scheduled(scheduled).into())
            }
        }
    }

    async fn list_scan_filters_command(&self) -> ConnectorResult<CommandOutput> {
        let response = self.get("filters/scans/reports").await?;
        let filters = response
            .get("filters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let rows: Vec<Value> = filters
            .iter()
            .map(|f| {
                json!({
                    "Filter name": f.get("name"),
                    "Filter Readable name": f.get("readable_name"),
                    "Filter Control type": f.pointer("/control/type"),
                    "Filter regex": f.pointer("/control/regex"),
                    "Readable regex": f.pointer("/control/readable_regex"),
                    "Filter operators": string_list(f.get("operators")),
                    "Group name": f.get("group_name"),
                })
            })
            .collect();
        let readable = TableBuilder::new("Tenable IO Scan Filters")
            .remove_null(true)
            .render(&rows);
        Ok(CommandResults::new()
            .outputs("TenableIO.ScanFilter", Some("name"), Value::Array(filters))
            .with_readable(readable)
            .into())
    }

    async fn get_scan_history_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let scan_id = args.require_str("scanId")?;
        let limit = args.get_number_or("pageSize", args.get_number_or("limit", 50)?)?;
        let page = args.get_number_or("page", 1)?.max(1);

        let mut query = vec![
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), ((page - 1) * limit).to_string()),
        ];
        if let Some(exclude) = args.get_bool("excludeRollover")? {
            query.push(("exclude_rollover".to_string(), exclude.to_string()));
        }
        let fields = args.get_list("sortFields");
        if !fields.is_empty() {
            let order = args.get_str_or("sortOrder", "desc");
            let sort = fields
                .iter()
                .map(|f| format!("{}:{}", f, order))
                .collect::<Vec<_>>()
                .join(",");
            query.push(("sort".to_string(), sort));
        }

        let response = self
            .get_with_query(&format!("scans/{}/history", scan_id), &query)
            .await?;
        let history = response
            .get("history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let rows: Vec<Value> = history
            .iter()
            .map(|h| {
                json!({
                    "History id": h.get("id"),
                    "History uuid": h.get("scan_uuid"),
                    "Status": h.get("status"),
                    "Is archived": h.get("is_archived"),
                    "Targets default": h.pointer("/targets/default"),
                    "Visibility": h.get("visibility"),
                    "Time start": h.get("time_start"),
                    "Time end": h.get("time_end"),
                })
            })
            .collect();
        let readable = TableBuilder::new("Tenable IO Scan History").render(&rows);
        Ok(CommandResults::new()
            .outputs("TenableIO.ScanHistory", Some("id"), Value::Array(history))
            .with_readable(readable)
            .into())
    }

    /// Requests a scan report export and returns the report file id.
    pub async fn initiate_export_scan(&self, args: &CommandArgs) -> ConnectorResult<String> {
        let scan_id = args.get_str_or("scanId", "");
        let format = args.get_str_or("format", "csv").to_lowercase();
        let chapters = args.get_list("chapters");
        if (format == "pdf" || format == "html") && chapters.is_empty() {
            return Err(ConnectorError::VendorError(
                "The \"chapters\" field must be provided for PDF or HTML formats.".to_string(),
            ));
        }

        let mut query = Vec::new();
        if let Some(history_id) = args.get_str("historyId") {
            query.push(("history_id".to_string(), history_id));
        }
        if let Some(history_uuid) = args.get_str("historyUuid") {
            query.push(("history_uuid".to_string(), history_uuid));
        }

        let mut body = Map::new();
        body.insert("format".into(), json!(format));
        if !chapters.is_empty() {
            body.insert("chapters".into(), json!(chapters.join(";")));
        }
        let filters = args.get_list("filter");
        for (i, filter) in filters.iter().enumerate() {
            let mut parts = filter.splitn(3, ' ');
            if let (Some(name), Some(quality), Some(value)) = (parts.next(), parts.next(), parts.next()) {
                body.insert(format!("filter.{}.filter", i), json!(name));
                body.insert(format!("filter.{}.quality", i), json!(quality));
                body.insert(format!("filter.{}.value", i), json!(value));
            }
        }
        if let Some(search_type) = args.get_str("filterSearchType") {
            body.insert("filter.search_type".into(), json!(search_type.to_lowercase()));
        }
        if let Some(asset_id) = args.get_str("assetId") {
            body.insert("asset_id".into(), json!(asset_id));
        }

        let request = self
            .client
            .request(Method::POST, &format!("scans/{}/export", scan_id))
            .query(&query)
            .json(&Value::Object(body));
        let response = self.call(request).await?;
        response
            .get("file")
            .map(format_cell)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                ConnectorError::VendorError(format!("Unexpected response from Tenable IO: {}", response))
            })
    }

    pub async fn check_export_scan_status(&self, scan_id: &str, file_id: &str) -> ConnectorResult<String> {
        let response = self
            .get(&format!("scans/{}/export/{}/status", scan_id, file_id))
            .await?;
        Ok(response
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn download_export_scan(&self, scan_id: &str, file_id: &str, format: &str) -> ConnectorResult<FileResult> {
        let response = self
            .client
            .send(self.client.request(
                Method::GET,
                &format!("scans/{}/export/{}/download", scan_id, file_id),
            ))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        Ok(FileResult::new(
            format!("scan_{}_{}.{}", scan_id, file_id, format.to_lowercase()),
            bytes.to_vec(),
        ))
    }

    async fn export_scan_command(&self, args: &CommandArgs) -> ConnectorResult<CommandOutput> {
        let scan_id = args.get_str_or("scanId", "");
        let format = args.get_str_or("format", "csv").to_lowercase();
        let interval = args.get_number_or("intervalInSeconds", 10)?.max(1) as u64;
        let timeout = args.get_number_or("timeout", 600)?.max(1) as u64;

        let file_id = match args.get_str("fileId") {
            Some(file_id) => file_id,
            None => self.initiate_export_scan(args).await?,
        };

        match self.check_export_scan_status(&scan_id, &file_id).await?.as_str() {
            "ready" => Ok(CommandOutput::File(
                self.download_export_scan(&scan_id, &file_id, &format).await?,
            )),
            "loading" => {
                let next_args = args.clone().with("fileId", file_id);
                let scheduled =
                    ScheduledCommand::new("tenable-io-export-scan", next_args, interval).with_timeout(timeout);
                Ok(CommandResults::readable("Waiting for the scan report export to finish...")
                    .with_scheduled(scheduled)
                    .into())
            }
            "error" => Err(ConnectorError::VendorError(
                "Tenable IO encountered an error while exporting the scan report file.".to_string(),
            )),
            other => Err(ConnectorError::VendorError(format!(
                "Got unexpected status while exporting the scan report file: '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl Integration for TenableIoIntegration {
    fn name(&self) -> &str {
        "Tenable.io"
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![
            "tenable-io-list-scans",
            "tenable-io-launch-scan",
            "tenable-io-get-scan-status",
            "tenable-io-pause-scan",
            "tenable-io-resume-scan",
            "tenable-io-get-vulnerability-details",
            "tenable-io-get-vulnerabilities-by-asset",
            "tenable-io-get-asset-details",
            "tenable-io-export-assets",
            "tenable-io-export-vulnerabilities",
            "tenable-io-list-scan-filters",
            "tenable-io-get-scan-history",
            "tenable-io-export-scan",
        ]
    }

    async fn test_module(&self) -> ConnectorResult<String> {
        self.get("scans/").await?;
        Ok("ok".to_string())
    }

    async fn execute(
        &self,
        command: &str,
        args: &CommandArgs,
        _last_run: &mut LastRun,
    ) -> ConnectorResult<CommandOutput> {
        match command {
            "tenable-io-list-scans" => self.list_scans_command(args).await,
            "tenable-io-launch-scan" => self.launch_scan_command(args).await,
            "tenable-io-get-scan-status" => self.get_scan_status_command(args).await,
            "tenable-io-pause-scan" => self.pause_or_resume(args, true).await,
            "tenable-io-resume-scan" => self.pause_or_resume(args, false).await,
            "tenable-io-get-vulnerability-details" => self.get_vulnerability_details_command(args).await,
            "tenable-io-get-vulnerabilities-by-asset" => {
                self.get_vulnerabilities_by_asset_command(args).await
            }
            "tenable-io-get-asset-details" => self.get_asset_details_command(args).await,
            "tenable-io-export-assets" => self.export_command(ExportKind::Assets, args).await,
            "tenable-io-export-vulnerabilities" => {
                self.export_command(ExportKind::Vulnerabilities, args).await
            }
            "tenable-io-list-scan-filters" => self.list_scan_filters_command().await,
            "tenable-io-get-scan-history" => self.get_scan_history_command(args).await,
            "tenable-io-export-scan" => self.export_scan_command(args).await,
            other => Err(ConnectorError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_range() {
        assert_eq!(validate_range("2.5-3").unwrap(), (2.5, 3.0));
        assert_eq!(validate_range("2.5-3.5").unwrap(), (2.5, 3.5));
        assert_eq!(validate_range("0.1-3").unwrap(), (0.1, 3.0));
        assert_eq!(validate_range("0.1 - 3").unwrap(), (0.1, 3.0));
        for bad in ["0", "3-0", "0-3", "5-11"] {
            assert_eq!(validate_range(bad).unwrap_err().to_string(), VPR_RANGE_ERROR);
        }
    }

    #[test]
    fn test_build_vpr_score_validation() {
        let both = CommandArgs::new()
            .with("vprScoreOperator", "eq")
            .with("vprScoreValue", "3.5")
            .with("vprScoreRange", "3.5-3");
        assert_eq!(
            build_vpr_score(&both).unwrap_err().to_string(),
            "Please specify only one of vprScoreRange or vprScoreOperator"
        );

        let no_value = CommandArgs::new()
            .with("vprScoreOperator", "eq")
            .with("vprScoreValue", "")
            .with("vprScoreRange", "");
        assert_eq!(
            build_vpr_score(&no_value).unwrap_err().to_string(),
            "Please specify vprScoreValue and vprScoreOperator"
        );

        let no_operator = CommandArgs::new()
            .with("vprScoreOperator", "")
            .with("vprScoreValue", "3.5");
        assert_eq!(
            build_vpr_score(&no_operator).unwrap_err().to_string(),
            "Please specify vprScoreValue and vprScoreOperator"
        );
    }

    #[test]
    fn test_build_vpr_score() {
        let score = |op: &str| {
            build_vpr_score(
                &CommandArgs::new()
                    .with("vprScoreOperator", op)
                    .with("vprScoreValue", "3.5"),
            )
            .unwrap()
            .unwrap()
        };
        assert_eq!(
            score("equal"),
            json!({"eq": [3.5], "neq": null, "gt": null, "lt": null, "gte": null, "lte": null})
        );
        assert_eq!(
            score("not equal"),
            json!({"eq": null, "neq": [3.5], "gt": null, "lt": null, "gte": null, "lte": null})
        );
        assert_eq!(
            score("lt"),
            json!({"eq": null, "neq": null, "gt": null, "lt": 3.5, "gte": null, "lte": null})
        );
        assert_eq!(
            score("gte"),
            json!({"eq": null, "neq": null, "gt": null, "lt": null, "gte": 3.5, "lte": null})
        );

        let range = build_vpr_score(&CommandArgs::new().with("vprScoreRange", "2 - 3.3"))
            .unwrap()
            .unwrap();
        assert_eq!(range, json!({"gte": 2.0, "lte": 3.3}));

        assert_eq!(build_vpr_score(&CommandArgs::new()).unwrap(), None);
    }

    #[test]
    fn test_relational_date_to_epoch() {
        let now = Utc.with_ymd_and_hms(2012, 1, 14, 0, 0, 0).unwrap();
        assert_eq!(relational_date_to_epoch_at("1 day ago", now).unwrap(), 1326412800);
        assert_eq!(relational_date_to_epoch_at("2 days ago", now).unwrap(), 1326326400);
        assert_eq!(relational_date_to_epoch_at("1326232800", now).unwrap(), 1326232800);
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response(200, r#"{"key": "value"}"#).unwrap(), json!({"key": "value"}));
        assert!(decode_response(400, "")
            .unwrap_err()
            .to_string()
            .starts_with("Got response status code: 400 - Possible reasons:\n"));
        assert_eq!(
            decode_response(404, "").unwrap_err().to_string(),
            "Got response status code: 404 - Tenable Vulnerability Management cannot find the specified scan."
        );
        assert_eq!(
            decode_response(429, "").unwrap_err().to_string(),
            "Got response status code: 429 - Too Many Requests"
        );
        assert!(decode_response(500, "oops")
            .unwrap_err()
            .to_string()
            .contains(". Full Response:\noops"));
        assert_eq!(
            decode_response(200, "blabla").unwrap_err().to_string(),
            "Error processing request. Unexpected response from Tenable IO:\nblabla"
        );
    }

    fn export_asset() -> Value {
        json!({
            "id": "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX",
            "fqdns": ["some_fqdns"],
            "system_types": ["general-purpose"],
            "operating_systems": ["Linux Kernel 2.6"],
            "ipv4s": ["00.000.00.00"],
            "network_name": "Default",
            "first_seen": "2024-08-13T15:11:08.145Z",
            "last_seen": "2024-08-13T15:11:08.145Z",
            "last_licensed_scan_date": "2022-12-28T17:10:47.756Z",
            "sources": [{"name": "SOME_SCAN", "first_seen": "2024-08-13T15:11:08.145Z"}],
            "tags": [{"key": "some_key", "value": "test"}]
        })
    }

    #[test]
    fn test_export_assets_build_command_result() {
        let assets = vec![export_asset()];
        let result = export_assets_build_command_result(assets.clone());
        assert_eq!(result.outputs, Some(Value::Array(assets.clone())));
        assert_eq!(result.raw_response, Some(Value::Array(assets)));
        let expected = format!(
            "### Assets\n|{}|\n|{}|\n| {} |\n",
            ASSET_HEADERS.join("|"),
            vec!["---"; 11].join("|"),
            [
                "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX",
                "some_fqdns",
                "general-purpose",
                "Linux Kernel 2.6",
                "00.000.00.00",
                "Default",
                "2024-08-13T15:11:08.145Z",
                "2024-08-13T15:11:08.145Z",
                "2022-12-28T17:10:47.756Z",
                "SOME_SCAN",
                "some_key:test"
            ]
            .join(" | ")
        );
        assert_eq!(result.readable_output.unwrap(), expected);
    }

    #[test]
    fn test_export_vulnerabilities_build_command_result() {
        let vuln = json!({
            "asset": {
                "uuid": "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX",
                "hostname": "some_hostname",
                "ipv4": "00.000.00.00",
                "operating_system": ["Linux Kernel 2.6"],
                "device_type": "general-purpose",
                "fqdn": "some_fqdn"
            },
            "severity": "info",
            "plugin": {
                "id": 11111,
                "name": "some_name",
                "vpr": {"score": 5.2},
                "description": "some_description",
                "solution": "solution."
            },
            "port": {"protocol": "TCP", "port": 21},
            "first_found": "2023-08-15T15:56:18.852Z",
            "last_found": "2023-08-15T15:56:18.852Z"
        });
        let result = export_vulnerabilities_build_command_result(vec![vuln]);
        let expected = format!(
            "### Vulnerabilities\n|{}|\n|{}|\n| {} |\n",
            VULNERABILITY_HEADERS.join("|"),
            vec!["---"; 16].join("|"),
            [
                "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX",
                "some_hostname",
                "00.000.00.00",
                "Linux Kernel 2.6",
                "general-purpose",
                "some_fqdn",
                "info",
                "11111",
                "some_name",
                "5.2",
                "TCP",
                "21",
                "2023-08-15T15:56:18.852Z",
                "2023-08-15T15:56:18.852Z",
                "some_description",
                "solution."
            ]
            .join(" | ")
        );
        assert_eq!(result.readable_output.unwrap(), expected);
    }

    #[test]
    fn test_severity_label() {
        assert_eq!(severity_label(0), "None");
        assert_eq!(severity_label(2), "Medium");
        assert_eq!(severity_label(4), "Critical");
    }
}
