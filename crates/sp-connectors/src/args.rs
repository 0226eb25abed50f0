//! Command arguments.
//!
//! The host hands every command a flat map of argument names to values. Values
//! usually arrive as strings even when they are numbers, booleans or lists, so
//! the accessors here coerce leniently.

use crate::time::parse_date_arg;
use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arguments of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(Map<String, Value>);

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder-style insert, handy in tests and scheduled commands.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Raw value; null and empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// String form of a value. Numbers and booleans are rendered as text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn require_str(&self, key: &str) -> ConnectorResult<String> {
        self.get_str(key).ok_or_else(|| {
            ConnectorError::invalid_argument(format!("Missing required argument: {}", key))
        })
    }

    pub fn get_number(&self, key: &str) -> ConnectorResult<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| invalid_number(key, &n.to_string())),
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
                    .map(Some)
                    .ok_or_else(|| invalid_number(key, s))
            }
            Some(other) => Err(invalid_number(key, &other.to_string())),
        }
    }

    pub fn get_number_or(&self, key: &str, default: i64) -> ConnectorResult<i64> {
        Ok(self.get_number(key)?.unwrap_or(default))
    }

    pub fn get_float(&self, key: &str) -> ConnectorResult<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| invalid_number(key, s)),
            Some(other) => Err(invalid_number(key, &other.to_string())),
        }
    }

    /// Accepts JSON booleans and `true`/`false`/`yes`/`no` in any case.
    pub fn get_bool(&self, key: &str) -> ConnectorResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => parse_bool(s).map(Some).ok_or_else(|| {
                ConnectorError::invalid_argument(format!(
                    "Argument {} does not contain a valid boolean-like value: {}",
                    key, s
                ))
            }),
            Some(other) => Err(ConnectorError::invalid_argument(format!(
                "Argument {} does not contain a valid boolean-like value: {}",
                key, other
            ))),
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> ConnectorResult<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    /// Comma-separated string or JSON array; items trimmed, empty items dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => split_list(s),
            Some(other) => vec![other.to_string()],
        }
    }

    pub fn get_datetime(&self, key: &str) -> ConnectorResult<Option<DateTime<Utc>>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(s) => parse_date_arg(&s).map(Some),
        }
    }

    /// A value that may arrive as JSON text or as an already-parsed value.
    pub fn get_json(&self, key: &str) -> ConnectorResult<Option<Value>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => serde_json::from_str(s).map(Some).map_err(|e| {
                ConnectorError::invalid_argument(format!("Argument {} is not valid JSON: {}", key, e))
            }),
            Some(other) => Ok(Some(other.clone())),
        }
    }
}

impl From<Map<String, Value>> for CommandArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Parses `true`/`false`/`yes`/`no`, case-insensitively.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Splits a comma-separated list, trimming items and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            return items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn invalid_number(key: &str, value: &str) -> ConnectorError {
    ConnectorError::invalid_argument(format!("Invalid number: \"{}\"=\"{}\"", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strings_and_required() {
        let args = CommandArgs::new().with("name", "value").with("empty", "").with("n", 5);
        assert_eq!(args.get_str("name").as_deref(), Some("value"));
        assert_eq!(args.get_str("n").as_deref(), Some("5"));
        assert_eq!(args.get_str("empty"), None);
        assert_eq!(args.get_str_or("missing", "dflt"), "dflt");

        let err = args.require_str("missing").unwrap_err();
        assert_eq!(err.to_string(), "Missing required argument: missing");
    }

    #[test]
    fn test_numbers() {
        let args = CommandArgs::new()
            .with("a", "50")
            .with("b", 7)
            .with("c", "abc")
            .with("d", "2.5");
        assert_eq!(args.get_number("a").unwrap(), Some(50));
        assert_eq!(args.get_number("b").unwrap(), Some(7));
        assert!(args.get_number("c").is_err());
        assert_eq!(args.get_number("d").unwrap(), Some(2));
        assert_eq!(args.get_float("d").unwrap(), Some(2.5));
        assert_eq!(args.get_number_or("missing", 10).unwrap(), 10);
    }

    #[test]
    fn test_booleans() {
        let args = CommandArgs::new()
            .with("a", "True")
            .with("b", "no")
            .with("c", true)
            .with("d", "maybe");
        assert_eq!(args.get_bool("a").unwrap(), Some(true));
        assert_eq!(args.get_bool("b").unwrap(), Some(false));
        assert_eq!(args.get_bool("c").unwrap(), Some(true));
        assert!(args.get_bool("d").is_err());
        assert!(!args.get_bool_or("missing", false).unwrap());
    }

    #[test]
    fn test_lists() {
        let args = CommandArgs::new()
            .with("csv", " a, b ,,c ")
            .with("arr", json!(["x", 1, null]))
            .with("json_text", "[\"p\", \"q\"]");
        assert_eq!(args.get_list("csv"), vec!["a", "b", "c"]);
        assert_eq!(args.get_list("arr"), vec!["x", "1"]);
        assert_eq!(args.get_list("json_text"), vec!["p", "q"]);
        assert!(args.get_list("missing").is_empty());
    }

    #[test]
    fn test_json_and_dates() {
        let args = CommandArgs::new()
            .with("obj", "{\"k\": 1}")
            .with("bad", "{nope")
            .with("when", "2023-01-02T03:04:05Z");
        assert_eq!(args.get_json("obj").unwrap(), Some(json!({"k": 1})));
        assert!(args.get_json("bad").is_err());
        let when = args.get_datetime("when").unwrap().unwrap();
        assert_eq!(when.to_rfc3339(), "2023-01-02T03:04:05+00:00");
    }
}
