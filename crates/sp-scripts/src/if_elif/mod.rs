//! If-Elif condition router.
//!
//! Takes an ordered list of `{"condition": ..., "return": ...}` entries and an
//! optional `{"else": ...}` entry, and returns the `return` value of the first
//! condition that holds.

mod eval;
mod lexer;
mod parser;

pub use eval::Val;
pub use parser::{parse, CmpOp, Expr, FUNCTIONS};

use crate::registry::{HostServices, Script, ScriptError, ScriptResult};
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;
use sp_connectors::{CommandArgs, CommandOutput, CommandResults};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

/// Errors raised while parsing or evaluating a condition expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),
}

/// Parses and evaluates `expression`, coercing the result to a boolean.
pub fn evaluate(expression: &str) -> Result<bool, ExpressionError> {
    let expr = parse(expression)?;
    Ok(eval::eval(&expr)?.truthy())
}

fn placeholder_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| Regex::new(r"#\{([^}]*)\}|#VALUE").unwrap())
}

/// Substitutes placeholders in the raw conditions text and parses it as JSON.
///
/// `#{path}` becomes the JSON of the context lookup at `path` and `#VALUE`
/// becomes the JSON of `value`.
pub fn load_conditions(raw: &str, value: Option<&str>, context: &Value) -> ScriptResult<Value> {
    let substituted = placeholder_regex().replace_all(raw, |caps: &Captures<'_>| {
        let replacement = match caps.get(1) {
            Some(path) => lookup_path(context, path.as_str()),
            None => value.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null),
        };
        replacement.to_string()
    });

    serde_json::from_str(&substituted).map_err(|e| {
        ScriptError::InvalidArguments(format!("Conditions are not valid JSON: {}", e))
    })
}

/// Looks up a dotted path such as `a.b.[0].c` in `context`.
///
/// A key applied to a list is applied to each of its elements. Missing paths
/// resolve to null.
pub fn lookup_path(context: &Value, path: &str) -> Value {
    let mut current = context.clone();
    for segment in path.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        current = step(&current, segment);
        if current.is_null() {
            break;
        }
    }
    current
}

fn step(value: &Value, segment: &str) -> Value {
    if let Some(index) = segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.trim().parse::<usize>().ok())
    {
        return match value {
            Value::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }

    match value {
        Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
        Value::Array(items) => {
            let found: Vec<Value> = items
                .iter()
                .map(|item| step(item, segment))
                .filter(|v| !v.is_null())
                .collect();
            if found.is_empty() {
                Value::Null
            } else {
                Value::Array(found)
            }
        }
        _ => Value::Null,
    }
}

/// Picks the `return` of the first matching entry, falling back to `else`.
pub fn select(conditions: &Value) -> ScriptResult<Option<Value>> {
    let entries = conditions.as_array().ok_or_else(|| {
        ScriptError::InvalidArguments("Conditions must be a JSON list".into())
    })?;

    let mut fallback = None;
    for (position, entry) in entries.iter().enumerate() {
        let object = entry.as_object().ok_or_else(|| {
            ScriptError::InvalidArguments(format!("Condition #{} is not an object", position + 1))
        })?;

        if let Some(otherwise) = object.get("else") {
            fallback.get_or_insert_with(|| otherwise.clone());
            continue;
        }

        let condition = object.get("condition").ok_or_else(|| {
            ScriptError::InvalidArguments(format!(
                "Condition #{} has no 'condition' key",
                position + 1
            ))
        })?;
        let holds = match condition {
            Value::String(expression) => evaluate(expression)?,
            other => Val::from(other).truthy(),
        };
        debug!(position, holds, "Evaluated condition");

        if holds {
            return Ok(Some(object.get("return").cloned().unwrap_or(Value::Null)));
        }
    }

    Ok(fallback)
}

/// Routes a value through an ordered list of conditions.
pub struct IfElif;

#[async_trait]
impl Script for IfElif {
    fn name(&self) -> &str {
        "IfElif"
    }

    fn description(&self) -> &str {
        "Returns the value of the first matching condition"
    }

    fn required_arguments(&self) -> Vec<&'static str> {
        vec!["conditions"]
    }

    async fn run(&self, args: &CommandArgs, host: &dyn HostServices) -> ScriptResult<CommandOutput> {
        let raw = match args.get("conditions") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => return Err(ScriptError::MissingArgument("conditions".into())),
        };
        let value = args.get_str("value");

        let conditions = load_conditions(&raw, value.as_deref(), host.context())?;
        let selected = match select(&conditions)? {
            Some(selected) => selected,
            None => return Ok(CommandOutput::Results(Vec::new())),
        };

        let readable = match &selected {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(CommandOutput::single(
            CommandResults::readable(readable).with_raw_response(selected),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;
    use serde_json::json;

    #[test]
    fn test_evaluate_truthy_expressions() {
        for expression in [
            "true and [1,2,3]",
            "1 and 2 < 3 < 4 or 5 or [] or 4",
            "1 or 2 or 0",
            r#"regex_match("\s", " ")"#,
        ] {
            assert!(evaluate(expression).unwrap(), "{}", expression);
        }
    }

    #[test]
    fn test_evaluate_falsy_expressions() {
        for expression in [
            "false and {1: 2, 3: [4,5,6,7]}",
            r#"regex_match("\s", "s")"#,
            "not 1 == 1",
            "3 < 2 < 4",
        ] {
            assert!(!evaluate(expression).unwrap(), "{}", expression);
        }
    }

    #[test]
    fn test_evaluate_rejects_unsafe_expressions() {
        for expression in [
            "word or 1",
            r#"__import__("os").system("RM -RF /")"#,
            "1 if 0 else 2",
            "sys.exit()",
        ] {
            assert!(
                matches!(evaluate(expression), Err(ExpressionError::Syntax(_))),
                "{}",
                expression
            );
        }
    }

    #[test]
    fn test_evaluate_deeply_nested_is_syntax_error() {
        let expression = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        assert!(matches!(evaluate(&expression), Err(ExpressionError::Syntax(_))));
    }

    #[test]
    fn test_load_conditions_substitutes_placeholders() {
        let context = json!({"a": {"b": [{"c": "value1"}]}});
        let loaded = load_conditions(
            r##"{"key1": #{a.b.[0].c}, "key2": #VALUE}"##,
            Some("value2"),
            &context,
        )
        .unwrap();
        assert_eq!(loaded, json!({"key1": "value1", "key2": "value2"}));
    }

    #[test]
    fn test_load_conditions_missing_path_is_null() {
        let loaded = load_conditions(r##"[#{x.y}]"##, None, &json!({})).unwrap();
        assert_eq!(loaded, json!([null]));
    }

    #[test]
    fn test_lookup_path_maps_over_lists() {
        let context = json!({"hosts": [{"ip": "1.1.1.1"}, {"ip": "2.2.2.2"}, {"name": "x"}]});
        assert_eq!(lookup_path(&context, "hosts.ip"), json!(["1.1.1.1", "2.2.2.2"]));
        assert_eq!(lookup_path(&context, "hosts.[5]"), Value::Null);
    }

    #[test]
    fn test_select_first_match_then_else() {
        let conditions = json!([
            {"condition": "1 > 2", "return": "first"},
            {"condition": "'a' in ['a']", "return": "second"},
            {"else": "fallback"}
        ]);
        assert_eq!(select(&conditions).unwrap(), Some(json!("second")));

        let none_match = json!([{"condition": "false", "return": 1}, {"else": 2}]);
        assert_eq!(select(&none_match).unwrap(), Some(json!(2)));

        let no_else = json!([{"condition": "false", "return": 1}]);
        assert_eq!(select(&no_else).unwrap(), None);
    }

    #[test]
    fn test_select_rejects_malformed_entries() {
        assert!(select(&json!({"condition": "true"})).is_err());
        assert!(select(&json!([{"return": 1}])).is_err());
        assert!(select(&json!(["true"])).is_err());
    }

    #[tokio::test]
    async fn test_run_returns_matching_value() {
        let host = MockHost::with_context(json!({"severity": 3}));
        let args = CommandArgs::new().with(
            "conditions",
            r##"[{"condition": "#{severity} >= 3", "return": "high"}, {"else": "low"}]"##,
        );
        let output = IfElif.run(&args, &host).await.unwrap();
        match output {
            CommandOutput::Results(results) => {
                assert_eq!(results[0].readable_output.as_deref(), Some("high"));
                assert_eq!(results[0].raw_response, Some(json!("high")));
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_with_no_match_returns_nothing() {
        let host = MockHost::default();
        let args = CommandArgs::new().with("conditions", r#"[{"condition": #VALUE, "return": 1}]"#);
        let output = IfElif.run(&args, &host).await.unwrap();
        assert_eq!(output, CommandOutput::Results(Vec::new()));
    }

    #[tokio::test]
    async fn test_run_reports_invalid_json() {
        let host = MockHost::default();
        let args = CommandArgs::new().with("conditions", "[{");
        let err = IfElif.run(&args, &host).await.unwrap_err();
        assert!(err.to_string().contains("Conditions are not valid JSON"));
    }
}
