//! `script`: runs a built-in automation script against a local host.

use crate::config::AppConfig;
use crate::host::LocalHost;
use crate::output::{print_entries, OutputFormat};
use anyhow::{Context, Result};
use serde_json::Value;
use sp_connectors::{build_integration, CommandArgs};
use sp_scripts::{is_error_entry, ScriptRegistry};
use std::path::Path;
use tracing::warn;

/// Reads a context document; YAML is accepted as well as JSON.
pub fn load_context(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Object(Default::default()));
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse context file: {}", path.display()))
}

/// Builds a host with every enabled instance available for command routing.
fn build_host(config: &AppConfig, context: Value) -> LocalHost {
    let mut host = LocalHost::new(context);
    for (name, instance) in config.instances.iter().filter(|(_, i)| i.enabled) {
        match build_integration(instance.integration, instance.params.clone()) {
            Ok(integration) => host = host.with_integration(name.clone(), integration),
            Err(e) => warn!(instance = %name, error = %e, "Skipping instance"),
        }
    }
    host
}

/// Runs the named script. Returns false when it produced an error entry.
pub async fn run_script(
    config: &AppConfig,
    name: &str,
    args: CommandArgs,
    context: Value,
    format: OutputFormat,
) -> Result<bool> {
    let registry = ScriptRegistry::with_builtin();
    let host = build_host(config, context);

    let entries = registry.invoke(name, &args, &host).await.to_entries();
    print_entries(&entries, format)?;

    let created = host.created_incidents();
    if !created.is_empty() && format == OutputFormat::Text {
        eprintln!("Created {} incident(s) in the local host", created.len());
    }

    Ok(!entries.iter().any(is_error_entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_context_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("ctx.json");
        std::fs::write(&json_path, r#"{"a": {"b": [1]}}"#).unwrap();
        assert_eq!(load_context(Some(&json_path)).unwrap(), json!({"a": {"b": [1]}}));

        let yaml_path = dir.path().join("ctx.yaml");
        std::fs::write(&yaml_path, "a:\n  b:\n    - 1\n").unwrap();
        assert_eq!(load_context(Some(&yaml_path)).unwrap(), json!({"a": {"b": [1]}}));

        assert_eq!(load_context(None).unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_run_if_elif() {
        let args = CommandArgs::new()
            .with("conditions", r##"[{"condition": "#{a.b.[0]} == 1", "return": "one"}]"##);
        let ok = run_script(
            &AppConfig::default(),
            "IfElif",
            args,
            json!({"a": {"b": [1]}}),
            OutputFormat::Json,
        )
        .await
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_run_hunting_without_indicator_fails() {
        let ok = run_script(
            &AppConfig::default(),
            "HuntingFromIndicatorLayout",
            CommandArgs::new(),
            json!({}),
            OutputFormat::Json,
        )
        .await
        .unwrap();
        assert!(!ok);
    }
}
