//! Opens a proactive threat hunting incident for an indicator.

use crate::registry::{is_error_entry, HostServices, Script, ScriptError, ScriptResult};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sp_connectors::{CommandArgs, CommandOutput, CommandResults};
use tracing::info;

const CREATE_INCIDENT_COMMAND: &str = "createNewIncident";
const INCIDENT_TYPE: &str = "Proactive Threat Hunting";

pub struct HuntingFromIndicator;

/// Indicator value from the `indicator` argument: either a string or an
/// indicator object carrying `value`.
fn indicator_value(args: &CommandArgs) -> Option<String> {
    let value = match args.get("indicator")? {
        Value::String(s) => s.clone(),
        Value::Object(indicator) => indicator.get("value")?.as_str()?.to_string(),
        _ => return None,
    };
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Creates the hunting session incident for `indicator`.
pub async fn create_hunting_session(
    indicator: &str,
    host: &dyn HostServices,
) -> ScriptResult<CommandResults> {
    let name = format!("Threat Hunting Session - {}", indicator);

    let mut args = Map::new();
    args.insert("name".into(), json!(name));
    args.insert("type".into(), json!(INCIDENT_TYPE));
    args.insert("sdovalue".into(), json!(indicator));

    let entries = host.execute_command(CREATE_INCIDENT_COMMAND, args).await?;
    if let Some(failed) = entries.iter().find(|entry| is_error_entry(entry)) {
        let message = match failed.get("Contents") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        };
        return Err(ScriptError::HostCommand {
            command: CREATE_INCIDENT_COMMAND.to_string(),
            message,
        });
    }

    info!(indicator, "Created threat hunting incident");
    Ok(CommandResults::readable(format!(
        "Proactive Threat Hunting Incident Created: {}",
        name
    )))
}

#[async_trait]
impl Script for HuntingFromIndicator {
    fn name(&self) -> &str {
        "HuntingFromIndicatorLayout"
    }

    fn description(&self) -> &str {
        "Creates a proactive threat hunting incident from an indicator"
    }

    async fn run(&self, args: &CommandArgs, host: &dyn HostServices) -> ScriptResult<CommandOutput> {
        let indicator = indicator_value(args).ok_or_else(|| {
            ScriptError::Execution("The automation was not executed from indicator layout".into())
        })?;
        Ok(CommandOutput::single(
            create_hunting_session(&indicator, host).await?,
        ))
    }
}
