//! Host services for scripts run from the command line.
//!
//! Integration commands are routed to the first enabled instance that
//! implements them. `createNewIncident` is recorded locally.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sp_connectors::runtime::{self, Invocation};
use sp_connectors::{CommandArgs, Integration};
use sp_scripts::{HostServices, ScriptResult};
use std::sync::Mutex;
use tracing::{info, warn};

const CREATE_INCIDENT: &str = "createNewIncident";

pub struct LocalHost {
    context: Value,
    integrations: Vec<(String, Box<dyn Integration>)>,
    incidents: Mutex<Vec<Value>>,
}

impl LocalHost {
    pub fn new(context: Value) -> Self {
        Self {
            context,
            integrations: Vec::new(),
            incidents: Mutex::new(Vec::new()),
        }
    }

    pub fn with_integration(mut self, instance: String, integration: Box<dyn Integration>) -> Self {
        self.integrations.push((instance, integration));
        self
    }

    /// Incidents created by scripts during this run.
    pub fn created_incidents(&self) -> Vec<Value> {
        self.incidents
            .lock()
            .map(|incidents| incidents.clone())
            .unwrap_or_default()
    }

    fn create_incident(&self, args: Map<String, Value>) -> Vec<Value> {
        let mut incident = args;
        let id = match self.incidents.lock() {
            Ok(mut incidents) => {
                let id = incidents.len() + 1;
                incident.insert("id".into(), json!(id.to_string()));
                incidents.push(Value::Object(incident.clone()));
                id
            }
            Err(_) => 0,
        };
        info!(id, "Created incident");
        vec![json!({"Type": 1, "ContentsFormat": "json", "Contents": incident})]
    }
}

#[async_trait]
impl HostServices for LocalHost {
    async fn execute_command(
        &self,
        command: &str,
        args: Map<String, Value>,
    ) -> ScriptResult<Vec<Value>> {
        if command == CREATE_INCIDENT {
            return Ok(self.create_incident(args));
        }

        let target = self
            .integrations
            .iter()
            .find(|(_, integration)| integration.commands().contains(&command));
        let Some((instance, integration)) = target else {
            warn!(command, "No instance implements command");
            return Ok(vec![json!({
                "Type": 4,
                "ContentsFormat": "text",
                "Contents": format!("Unsupported Command: {} is not implemented by any enabled instance", command),
            })]);
        };

        info!(instance = %instance, command, "Routing command to instance");
        let outcome = runtime::execute(
            integration.as_ref(),
            Invocation::new(command, CommandArgs::from_map(args)),
        )
        .await;
        Ok(match outcome.entry {
            Ok(output) => output.to_entries(),
            Err(message) => vec![json!({"Type": 4, "ContentsFormat": "text", "Contents": message})],
        })
    }

    fn context(&self) -> &Value {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_scripts::is_error_entry;

    #[tokio::test]
    async fn test_create_incident_is_recorded() {
        let host = LocalHost::new(json!({}));
        let mut args = Map::new();
        args.insert("name".into(), json!("Threat Hunting Session - x"));

        let entries = host.execute_command("createNewIncident", args).await.unwrap();
        assert!(!is_error_entry(&entries[0]));
        assert_eq!(entries[0]["Contents"]["id"], "1");

        let incidents = host.created_incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0]["name"], "Threat Hunting Session - x");
    }

    #[tokio::test]
    async fn test_unknown_command_is_error_entry() {
        let host = LocalHost::new(Value::Null);
        let entries = host.execute_command("ip", Map::new()).await.unwrap();
        assert!(is_error_entry(&entries[0]));
    }

    #[tokio::test]
    async fn test_routes_to_integration() {
        let integration = sp_connectors::build_integration(
            sp_connectors::IntegrationKind::AzureDevops,
            json!({
                "organization": "contoso",
                "client_id": "app-id",
                "redirect_uri": "https://localhost/callback"
            }),
        )
        .unwrap();
        let host = LocalHost::new(Value::Null).with_integration("ado".into(), integration);
        let entries = host
            .execute_command("azure-devops-generate-login-url", Map::new())
            .await
            .unwrap();
        assert!(!is_error_entry(&entries[0]));
        assert!(entries[0]["HumanReadable"]
            .as_str()
            .unwrap()
            .contains("client_id=app-id"));
    }
}
