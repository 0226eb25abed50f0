//! Test host for scripts.

use crate::registry::{HostServices, ScriptResult};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Host that records executed commands and answers them from canned entries.
#[derive(Default)]
pub struct MockHost {
    context: Value,
    responses: HashMap<String, Vec<Value>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockHost {
    pub fn with_context(context: Value) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    /// Entries returned when `command` is executed.
    pub fn respond(mut self, command: &str, entries: Vec<Value>) -> Self {
        self.responses.insert(command.to_string(), entries);
        self
    }

    /// Commands executed so far, in order.
    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostServices for MockHost {
    async fn execute_command(
        &self,
        command: &str,
        args: Map<String, Value>,
    ) -> ScriptResult<Vec<Value>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((command.to_string(), args));
        }
        Ok(self
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| vec![json!({"Type": 1, "Contents": {}})]))
    }

    fn context(&self) -> &Value {
        &self.context
    }
}
