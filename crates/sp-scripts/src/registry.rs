//! Script trait, host services and the script registry.

use crate::if_elif::ExpressionError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sp_connectors::{CommandArgs, CommandOutput, CommandResults, ConnectorError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

/// Errors that can occur while running a script.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Host command '{command}' failed: {message}")]
    HostCommand { command: String, message: String },

    #[error("{0}")]
    Execution(String),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// What the host runtime offers to a running script.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Runs a host command and returns its entries.
    async fn execute_command(
        &self,
        command: &str,
        args: Map<String, Value>,
    ) -> ScriptResult<Vec<Value>>;

    /// The incident/investigation context the script runs in.
    fn context(&self) -> &Value;
}

/// Returns true when a host entry is an error entry.
pub fn is_error_entry(entry: &Value) -> bool {
    entry.get("Type").and_then(Value::as_u64) == Some(4)
}

/// An automation script run by the host.
#[async_trait]
pub trait Script: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn required_arguments(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn validate(&self, args: &CommandArgs) -> ScriptResult<()> {
        for name in self.required_arguments() {
            if !args.contains(name) {
                return Err(ScriptError::MissingArgument(name.to_string()));
            }
        }
        Ok(())
    }

    async fn run(&self, args: &CommandArgs, host: &dyn HostServices) -> ScriptResult<CommandOutput>;
}

/// Scripts available to the host, by name.
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
        }
    }

    /// A registry holding every built-in script.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::if_elif::IfElif));
        registry.register(Arc::new(crate::hunting_from_indicator::HuntingFromIndicator));
        registry.register(Arc::new(crate::answer_check::AnswerCheck::default()));
        registry
    }

    pub fn register(&mut self, script: Arc<dyn Script>) {
        let name = script.name().to_string();
        info!("Registering script: {}", name);
        self.scripts.insert(name, script);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(name).cloned()
    }

    /// Script names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validates the arguments and runs the named script.
    #[instrument(skip(self, args, host))]
    pub async fn execute(
        &self,
        name: &str,
        args: &CommandArgs,
        host: &dyn HostServices,
    ) -> ScriptResult<CommandOutput> {
        let script = self
            .get(name)
            .ok_or_else(|| ScriptError::NotFound(name.to_string()))?;

        script.validate(args)?;
        let output = script.run(args, host).await?;
        info!("Script {} completed", name);
        Ok(output)
    }

    /// Like [`execute`](Self::execute), but turns a failure into an error entry.
    pub async fn invoke(
        &self,
        name: &str,
        args: &CommandArgs,
        host: &dyn HostServices,
    ) -> CommandOutput {
        match self.execute(name, args, host).await {
            Ok(output) => output,
            Err(e) => {
                error!("Script {} failed: {}", name, e);
                CommandOutput::single(CommandResults::error(e.to_string()))
            }
        }
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
