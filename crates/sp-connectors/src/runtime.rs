//! Command dispatch for one host invocation.

use crate::args::CommandArgs;
use crate::checkpoint::LastRun;
use crate::results::CommandOutput;
use crate::traits::{ConnectorError, Integration};
use tracing::{error, info, instrument};

pub const TEST_MODULE: &str = "test-module";

/// One command invocation as received from the host.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub args: CommandArgs,
    /// Checkpoint loaded by the host before the call.
    pub last_run: LastRun,
}

impl Invocation {
    pub fn new(command: impl Into<String>, args: CommandArgs) -> Self {
        Self {
            command: command.into(),
            args,
            last_run: LastRun::new(),
        }
    }

    pub fn with_last_run(mut self, last_run: LastRun) -> Self {
        self.last_run = last_run;
        self
    }
}

/// What the host does after an invocation.
#[derive(Debug)]
pub struct InvocationOutcome {
    /// The output, or the user-facing error message.
    pub entry: Result<CommandOutput, String>,
    /// Checkpoint to persist; `None` leaves the stored one untouched.
    pub next_run: Option<LastRun>,
}

impl InvocationOutcome {
    pub fn is_error(&self) -> bool {
        self.entry.is_err()
    }
}

/// Runs one command and converts any failure into the host error message.
#[instrument(skip(integration, invocation), fields(integration = integration.name(), command = %invocation.command))]
pub async fn execute(integration: &dyn Integration, invocation: Invocation) -> InvocationOutcome {
    let Invocation {
        command,
        args,
        last_run,
    } = invocation;

    info!("Command being called is {}", command);

    let mut next_run = last_run.clone();
    let result = if command == TEST_MODULE {
        integration.test_module().await.map(CommandOutput::Text)
    } else if integration.commands().contains(&command.as_str()) {
        integration.execute(&command, &args, &mut next_run).await
    } else {
        Err(ConnectorError::UnknownCommand(command.clone()))
    };

    match result {
        Ok(output) => InvocationOutcome {
            entry: Ok(output),
            next_run: (next_run != last_run).then_some(next_run),
        },
        Err(e) => {
            error!(error = %e, "Command failed");
            InvocationOutcome {
                entry: Err(error_message(&command, &e)),
                next_run: None,
            }
        }
    }
}

/// `Failed to execute {command} command.\nError:\n{error}`
pub fn error_message(command: &str, error: &ConnectorError) -> String {
    format!("Failed to execute {} command.\nError:\n{}", command, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::CommandResults;
    use crate::traits::ConnectorResult;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Integration for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        fn commands(&self) -> Vec<&'static str> {
            vec!["echo", "fetch-events", "fail"]
        }

        async fn test_module(&self) -> ConnectorResult<String> {
            Ok("ok".to_string())
        }

        async fn execute(
            &self,
            command: &str,
            args: &CommandArgs,
            last_run: &mut LastRun,
        ) -> ConnectorResult<CommandOutput> {
            match command {
                "echo" => Ok(CommandResults::readable(args.require_str("text")?).into()),
                "fetch-events" => {
                    last_run.set("cursor", args.get_str_or("cursor", "1"));
                    Ok(CommandOutput::Text("fetched".into()))
                }
                _ => {
                    last_run.set("cursor", "should-not-persist");
                    Err(ConnectorError::Api {
                        status: 500,
                        body: "boom".into(),
                    })
                }
            }
        }
    }

    #[tokio::test]
    async fn test_test_module_route() {
        let outcome = execute(&Echo, Invocation::new("test-module", CommandArgs::new())).await;
        assert_eq!(outcome.entry.unwrap(), CommandOutput::Text("ok".into()));
        assert!(outcome.next_run.is_none());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let outcome = execute(&Echo, Invocation::new("nope", CommandArgs::new())).await;
        assert_eq!(
            outcome.entry.unwrap_err(),
            "Failed to execute nope command.\nError:\nCommand nope does not exist for this integration."
        );
    }

    #[tokio::test]
    async fn test_missing_argument_message() {
        let outcome = execute(&Echo, Invocation::new("echo", CommandArgs::new())).await;
        assert_eq!(
            outcome.entry.unwrap_err(),
            "Failed to execute echo command.\nError:\nMissing required argument: text"
        );
    }

    #[tokio::test]
    async fn test_checkpoint_reported_only_when_changed() {
        let mut stored = LastRun::new();
        stored.set("cursor", "1");

        let unchanged = execute(
            &Echo,
            Invocation::new("fetch-events", CommandArgs::new()).with_last_run(stored.clone()),
        )
        .await;
        assert!(unchanged.next_run.is_none());

        let changed = execute(
            &Echo,
            Invocation::new("fetch-events", CommandArgs::new().with("cursor", "2"))
                .with_last_run(stored.clone()),
        )
        .await;
        assert_eq!(changed.next_run.unwrap().get_str("cursor"), Some("2"));
    }

    #[tokio::test]
    async fn test_failed_command_discards_checkpoint() {
        let outcome = execute(&Echo, Invocation::new("fail", CommandArgs::new())).await;
        assert!(outcome.is_error());
        assert!(outcome.next_run.is_none());
    }
}
