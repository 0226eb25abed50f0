//! `run`: one host invocation against a configured instance.

use crate::output::{emit, print_error, OutputFormat};
use anyhow::Result;
use colored::Colorize;
use sp_connectors::runtime::{self, Invocation};
use sp_connectors::{CheckpointStore, CommandArgs, Integration};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Where and how results are delivered.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub format: OutputFormat,
    pub events_out: Option<PathBuf>,
    pub files_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub instance: String,
    pub command: String,
    pub args: CommandArgs,
    /// Keep re-running scheduled polling commands until they finish.
    pub follow: bool,
    /// Upper bound on follow-up runs.
    pub max_polls: usize,
}

/// Runs a command, persisting the checkpoint after each successful call.
///
/// Returns false when the command ended in an error entry.
pub async fn run_invocation(
    integration: &dyn Integration,
    store: &dyn CheckpointStore,
    options: RunOptions,
    settings: &RunSettings,
) -> Result<bool> {
    let RunOptions {
        instance,
        mut command,
        mut args,
        follow,
        max_polls,
    } = options;
    let started = Instant::now();
    let mut polls = 0;

    loop {
        let last_run = store.load(&instance).await?;
        let span = sp_observability::invocation_span!(instance, command);
        let invocation = Invocation::new(&command, args.clone()).with_last_run(last_run);
        let outcome = runtime::execute(integration, invocation).instrument(span).await;

        let output = match outcome.entry {
            Ok(output) => output,
            Err(message) => {
                print_error(&message, settings.format)?;
                return Ok(false);
            }
        };

        emit(
            &output,
            settings.format,
            settings.events_out.as_deref(),
            &settings.files_dir,
        )?;

        // Only after delivery, so undelivered events are fetched again.
        if let Some(next_run) = &outcome.next_run {
            store.save(&instance, next_run).await?;
            debug!(instance = %instance, "Checkpoint updated");
        }

        let Some(scheduled) = output.scheduled().cloned() else {
            return Ok(true);
        };

        if !follow {
            eprintln!(
                "{} Polling requested: {} in {}s (use --follow to keep polling)",
                "ℹ".cyan(),
                scheduled.command,
                scheduled.next_run_in_seconds
            );
            return Ok(true);
        }

        polls += 1;
        if polls > max_polls {
            warn!(polls, "Stopped polling after reaching the poll limit");
            print_error(
                &format!("Polling stopped after {} runs", max_polls),
                settings.format,
            )?;
            return Ok(false);
        }
        if let Some(timeout) = scheduled.timeout_in_seconds {
            if started.elapsed() + Duration::from_secs(scheduled.next_run_in_seconds)
                > Duration::from_secs(timeout)
            {
                print_error(
                    &format!("Polling timed out after {} seconds", timeout),
                    settings.format,
                )?;
                return Ok(false);
            }
        }

        info!(
            command = %scheduled.command,
            next_run_in_seconds = scheduled.next_run_in_seconds,
            "Scheduling follow-up run"
        );
        tokio::time::sleep(Duration::from_secs(scheduled.next_run_in_seconds)).await;
        command = scheduled.command;
        args = scheduled.args;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sp_connectors::{
        CommandOutput, CommandResults, ConnectorError, ConnectorResult, EventBatch, LastRun,
        MemoryCheckpointStore, ScheduledCommand,
    };

    /// Polls twice before reporting completion; fetches bump a counter.
    struct Poller;

    #[async_trait]
    impl Integration for Poller {
        fn name(&self) -> &str {
            "Poller"
        }

        fn commands(&self) -> Vec<&'static str> {
            vec!["job-start", "fetch-events", "broken"]
        }

        async fn test_module(&self) -> ConnectorResult<String> {
            Ok("ok".into())
        }

        async fn execute(
            &self,
            command: &str,
            args: &CommandArgs,
            last_run: &mut LastRun,
        ) -> ConnectorResult<CommandOutput> {
            match command {
                "job-start" => {
                    let attempt = args.get_number_or("attempt", 0)?;
                    if attempt >= 2 {
                        return Ok(CommandResults::readable("done").into());
                    }
                    let next = CommandArgs::new().with("attempt", attempt + 1);
                    Ok(CommandResults::readable("pending")
                        .with_scheduled(ScheduledCommand::new("job-start", next, 0))
                        .into())
                }
                "fetch-events" => {
                    let count = last_run.get_i64("count").unwrap_or(0) + 1;
                    last_run.set("count", count);
                    Ok(CommandOutput::Events {
                        batch: EventBatch::new("Acme", "Poller", vec![json!({"n": count})]),
                        preview: None,
                    })
                }
                _ => Err(ConnectorError::InvalidArgument("nope".into())),
            }
        }
    }

    fn settings(dir: &std::path::Path) -> RunSettings {
        RunSettings {
            format: OutputFormat::Json,
            events_out: Some(dir.join("events.jsonl")),
            files_dir: dir.join("files"),
        }
    }

    fn options(command: &str, follow: bool) -> RunOptions {
        RunOptions {
            instance: "acme".into(),
            command: command.into(),
            args: CommandArgs::new(),
            follow,
            max_polls: 10,
        }
    }

    #[tokio::test]
    async fn test_follow_runs_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCheckpointStore::new();
        let ok = run_invocation(&Poller, &store, options("job-start", true), &settings(dir.path()))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_poll_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCheckpointStore::new();
        let mut opts = options("job-start", true);
        opts.max_polls = 1;
        let ok = run_invocation(&Poller, &store, opts, &settings(dir.path()))
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_fetch_persists_checkpoint_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCheckpointStore::new();
        let settings = settings(dir.path());

        for _ in 0..2 {
            run_invocation(&Poller, &store, options("fetch-events", false), &settings)
                .await
                .unwrap();
        }

        assert_eq!(store.load("acme").await.unwrap().get_i64("count"), Some(2));
        let lines = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_undelivered_events_keep_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCheckpointStore::new();
        let mut stored = LastRun::new();
        stored.set("count", 3);
        store.save("acme", &stored).await.unwrap();

        // A directory cannot be opened for appending.
        let settings = RunSettings {
            format: OutputFormat::Json,
            events_out: Some(dir.path().to_path_buf()),
            files_dir: dir.path().join("files"),
        };
        let result = run_invocation(&Poller, &store, options("fetch-events", false), &settings).await;

        assert!(result.is_err());
        assert_eq!(store.load("acme").await.unwrap().get_i64("count"), Some(3));
    }

    #[tokio::test]
    async fn test_failure_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCheckpointStore::new();
        let mut stored = LastRun::new();
        stored.set("count", 7);
        store.save("acme", &stored).await.unwrap();

        let ok = run_invocation(&Poller, &store, options("broken", false), &settings(dir.path()))
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(store.load("acme").await.unwrap().get_i64("count"), Some(7));
    }
}
