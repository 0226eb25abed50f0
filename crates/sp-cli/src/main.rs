//! soar-packs CLI
//!
//! Local host runtime for the connectors and automation scripts: loads
//! instance configuration, dispatches one command, renders its entries,
//! persists the next checkpoint and writes collected events.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sp_connectors::{build_integration, CheckpointStore, FileCheckpointStore, IntegrationKind};
use sp_observability::{LogFormat, LoggingConfig};
use sp_scripts::ScriptRegistry;
use std::path::{Path, PathBuf};

mod commands;
mod config;
mod host;
mod output;
mod validator;

use commands::{load_context, parse_args, run_invocation, run_script, RunOptions, RunSettings};
use config::AppConfig;
use output::OutputFormat;
use validator::ConfigValidator;

#[derive(Parser)]
#[command(name = "soar-packs")]
#[command(version)]
#[command(about = "Run SOAR integration commands and automation scripts locally", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory for checkpoints and downloaded files
    #[arg(long, value_name = "DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Append fetched events to this file as JSON lines
    #[arg(long, value_name = "FILE", global = true)]
    events_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an integration command against a configured instance
    Run {
        /// Instance name from the configuration file
        instance: String,

        /// Command name, e.g. test-module or tenable-io-list-scans
        command: String,

        /// Command argument as key=value (repeatable)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Command arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args_json: Option<String>,

        /// Keep re-running scheduled polling commands until they complete
        #[arg(long)]
        follow: bool,

        /// Maximum number of follow-up runs with --follow
        #[arg(long, default_value = "60")]
        max_polls: usize,
    },

    /// Run a built-in automation script
    Script {
        /// Script name, e.g. IfElif
        name: String,

        /// Script argument as key=value (repeatable)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Script arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args_json: Option<String>,

        /// Context document (JSON or YAML) visible to the script
        #[arg(long, value_name = "FILE")]
        context: Option<PathBuf>,
    },

    /// List integrations, configured instances and scripts
    List,

    /// Validate configuration
    Validate,

    /// Forget the stored checkpoint of an instance
    ResetCheckpoint {
        /// Instance name
        instance: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) if cli.config.is_some() => return Err(e),
        Err(_) => AppConfig::default(),
    };

    init_logging(&cli, &config);
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    let state_dir = config.resolve_state_dir(cli.state_dir.as_deref());

    let success = match cli.command {
        Commands::Run {
            instance,
            command,
            args,
            args_json,
            follow,
            max_polls,
        } => {
            let args = parse_args(&args, args_json.as_deref())?;
            cmd_run(
                &config,
                &state_dir,
                RunOptions {
                    instance,
                    command,
                    args,
                    follow,
                    max_polls,
                },
                RunSettings {
                    format: cli.format,
                    events_out: cli.events_out,
                    files_dir: state_dir.join("files"),
                },
            )
            .await?
        }
        Commands::Script {
            name,
            args,
            args_json,
            context,
        } => {
            let args = parse_args(&args, args_json.as_deref())?;
            let context = load_context(context.as_deref())?;
            run_script(&config, &name, args, context, cli.format).await?
        }
        Commands::List => cmd_list(&config, cli.format)?,
        Commands::Validate => cmd_validate(&config, &state_dir, cli.format)?,
        Commands::ResetCheckpoint { instance } => {
            cmd_reset_checkpoint(&config, &state_dir, &instance).await?
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(cli: &Cli, config: &AppConfig) {
    let mut logging = if cli.verbose {
        LoggingConfig::development()
    } else {
        LoggingConfig::default()
    };
    if !cli.verbose {
        if let Ok(level) = config.logging.level.parse() {
            logging = logging.with_level(level);
        }
    }
    if config.logging.json_format {
        logging = logging.with_format(LogFormat::Json);
    }
    sp_observability::init_logging_with_config(logging);
}

fn checkpoint_store(state_dir: &Path) -> FileCheckpointStore {
    FileCheckpointStore::new(state_dir.join("checkpoints"))
}

async fn cmd_run(
    config: &AppConfig,
    state_dir: &Path,
    options: RunOptions,
    settings: RunSettings,
) -> Result<bool> {
    let instance = config.instance(&options.instance)?;
    if !instance.enabled {
        bail!("Instance '{}' is disabled", options.instance);
    }
    let integration = build_integration(instance.integration, instance.params.clone())
        .with_context(|| format!("Failed to set up instance '{}'", options.instance))?;

    let store = checkpoint_store(state_dir);
    run_invocation(integration.as_ref(), &store, options, &settings).await
}

fn cmd_list(config: &AppConfig, format: OutputFormat) -> Result<bool> {
    let registry = ScriptRegistry::with_builtin();

    if format == OutputFormat::Json {
        let integrations: Vec<_> = IntegrationKind::ALL
            .iter()
            .map(|kind| serde_json::json!({"kind": kind.as_str(), "description": kind.description()}))
            .collect();
        let instances: Vec<_> = config
            .instances
            .iter()
            .map(|(name, i)| {
                serde_json::json!({"name": name, "integration": i.integration, "enabled": i.enabled})
            })
            .collect();
        let scripts: Vec<_> = registry
            .list()
            .into_iter()
            .filter_map(|name| registry.get(name))
            .map(|s| serde_json::json!({"name": s.name(), "description": s.description()}))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "integrations": integrations,
                "instances": instances,
                "scripts": scripts,
            }))?
        );
        return Ok(true);
    }

    println!("{}", "Integrations".bold());
    println!("────────────");
    for kind in IntegrationKind::ALL {
        println!("  {:<20} {}", kind.as_str().cyan(), kind.description());
    }

    println!();
    println!("{}", "Instances".bold());
    println!("─────────");
    if config.instances.is_empty() {
        println!("  (none configured)");
    }
    for (name, instance) in &config.instances {
        let status = if instance.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!("  {:<20} {:<20} {}", name, instance.integration.as_str(), status);
    }

    println!();
    println!("{}", "Scripts".bold());
    println!("───────");
    for name in registry.list() {
        if let Some(script) = registry.get(name) {
            println!("  {:<28} {}", name.cyan(), script.description());
        }
    }
    Ok(true)
}

fn cmd_validate(config: &AppConfig, state_dir: &Path, format: OutputFormat) -> Result<bool> {
    let result = ConfigValidator::validate(config, state_dir);
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", "Validating configuration...".cyan());
        result.print();
    }
    Ok(!result.has_errors())
}

async fn cmd_reset_checkpoint(config: &AppConfig, state_dir: &Path, instance: &str) -> Result<bool> {
    config.instance(instance)?;
    checkpoint_store(state_dir).clear(instance).await?;
    println!("{} Checkpoint cleared for {}", "✓".green(), instance);
    Ok(true)
}
