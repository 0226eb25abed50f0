//! Subcommand implementations.

mod run;
mod script;

pub use run::{run_invocation, RunOptions, RunSettings};
pub use script::{load_context, run_script};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sp_connectors::CommandArgs;

/// Builds command arguments from `key=value` pairs and an optional JSON object.
///
/// Pairs are applied after the JSON object, so they win on conflicts.
pub fn parse_args(pairs: &[String], json: Option<&str>) -> Result<CommandArgs> {
    let mut args = match json {
        Some(text) => match serde_json::from_str::<Value>(text).context("Invalid --args-json")? {
            Value::Object(map) => CommandArgs::from_map(map),
            _ => bail!("--args-json must be a JSON object"),
        },
        None => CommandArgs::new(),
    };

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid argument '{}'. Expected key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid argument '{}'. Empty key", pair);
        }
        args.insert(key, value.to_string());
    }
    Ok(args)
}
