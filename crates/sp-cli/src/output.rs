//! Rendering of host entries, events and files.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use sp_connectors::{CommandOutput, FileResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// Text shown for one entry: the human-readable part, else the contents.
pub fn entry_text(entry: &Value) -> String {
    if let Some(readable) = entry.get("HumanReadable").and_then(Value::as_str) {
        return readable.to_string();
    }
    match entry.get("Contents") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

pub fn print_entries(entries: &[Value], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text => {
            for entry in entries {
                let text = entry_text(entry);
                if sp_scripts::is_error_entry(entry) {
                    println!("{}", "Error:".red().bold());
                    println!("{}", text.red());
                } else if let Some(file) = entry.get("File").and_then(Value::as_str) {
                    println!("{} {}", "File:".cyan(), file);
                } else {
                    println!("{}", text);
                }
                println!();
            }
        }
    }
    Ok(())
}

pub fn print_error(message: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!([{
                "Type": 4,
                "ContentsFormat": "text",
                "Contents": message,
            }]))?
        ),
        OutputFormat::Text => {
            eprintln!("{}", "Error:".red().bold());
            eprintln!("{}", message.red());
        }
    }
    Ok(())
}

/// Appends events to `path` as JSON lines and returns how many were written.
pub fn append_events(path: &Path, events: &[Value]) -> Result<usize> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;
    for event in events {
        writeln!(file, "{}", serde_json::to_string(event)?)?;
    }
    Ok(events.len())
}

/// Writes a returned file under `dir` and returns its path.
pub fn save_file(dir: &Path, file: &FileResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let name = Path::new(&file.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.file_id.clone());
    let path = dir.join(name);
    std::fs::write(&path, &file.contents)
        .with_context(|| format!("Failed to write file: {}", path.display()))?;
    Ok(path)
}

/// Handles one command output: events and files go to disk, entries to stdout.
pub fn emit(
    output: &CommandOutput,
    format: OutputFormat,
    events_out: Option<&Path>,
    files_dir: &Path,
) -> Result<()> {
    match output {
        CommandOutput::Events { batch, .. } => match events_out {
            Some(path) => {
                let written = append_events(path, &batch.events)?;
                eprintln!(
                    "{} {} {} events to {}",
                    "✓".green(),
                    written,
                    batch.vendor,
                    path.display()
                );
            }
            None => eprintln!(
                "{} Collected {} events from {} {} (use --events-out to keep them)",
                "ℹ".cyan(),
                batch.len(),
                batch.vendor,
                batch.product
            ),
        },
        CommandOutput::File(file) => {
            let path = save_file(files_dir, file)?;
            eprintln!("{} Saved {}", "✓".green(), path.display());
        }
        _ => {}
    }
    print_entries(&output.to_entries(), format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sp_connectors::EventBatch;

    #[test]
    fn test_entry_text_prefers_readable() {
        assert_eq!(
            entry_text(&json!({"HumanReadable": "### T", "Contents": {"a": 1}})),
            "### T"
        );
        assert_eq!(entry_text(&json!({"Contents": "ok"})), "ok");
        assert_eq!(entry_text(&json!({"Contents": null})), "");
        assert!(entry_text(&json!({"Contents": {"a": 1}})).contains("\"a\": 1"));
    }

    #[test]
    fn test_append_events_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_events(&path, &[json!({"id": 1}), json!({"id": 2})]).unwrap();
        append_events(&path, &[json!({"id": 3})]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec![r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3}"#]);
    }

    #[test]
    fn test_save_file_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileResult::new("../escape/scan_9.csv", b"a,b\n".to_vec());
        let path = save_file(dir.path(), &file).unwrap();
        assert_eq!(path, dir.path().join("scan_9.csv"));
        assert_eq!(std::fs::read(&path).unwrap(), b"a,b\n");
    }

    #[test]
    fn test_emit_events_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("out.jsonl");
        let output = CommandOutput::Events {
            batch: EventBatch::new("Armis", "Security", vec![json!({"alertId": 1})]),
            preview: None,
        };
        emit(&output, OutputFormat::Json, Some(&events_path), dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&events_path).unwrap().trim(),
            r#"{"alertId":1}"#
        );
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
