//! Command results handed back to the host.

use crate::args::CommandArgs;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Host entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryType {
    #[default]
    Note,
    Error,
}

impl EntryType {
    /// Numeric code used by the host.
    pub fn code(self) -> u8 {
        match self {
            EntryType::Note => 1,
            EntryType::Error => 4,
        }
    }
}

/// Re-run request for polling commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub command: String,
    pub args: CommandArgs,
    pub next_run_in_seconds: u64,
    pub timeout_in_seconds: Option<u64>,
}

impl ScheduledCommand {
    pub fn new(command: impl Into<String>, args: CommandArgs, next_run_in_seconds: u64) -> Self {
        Self {
            command: command.into(),
            args,
            next_run_in_seconds,
            timeout_in_seconds: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_in_seconds = Some(seconds);
        self
    }
}

/// How the host renders `Contents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryFormat {
    #[default]
    Json,
    Html,
    Markdown,
    Text,
}

impl EntryFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryFormat::Json => "json",
            EntryFormat::Html => "html",
            EntryFormat::Markdown => "markdown",
            EntryFormat::Text => "text",
        }
    }
}

/// The display/output pair produced by a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResults {
    pub outputs_prefix: Option<String>,
    pub outputs_key_field: Option<String>,
    pub outputs: Option<Value>,
    pub readable_output: Option<String>,
    pub raw_response: Option<Value>,
    pub scheduled: Option<ScheduledCommand>,
    #[serde(default)]
    pub entry_type: EntryType,
    #[serde(default)]
    pub contents_format: EntryFormat,
    /// Context entries stored next to the outputs, by full context key.
    #[serde(default)]
    pub extra_context: Map<String, Value>,
}

impl CommandResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// A results object carrying only a human-readable message.
    pub fn readable(text: impl Into<String>) -> Self {
        Self {
            readable_output: Some(text.into()),
            ..Self::default()
        }
    }

    /// An error entry that does not abort the command.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            readable_output: Some(text.into()),
            entry_type: EntryType::Error,
            ..Self::default()
        }
    }

    pub fn outputs(mut self, prefix: &str, key_field: Option<&str>, outputs: Value) -> Self {
        self.outputs_prefix = Some(prefix.to_string());
        self.outputs_key_field = key_field.map(str::to_string);
        self.outputs = Some(outputs);
        self
    }

    pub fn with_readable(mut self, text: impl Into<String>) -> Self {
        self.readable_output = Some(text.into());
        self
    }

    pub fn with_raw_response(mut self, raw: Value) -> Self {
        self.raw_response = Some(raw);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_context.insert(key.into(), value);
        self
    }

    pub fn with_format(mut self, format: EntryFormat) -> Self {
        self.contents_format = format;
        self
    }

    pub fn with_scheduled(mut self, scheduled: ScheduledCommand) -> Self {
        self.scheduled = Some(scheduled);
        self
    }

    pub fn is_error(&self) -> bool {
        self.entry_type == EntryType::Error
    }

    /// Context path the outputs are stored under.
    pub fn context_key(&self) -> Option<String> {
        let prefix = self.outputs_prefix.as_ref()?;
        Some(match &self.outputs_key_field {
            Some(key) => format!("{}(val.{} && val.{} === obj.{})", prefix, key, key, key),
            None => prefix.clone(),
        })
    }

    /// Host entry: contents, readable text, entry context and polling fields.
    pub fn to_entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("Type".into(), json!(self.entry_type.code()));
        entry.insert("ContentsFormat".into(), json!(self.contents_format.as_str()));
        entry.insert(
            "Contents".into(),
            self.raw_response
                .clone()
                .or_else(|| self.outputs.clone())
                .unwrap_or(Value::Null),
        );
        entry.insert(
            "HumanReadable".into(),
            self.readable_output.clone().map(Value::String).unwrap_or(Value::Null),
        );

        let mut context = Map::new();
        if let (Some(key), Some(outputs)) = (self.context_key(), &self.outputs) {
            context.insert(key, outputs.clone());
        }
        for (key, value) in &self.extra_context {
            context.insert(key.clone(), value.clone());
        }
        entry.insert("EntryContext".into(), Value::Object(context));

        if let Some(scheduled) = &self.scheduled {
            entry.insert("PollingCommand".into(), json!(scheduled.command));
            entry.insert("NextRun".into(), json!(scheduled.next_run_in_seconds.to_string()));
            entry.insert("PollingArgs".into(), Value::Object(scheduled.args.as_map().clone()));
            if let Some(timeout) = scheduled.timeout_in_seconds {
                entry.insert("Timeout".into(), json!(timeout.to_string()));
            }
        }

        Value::Object(entry)
    }
}

/// A file returned to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub file_name: String,
    pub file_id: String,
    pub contents: Vec<u8>,
}

impl FileResult {
    pub fn new(file_name: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            file_id: uuid::Uuid::new_v4().to_string(),
            contents,
        }
    }
}

/// Events collected for the host's event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub vendor: String,
    pub product: String,
    pub events: Vec<Value>,
}

impl EventBatch {
    pub fn new(vendor: &str, product: &str, events: Vec<Value>) -> Self {
        Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// An incident created by a fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub name: String,
    pub occurred: Option<String>,
    #[serde(rename = "rawJSON")]
    pub raw_json: String,
    pub severity: Option<u8>,
}

/// Everything a command can hand back.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Plain message, e.g. `ok` from `test-module`.
    Text(String),
    Results(Vec<CommandResults>),
    /// Events to push, with an optional result shown to the user.
    Events {
        batch: EventBatch,
        preview: Option<CommandResults>,
    },
    Incidents(Vec<Incident>),
    File(FileResult),
}

impl CommandOutput {
    pub fn single(result: CommandResults) -> Self {
        CommandOutput::Results(vec![result])
    }

    /// The scheduled re-run requested by any of the results, if one was.
    pub fn scheduled(&self) -> Option<&ScheduledCommand> {
        match self {
            CommandOutput::Results(results) => results.iter().find_map(|r| r.scheduled.as_ref()),
            _ => None,
        }
    }

    /// Host entries for this output.
    pub fn to_entries(&self) -> Vec<Value> {
        match self {
            CommandOutput::Text(text) => vec![CommandResults::readable(text.clone()).to_entry()],
            CommandOutput::Results(results) => results.iter().map(CommandResults::to_entry).collect(),
            CommandOutput::Events { preview, .. } => {
                preview.iter().map(CommandResults::to_entry).collect()
            }
            CommandOutput::Incidents(incidents) => vec![json!({
                "Type": EntryType::Note.code(),
                "ContentsFormat": "json",
                "Contents": incidents,
            })],
            CommandOutput::File(file) => vec![json!({
                "Type": 3,
                "File": file.file_name,
                "FileID": file.file_id,
                "Size": file.contents.len(),
            })],
        }
    }
}

impl From<CommandResults> for CommandOutput {
    fn from(result: CommandResults) -> Self {
        CommandOutput::single(result)
    }
}
