//! Output formatting module

mod table;

pub use table::Table;

use serde::Serialize;
use serde_json::{Value, json};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output for automation
    Json,
    /// Table-formatted output
    Table,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}

/// Print `value` as JSON or a table; text output is left to `text`.
pub fn emit<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => println!("{}", render_table(&json!(value))),
    }
    Ok(())
}

fn render_table(value: &Value) -> String {
    match value {
        Value::Array(items) if !items.is_empty() => Table::from_json_array(items).to_string(),
        Value::Object(map) => Table::from_json_object(map).to_string(),
        other => other.to_string(),
    }
}
