//! Table formatting for CLI output

use comfy_table::{ContentArrangement, Table as ComfyTable};
use serde_json::{Map, Value};

/// Table for CLI output
#[derive(Debug, Clone)]
pub struct Table {
    inner: ComfyTable,
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

impl Table {
    /// Create a table from a JSON array of objects
    pub fn from_json_array(arr: &[Value]) -> Self {
        let mut table = ComfyTable::new();

        if let Some(obj) = arr.first().and_then(Value::as_object) {
            let headers: Vec<String> = obj.keys().cloned().collect();
            table.set_header(&headers);
        }

        for item in arr {
            if let Some(obj) = item.as_object() {
                table.add_row(obj.values().map(cell_text).collect::<Vec<_>>());
            }
        }

        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);
        Self { inner: table }
    }

    /// Two-column key/value table
    pub fn from_json_object(obj: &Map<String, Value>) -> Self {
        let mut table = ComfyTable::new();
        table.set_header(vec!["field", "value"]);
        for (key, value) in obj {
            table.add_row(vec![key.clone(), cell_text(value)]);
        }
        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);
        Self { inner: table }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}
