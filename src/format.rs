//! Output formatting for CLI reports.
//!
//! Reports are lists of records rendered as an ASCII table, a Markdown table
//! or pretty JSON.

use crate::error::HarnessResult;
use crate::models::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use unicode_width::UnicodeWidthStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// ASCII table (like the MySQL CLI)
    #[default]
    Table,
    Json,
    Markdown,
}

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(arr) => serde_json::to_string(arr).unwrap_or_default(),
        JsonValue::Object(obj) => serde_json::to_string(obj).unwrap_or_default(),
    }
}

/// Pad to `width` display columns; numbers align right.
fn pad(text: &str, width: usize, right: bool) -> String {
    let fill = " ".repeat(width.saturating_sub(text.width()));
    if right {
        format!("{fill}{text}")
    } else {
        format!("{text}{fill}")
    }
}

pub fn format_as_table(columns: &[&str], rows: &[Record]) -> String {
    if columns.is_empty() {
        return "Empty set".to_string();
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in rows {
        for (i, col) in columns.iter().enumerate() {
            if let Some(value) = row.get(*col) {
                widths[i] = widths[i].max(format_value(value).width());
            }
        }
    }

    let mut output = String::new();
    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    output.push_str(&separator);
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(col, w)| format!("| {} ", pad(col, *w, false)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);
    output.push_str(&separator);

    for row in rows {
        let line: String = columns
            .iter()
            .zip(&widths)
            .map(|(col, w)| {
                let value = row.get(*col).cloned().unwrap_or(JsonValue::Null);
                let numeric = matches!(value, JsonValue::Number(_));
                format!("| {} ", pad(&format_value(&value), *w, numeric))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }
    output.push_str(&separator);

    let row_text = if rows.len() == 1 { "row" } else { "rows" };
    output.push_str(&format!("{} {} in set\n", rows.len(), row_text));
    output
}

pub fn format_as_markdown(columns: &[&str], rows: &[Record]) -> String {
    if columns.is_empty() {
        return "*Empty set*".to_string();
    }

    let mut output = String::new();
    let header: String = columns.iter().map(|c| format!("| {c} ")).collect::<String>() + "|\n";
    output.push_str(&header);
    let sep: String = columns.iter().map(|_| "|---").collect::<String>() + "|\n";
    output.push_str(&sep);

    for row in rows {
        let line: String = columns
            .iter()
            .map(|col| {
                let value = row.get(*col).cloned().unwrap_or(JsonValue::Null);
                format!("| {} ", format_value(&value).replace('|', "\\|"))
            })
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }
    output.push_str(&format!("\n*{} rows*\n", rows.len()));
    output
}

/// Render `rows` in `format`. JSON ignores `columns` and keeps every field.
pub fn render(format: OutputFormat, columns: &[&str], rows: &[Record]) -> HarnessResult<String> {
    Ok(match format {
        OutputFormat::Table => format_as_table(columns, rows),
        OutputFormat::Markdown => format_as_markdown(columns, rows),
        OutputFormat::Json => serde_json::to_string_pretty(rows)?,
    })
}

/// Serialize `value` into a record for rendering.
pub fn to_record<T: Serialize>(value: &T) -> HarnessResult<Record> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => {
            let mut map = Record::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}
