//! Output formatting for the command line.
//!
//! Renders query results and introspection output as JSON, an ASCII table
//! in the style of the mysql client, or a markdown table.

use crate::models::{QueryResult, TypeTag, Value};
use clap::ValueEnum;
use serde::Serialize;
use unicode_width::UnicodeWidthStr;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// ASCII table format (like MySQL CLI)
    Table,
    /// Markdown table format
    Markdown,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
            Self::Markdown => write!(f, "markdown"),
        }
    }
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => s.to_string(),
            Err(_) => format!("0x{}", b.iter().map(|byte| format!("{byte:02X}")).collect::<String>()),
        },
    }
}

fn is_numeric(tag: TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::Int | TypeTag::Long | TypeTag::Float | TypeTag::Numeric
    )
}

/// Render `header` and pre-formatted `rows` as an ASCII table.
/// `right_align` marks numeric columns.
pub fn format_as_table(header: &[String], rows: &[Vec<String>], right_align: &[bool]) -> String {
    if header.is_empty() {
        return "Empty set\n".to_string();
    }

    let mut widths: Vec<usize> = header.iter().map(|h| h.width()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.width());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    let mut output = separator.clone();
    output.push_str(
        &(header
            .iter()
            .zip(&widths)
            .map(|(h, w)| format!("| {} ", pad(h, *w, Align::Center)))
            .collect::<String>()
            + "|\n"),
    );
    output.push_str(&separator);

    for row in rows {
        let line: String = widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let cell = row.get(i).map(String::as_str).unwrap_or("");
                let align = if right_align.get(i).copied().unwrap_or(false) {
                    Align::Right
                } else {
                    Align::Left
                };
                format!("| {} ", pad(cell, *w, align))
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

pub fn format_as_markdown(header: &[String], rows: &[Vec<String>]) -> String {
    if header.is_empty() {
        return "*Empty set*\n".to_string();
    }

    let mut output = header.iter().map(|h| format!("| {h} ")).collect::<String>() + "|\n";
    output.push_str(&(header.iter().map(|_| "|---").collect::<String>() + "|\n"));
    for row in rows {
        output.push_str(
            &(row
                .iter()
                .map(|cell| format!("| {} ", cell.replace('|', "\\|")))
                .collect::<String>()
                + "|\n"),
        );
    }
    output.push_str(&format!("\n*{} rows*\n", rows.len()));
    output
}

enum Align {
    Left,
    Right,
    Center,
}

// `format!` width specifiers count chars, not display columns
fn pad(text: &str, width: usize, align: Align) -> String {
    let fill = width.saturating_sub(text.width());
    match align {
        Align::Left => format!("{text}{}", " ".repeat(fill)),
        Align::Right => format!("{}{text}", " ".repeat(fill)),
        Align::Center => {
            let left = fill / 2;
            format!("{}{text}{}", " ".repeat(left), " ".repeat(fill - left))
        }
    }
}

/// Render a query result in `format`.
pub fn render_result(result: &QueryResult, format: OutputFormat) -> Result<String, serde_json::Error> {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(result);
    }

    let header: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(format_value).collect())
        .collect();
    let right_align: Vec<bool> = result.columns.iter().map(|c| is_numeric(c.type_tag)).collect();

    Ok(match format {
        OutputFormat::Table => format_as_table(&header, &rows, &right_align),
        _ => format_as_markdown(&header, &rows),
    })
}

/// Render any serializable listing. Tables use `header` and the `cells`
/// projection of each item.
pub fn render_list<T, F>(
    items: &[T],
    header: &[&str],
    cells: F,
    format: OutputFormat,
) -> Result<String, serde_json::Error>
where
    T: Serialize,
    F: Fn(&T) -> Vec<String>,
{
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(items);
    }
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    let rows: Vec<Vec<String>> = items.iter().map(cells).collect();
    Ok(match format {
        OutputFormat::Table => format_as_table(&header, &rows, &[]),
        _ => format_as_markdown(&header, &rows),
    })
}
