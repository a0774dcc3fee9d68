//! Tables from CSV, spreadsheets and JSON arrays, rendered as several textual
//! views so both whole-table and per-column questions retrieve well.

use super::{essence, FormatParser, ParserKind, CSV_MIME, JSON_MIME, XLSX_MIME};
use crate::error::IngestError;
use crate::models::{Metadata, Segment, TabularData};
use async_trait::async_trait;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use serde_json::{json, Map, Number, Value};
use std::io::Cursor;

/// Tables up to this many rows are also emitted whole.
pub const FULL_TABLE_MAX_ROWS: usize = 50;
pub const BATCH_ROWS: usize = 20;
const SAMPLE_VALUES: usize = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct TabularParser;

#[async_trait]
impl FormatParser for TabularParser {
    fn kind(&self) -> ParserKind {
        ParserKind::Tabular
    }

    async fn extract(
        &self,
        bytes: &[u8],
        mime_type: &str,
        metadata: &Metadata,
    ) -> Result<Vec<Segment>, IngestError> {
        match essence(mime_type).as_str() {
            CSV_MIME => {
                let table = parse_csv(bytes)?;
                let mut metadata = metadata.clone();
                metadata.insert("format".to_string(), json!("csv"));
                Ok(table_views(&table, &metadata))
            }
            XLSX_MIME => {
                let sheets = parse_xlsx(bytes)?;
                let names: Vec<&str> = sheets.iter().map(|(name, _)| name.as_str()).collect();
                let mut metadata = metadata.clone();
                metadata.insert("format".to_string(), json!("excel"));
                metadata.insert("sheets".to_string(), json!(names));

                let mut segments = Vec::new();
                for (name, table) in &sheets {
                    let mut sheet_metadata = metadata.clone();
                    sheet_metadata.insert("sheet".to_string(), json!(name));
                    segments.extend(table_views(table, &sheet_metadata));
                }
                Ok(segments)
            }
            JSON_MIME => {
                let value: Value = serde_json::from_slice(bytes)?;
                let mut metadata = metadata.clone();
                metadata.insert("format".to_string(), json!("json"));
                match records_table(&value) {
                    Some(table) => Ok(table_views(&table, &metadata)),
                    None => Ok(vec![Segment::new(
                        serde_json::to_string_pretty(&value)?,
                        metadata,
                    )]),
                }
            }
            other => Err(IngestError::UnsupportedMimeType(other.to_string())),
        }
    }
}

fn infer_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return json!(integer);
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    json!(raw)
}

pub fn parse_csv(bytes: &[u8]) -> Result<TabularData, IngestError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(index, header)| column_name(index, header))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row: Vec<Value> = record.iter().map(infer_cell).collect();
        row.resize(columns.len(), Value::Null);
        rows.push(row);
    }
    Ok(TabularData::new(columns, rows))
}

fn column_name(index: usize, header: &str) -> String {
    let header = header.trim();
    if header.is_empty() {
        format!("column_{}", index + 1)
    } else {
        header.to_string()
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(text) if text.trim().is_empty() => Value::Null,
        Data::String(text) => json!(text),
        Data::Int(integer) => json!(integer),
        Data::Float(float) if float.fract() == 0.0 && float.abs() < 1e15 => json!(*float as i64),
        Data::Float(float) => Number::from_f64(*float).map_or(Value::Null, Value::Number),
        Data::Bool(flag) => json!(flag),
        other => json!(other.to_string()),
    }
}

/// One table per sheet; the first row is the header.
pub fn parse_xlsx(bytes: &[u8]) -> Result<Vec<(String, TabularData)>, IngestError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|error: calamine::XlsxError| IngestError::Spreadsheet(error.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|error| IngestError::Spreadsheet(format!("sheet {name}: {error}")))?;

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            sheets.push((name, TabularData::default()));
            continue;
        };
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(index, cell)| column_name(index, &cell.to_string()))
            .collect();
        let rows = rows
            .map(|row| row.iter().map(cell_value).collect::<Vec<_>>())
            .filter(|row| row.iter().any(|value| !value.is_null()))
            .collect();
        sheets.push((name, TabularData::new(columns, rows)));
    }
    Ok(sheets)
}

/// A non-empty array of objects, columns in first-seen key order.
fn records_table(value: &Value) -> Option<TabularData> {
    let items = value.as_array().filter(|items| !items.is_empty())?;
    let records: Vec<&Map<String, Value>> = items
        .iter()
        .map(Value::as_object)
        .collect::<Option<_>>()?;

    let mut columns: Vec<String> = Vec::new();
    for record in &records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| record.get(column).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    Some(TabularData::new(columns, rows))
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Header plus rows, each column padded to its widest cell.
pub fn render_table(columns: &[String], rows: &[Vec<Value>]) -> String {
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|index| row.get(index).map(display).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            cells
                .iter()
                .map(|row| row[index].chars().count())
                .chain(std::iter::once(column.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| {
        values
            .iter()
            .zip(&widths)
            .map(|(value, &width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    std::iter::once(line(columns))
        .chain(cells.iter().map(|row| line(row.as_slice())))
        .collect::<Vec<_>>()
        .join("\n")
}

fn column_samples(table: &TabularData) -> String {
    let mut text = String::from("Column descriptions:\n");
    for (index, column) in table.columns.iter().enumerate() {
        let samples: Vec<String> = table
            .rows
            .iter()
            .filter_map(|row| row.get(index))
            .filter(|value| !value.is_null())
            .take(SAMPLE_VALUES)
            .map(display)
            .collect();
        text.push_str(&format!("- {column}: Sample values: {}\n", samples.join(", ")));
    }
    text
}

/// Full table (small tables only), row batches and a column summary.
pub fn table_views(table: &TabularData, metadata: &Metadata) -> Vec<Segment> {
    if table.columns.is_empty() {
        return Vec::new();
    }

    let mut base = metadata.clone();
    base.insert("columns".to_string(), json!(table.columns));
    base.insert("row_count".to_string(), json!(table.row_count()));

    let mut views = Vec::new();
    let rows = table.row_count();

    if rows <= FULL_TABLE_MAX_ROWS {
        views.push(
            Segment::new(render_table(&table.columns, &table.rows), base.clone())
                .with_entry("representation", "full_table"),
        );
    }

    for (batch, chunk) in table.rows.chunks(BATCH_ROWS).enumerate() {
        let start = batch * BATCH_ROWS;
        let end = (start + BATCH_ROWS - 1).min(rows - 1);
        views.push(
            Segment::new(render_table(&table.columns, chunk), base.clone())
                .with_entry("representation", "batch")
                .with_entry("row_range", format!("{start}-{end}")),
        );
    }

    views.push(Segment::new(column_samples(table), base).with_entry("representation", "columns"));
    views
}
