use crate::error::IngestError;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MIN_COLUMNS: usize = 2;
const MIN_ROWS: usize = 2;
const COLUMN_GAP: &str = r"\t| {2,}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Cell {
    Number(String),
    Text(String),
}

impl Cell {
    pub fn classify(value: &str) -> Self {
        if is_numeric(value) {
            Self::Number(value.to_string())
        } else {
            Self::Text(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Number(value) | Self::Text(value) => value,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number(_))
    }
}

pub type TableGrid = Vec<Vec<Cell>>;

fn is_numeric(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || matches!(byte, b'+' | b'-' | b'.' | b'e' | b'E'))
        && value.parse::<f64>().is_ok_and(f64::is_finite)
}

pub fn detect_tables(text: &str) -> Result<Vec<TableGrid>, IngestError> {
    let splitter = Regex::new(COLUMN_GAP)?;
    let mut tables = Vec::new();
    let mut current: TableGrid = Vec::new();

    for line in text.lines() {
        let cells = splitter
            .split(line.trim_matches(|ch| ch == ' ' || ch == '\r'))
            .map(|cell| Cell::classify(cell.trim_matches(' ')))
            .collect::<Vec<_>>();

        let blank = cells.iter().all(|cell| cell.as_str().is_empty());
        if cells.len() < MIN_COLUMNS || blank {
            flush(&mut tables, &mut current);
            continue;
        }

        let same_shape = current.first().map_or(true, |row| row.len() == cells.len());
        if !same_shape {
            flush(&mut tables, &mut current);
        }
        current.push(cells);
    }

    flush(&mut tables, &mut current);
    Ok(tables)
}

fn flush(tables: &mut Vec<TableGrid>, current: &mut TableGrid) {
    if current.len() >= MIN_ROWS {
        tables.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

pub fn table_to_csv(grid: &TableGrid) -> Result<String, IngestError> {
    // fields arrive already quoted, so the writer must not quote again
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::CRLF)
        .flexible(true)
        .from_writer(Vec::new());

    for row in grid {
        writer.write_record(row.iter().map(csv_field))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|error| IngestError::Io(error.into_error()))?;
    String::from_utf8(bytes).map_err(|error| IngestError::InvalidArgument(error.to_string()))
}

fn csv_field(cell: &Cell) -> String {
    match cell {
        Cell::Number(value) => value.clone(),
        Cell::Text(value) => format!("\"{}\"", value.replace('"', "\"\"")),
    }
}

/// Reads a table chunk's CSV back into a grid. Quoted fields are text, bare
/// non-empty fields are numbers.
pub fn parse_table_csv(csv_text: &str) -> Result<TableGrid, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut grid = Vec::new();
    let mut record = csv::StringRecord::new();
    loop {
        let start = reader.position().byte() as usize;
        if !reader.read_record(&mut record)? {
            break;
        }
        let end = reader.position().byte() as usize;
        let quoted = quoted_fields(csv_text.get(start..end).unwrap_or_default());

        grid.push(
            record
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    let bare = !quoted.get(index).copied().unwrap_or(true);
                    if bare && !value.is_empty() {
                        Cell::Number(value.to_string())
                    } else {
                        Cell::Text(value.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(grid)
}

fn quoted_fields(raw: &str) -> Vec<bool> {
    let raw = raw.trim_matches(|ch| ch == '\r' || ch == '\n');
    let mut quoted = Vec::new();
    let mut field_start = true;
    let mut in_quotes = false;

    for ch in raw.chars() {
        if field_start {
            field_start = false;
            quoted.push(ch == '"');
            if ch == '"' {
                in_quotes = true;
                continue;
            }
        }
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => field_start = true,
            _ => {}
        }
    }
    if field_start {
        quoted.push(false);
    }
    quoted
}
