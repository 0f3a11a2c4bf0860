use super::text::read_decoded;
use crate::{IngestError, TextSegment};
use calamine::{open_workbook_auto, Data, Range, Reader};
use std::path::Path;

/// CSV rows re-emitted tab-delimited, one line per record.
pub fn read_csv(path: &Path) -> Result<Vec<TextSegment>, IngestError> {
    let text = read_decoded(path)?;
    let text = csv_to_tab_delimited(&text)
        .map_err(|error| IngestError::DecodeFailed(format!("{}: {error}", path.display())))?;
    Ok(vec![TextSegment { label: None, text }])
}

pub fn csv_to_tab_delimited(text: &str) -> Result<String, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut lines = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<&str> = record.iter().map(str::trim).collect();
        if fields.iter().all(|field| field.is_empty()) {
            continue;
        }
        lines.push(fields.join("\t"));
    }
    Ok(lines.join("\n"))
}

/// One segment per worksheet, headed by a `[sheet name]` line.
pub fn read_workbook(path: &Path) -> Result<Vec<TextSegment>, IngestError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|error| IngestError::ConversionFailed(format!("{}: {error}", path.display())))?;

    let mut segments = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name).map_err(|error| {
            IngestError::ConversionFailed(format!("{} sheet {name}: {error}", path.display()))
        })?;
        let text = render_sheet(&name, &range);
        segments.push(TextSegment {
            label: Some(name),
            text,
        });
    }
    Ok(segments)
}

pub fn render_sheet(name: &str, range: &Range<Data>) -> String {
    let mut lines = vec![format!("[{name}]")];
    for row in range.rows() {
        let cells: Vec<String> = row
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();
        if cells.iter().all(String::is_empty) {
            continue;
        }
        lines.push(cells.join("\t"));
    }
    lines.join("\n")
}
