use crate::{Block, IngestError, StructuredDocument, Table};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const DOCUMENT_PART: &str = "word/document.xml";

/// Reads the body of a `.docx` as ordered paragraph and table blocks.
pub fn read_docx(path: &Path) -> Result<StructuredDocument, IngestError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut xml = String::new();
    archive.by_name(DOCUMENT_PART)?.read_to_string(&mut xml)?;

    Ok(StructuredDocument {
        file_name: file_name.to_string(),
        blocks: parse_document_xml(&xml)?,
    })
}

#[derive(Default)]
struct CellBuilder {
    paragraphs: Vec<String>,
    span: usize,
}

#[derive(Default)]
struct TableBuilder {
    rows: Vec<Vec<String>>,
    row: Option<Vec<String>>,
    cell: Option<CellBuilder>,
    grid_columns: usize,
}

impl TableBuilder {
    fn finish(self) -> Table {
        let mut table = Table::new(self.rows);
        if self.grid_columns > 0 {
            table.col_count = self.grid_columns.max(table.col_count);
        }
        table
    }
}

#[derive(Default)]
struct BodyParser {
    blocks: Vec<Block>,
    tables: Vec<TableBuilder>,
    paragraph: Option<String>,
    in_text: bool,
    in_tab_stops: bool,
}

impl BodyParser {
    fn start(&mut self, element: &BytesStart<'_>) {
        match element.local_name().as_ref() {
            b"tbl" => self.tables.push(TableBuilder::default()),
            b"tr" => {
                if let Some(table) = self.tables.last_mut() {
                    table.row = Some(Vec::new());
                }
            }
            b"tc" => {
                if let Some(table) = self.tables.last_mut() {
                    table.cell = Some(CellBuilder {
                        paragraphs: Vec::new(),
                        span: 1,
                    });
                }
            }
            b"p" => self.paragraph = Some(String::new()),
            b"t" => self.in_text = true,
            b"tabs" => self.in_tab_stops = true,
            _ => self.marker(element),
        }
    }

    /// Self-closing elements and start tags that carry no nested text.
    fn marker(&mut self, element: &BytesStart<'_>) {
        match element.local_name().as_ref() {
            b"tab" if !self.in_tab_stops => self.push_text("\t"),
            b"br" | b"cr" => self.push_text("\n"),
            b"gridCol" => {
                if let Some(table) = self.tables.last_mut() {
                    table.grid_columns += 1;
                }
            }
            b"gridSpan" => {
                let span = attribute(element, b"val")
                    .and_then(|value| value.parse::<usize>().ok())
                    .unwrap_or(1)
                    .max(1);
                if let Some(cell) = self.tables.last_mut().and_then(|table| table.cell.as_mut()) {
                    cell.span = span;
                }
            }
            b"p" => self.end_paragraph(String::new()),
            _ => {}
        }
    }

    fn end(&mut self, local_name: &[u8]) {
        match local_name {
            b"t" => self.in_text = false,
            b"tabs" => self.in_tab_stops = false,
            b"p" => {
                if let Some(text) = self.paragraph.take() {
                    self.end_paragraph(text);
                }
            }
            b"tc" => {
                if let Some(table) = self.tables.last_mut() {
                    if let Some(cell) = table.cell.take() {
                        let text = cell.paragraphs.join("\n").trim().to_string();
                        if let Some(row) = table.row.as_mut() {
                            row.extend(std::iter::repeat(text).take(cell.span));
                        }
                    }
                }
            }
            b"tr" => {
                if let Some(table) = self.tables.last_mut() {
                    if let Some(row) = table.row.take() {
                        table.rows.push(row);
                    }
                }
            }
            b"tbl" => {
                if let Some(builder) = self.tables.pop() {
                    let table = builder.finish();
                    self.end_table(table);
                }
            }
            _ => {}
        }
    }

    fn end_paragraph(&mut self, text: String) {
        match self.tables.last_mut().and_then(|table| table.cell.as_mut()) {
            Some(cell) => cell.paragraphs.push(text),
            None => self.blocks.push(Block::Paragraph(text)),
        }
    }

    /// Top-level tables become blocks; nested ones fold into the enclosing cell.
    fn end_table(&mut self, table: Table) {
        match self.tables.last_mut().and_then(|outer| outer.cell.as_mut()) {
            Some(cell) => cell.paragraphs.extend(
                table
                    .rows
                    .iter()
                    .map(|row| row.join(" | "))
                    .filter(|line| !line.trim().is_empty()),
            ),
            None => self.blocks.push(Block::Table(table)),
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(paragraph) = self.paragraph.as_mut() {
            paragraph.push_str(text);
        }
    }
}

fn attribute(element: &BytesStart<'_>, local_name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.local_name().as_ref() == local_name)
        .map(|attribute| String::from_utf8_lossy(&attribute.value).into_owned())
}

pub fn parse_document_xml(xml: &str) -> Result<Vec<Block>, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut parser = BodyParser::default();

    loop {
        match reader.read_event()? {
            Event::Start(element) => parser.start(&element),
            Event::Empty(element) => parser.marker(&element),
            Event::End(element) => parser.end(element.local_name().as_ref()),
            Event::Text(text) if parser.in_text => {
                let text = text
                    .unescape()
                    .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                parser.push_text(&text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(parser.blocks)
}
