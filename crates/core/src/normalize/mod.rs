pub mod docx;
pub mod legacy;
pub mod ocr;
pub mod pdf;
pub mod tabular;
pub mod text;

pub use legacy::{LegacyConverter, DEFAULT_OFFICE_PROGRAM};
pub use ocr::{HttpOcrEngine, OcrEndpointConfig};

use crate::traits::OcrEngine;
use crate::{IngestError, IngestionOptions, NormalizedDocument, TextSegment};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Closed set of source kinds, decided by file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Pdf,
    Docx,
    LegacyOffice,
    Spreadsheet,
    Csv,
    PlainText,
    Image,
    Unsupported(String),
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => SourceFormat::Pdf,
            "docx" => SourceFormat::Docx,
            "doc" | "wps" => SourceFormat::LegacyOffice,
            "xlsx" | "xls" | "xlsm" | "ods" => SourceFormat::Spreadsheet,
            "csv" => SourceFormat::Csv,
            "txt" | "md" => SourceFormat::PlainText,
            "png" | "jpg" | "jpeg" | "bmp" | "tif" | "tiff" => SourceFormat::Image,
            _ => SourceFormat::Unsupported(extension),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, SourceFormat::Unsupported(_))
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Pdf => f.write_str("pdf"),
            SourceFormat::Docx => f.write_str("docx"),
            SourceFormat::LegacyOffice => f.write_str("legacy office"),
            SourceFormat::Spreadsheet => f.write_str("spreadsheet"),
            SourceFormat::Csv => f.write_str("csv"),
            SourceFormat::PlainText => f.write_str("plain text"),
            SourceFormat::Image => f.write_str("image"),
            SourceFormat::Unsupported(ext) if ext.is_empty() => f.write_str("no extension"),
            SourceFormat::Unsupported(ext) => write!(f, ".{ext}"),
        }
    }
}

/// Turns any supported file into either structured blocks or plain text.
pub struct FormatNormalizer {
    legacy: LegacyConverter,
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl FormatNormalizer {
    pub fn new(legacy: LegacyConverter) -> Self {
        Self { legacy, ocr: None }
    }

    pub fn from_options(options: &IngestionOptions) -> Self {
        Self::new(LegacyConverter::new(
            DEFAULT_OFFICE_PROGRAM,
            options.conversion_dir.clone(),
        ))
    }

    pub fn with_ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    pub fn normalize(&self, path: &Path) -> Result<NormalizedDocument, IngestError> {
        let format = SourceFormat::from_path(path);
        match format {
            SourceFormat::Pdf => self.normalize_pdf(path),
            SourceFormat::Docx => docx::read_docx(path).map(NormalizedDocument::Structured),
            SourceFormat::LegacyOffice => {
                let converted = self.legacy.convert(path)?;
                let mut document = docx::read_docx(&converted)?;
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    document.file_name = name.to_string();
                }
                Ok(NormalizedDocument::Structured(document))
            }
            SourceFormat::Spreadsheet => {
                tabular::read_workbook(path).map(NormalizedDocument::Tabular)
            }
            SourceFormat::Csv => tabular::read_csv(path).map(NormalizedDocument::Tabular),
            SourceFormat::PlainText => text::read_plain_text(path).map(NormalizedDocument::Text),
            SourceFormat::Image => self.recognize(path).map(NormalizedDocument::Text),
            SourceFormat::Unsupported(_) => Err(IngestError::UnsupportedFormat(format!(
                "{format}: {}",
                path.display()
            ))),
        }
    }

    /// Scanned PDFs without a text layer go through OCR when an engine is set.
    fn normalize_pdf(&self, path: &Path) -> Result<NormalizedDocument, IngestError> {
        match pdf::read_pdf(path) {
            Ok(segments) => Ok(NormalizedDocument::Text(segments)),
            Err(IngestError::PdfParse(parse_error)) if self.ocr.is_some() => {
                tracing::debug!(path = %path.display(), %parse_error, "falling back to OCR");
                self.recognize(path)
                    .map(NormalizedDocument::Text)
                    .map_err(|ocr_error| {
                        IngestError::PdfParse(format!(
                            "{parse_error}; OCR fallback failed: {ocr_error}"
                        ))
                    })
            }
            Err(error) => Err(error),
        }
    }

    fn recognize(&self, path: &Path) -> Result<Vec<TextSegment>, IngestError> {
        let engine = self.ocr.as_ref().ok_or_else(|| {
            IngestError::UnsupportedFormat(format!(
                "image without an OCR engine configured: {}",
                path.display()
            ))
        })?;

        let lines = engine.recognize(path)?;
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TextSegment {
            label: None,
            text: lines.join("\n"),
        }])
    }
}
