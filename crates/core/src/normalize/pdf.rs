use crate::{IngestError, TextSegment};
use lopdf::Document;
use std::path::Path;

/// One segment per page that has extractable text.
pub fn read_pdf(path: &Path) -> Result<Vec<TextSegment>, IngestError> {
    let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut segments = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            segments.push(TextSegment {
                label: Some(format!("page {page_no}")),
                text,
            });
        }
    }

    if segments.is_empty() {
        return Err(IngestError::PdfParse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn broken_pdfs_are_decode_failures() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let error = read_pdf(&path).unwrap_err();
        assert_eq!(error.kind(), FailureKind::DecodeFailed);
        Ok(())
    }
}
