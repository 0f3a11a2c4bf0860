use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("no candidate encoding could decode {0}")]
    DecodeFailed(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx parse error: {0}")]
    DocxParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR failed: {0}")]
    OcrFailed(String),
}

/// Coarse classification used by the ingestion summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    UnsupportedFormat,
    ConversionFailed,
    DecodeFailed,
    CollaboratorUnavailable,
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::ConversionFailed => "conversion_failed",
            FailureKind::DecodeFailed => "decode_failed",
            FailureKind::CollaboratorUnavailable => "collaborator_unavailable",
            FailureKind::Io => "io",
        };
        f.write_str(label)
    }
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            IngestError::ConversionFailed(_) | IngestError::DocxParse(_) => {
                FailureKind::ConversionFailed
            }
            IngestError::DecodeFailed(_) | IngestError::PdfParse(_) => FailureKind::DecodeFailed,
            IngestError::Http(_) | IngestError::OcrFailed(_) => {
                FailureKind::CollaboratorUnavailable
            }
            IngestError::Io(_)
            | IngestError::MissingFileName(_)
            | IngestError::InvalidArgument(_) => FailureKind::Io,
        }
    }
}

impl From<zip::result::ZipError> for IngestError {
    fn from(value: zip::result::ZipError) -> Self {
        IngestError::DocxParse(value.to_string())
    }
}

impl From<quick_xml::Error> for IngestError {
    fn from(value: quick_xml::Error) -> Self {
        IngestError::DocxParse(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{collaborator} unavailable: {details}")]
    CollaboratorUnavailable {
        collaborator: String,
        details: String,
    },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl SearchError {
    pub fn unavailable(collaborator: &str, details: impl fmt::Display) -> Self {
        SearchError::CollaboratorUnavailable {
            collaborator: collaborator.to_string(),
            details: details.to_string(),
        }
    }

    /// Short machine-readable label for a failed query.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::CollaboratorUnavailable { .. }
            | SearchError::Http(_)
            | SearchError::BackendResponse { .. } => "collaborator_unavailable",
            SearchError::Url(_) | SearchError::Request(_) | SearchError::Pattern(_) => {
                "invalid_request"
            }
            SearchError::Serialization(_) | SearchError::Io(_) => "storage",
        }
    }
}
