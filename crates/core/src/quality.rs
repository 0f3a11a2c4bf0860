use crate::models::{Chunk, IngestionOptions};
use std::fmt;

/// Marker left behind by lossy decoding.
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    TooShort { chars: usize },
    Garbled { markers: usize, ratio: f64 },
    NoSignal,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooShort { chars } => write!(f, "too short ({chars} chars)"),
            Rejection::Garbled { markers, ratio } => {
                write!(f, "{markers} undecodable markers ({:.1}%)", ratio * 100.0)
            }
            Rejection::NoSignal => f.write_str("no alphanumeric or ideographic content"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityFilter {
    pub min_chars: usize,
    pub max_markers: usize,
    pub max_marker_ratio: f64,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self::from(&IngestionOptions::default())
    }
}

impl From<&IngestionOptions> for QualityFilter {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            min_chars: value.min_chunk_chars,
            max_markers: value.max_replacement_chars,
            max_marker_ratio: value.max_replacement_ratio,
        }
    }
}

pub fn is_cjk_ideograph(ch: char) -> bool {
    matches!(
        ch,
        '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{20000}'..='\u{2A6DF}'
    )
}

impl QualityFilter {
    pub fn assess(&self, content: &str) -> Result<(), Rejection> {
        let chars = content.trim().chars().count();
        if chars < self.min_chars {
            return Err(Rejection::TooShort { chars });
        }

        let total = content.chars().count();
        let markers = content.chars().filter(|ch| *ch == REPLACEMENT_CHAR).count();
        let ratio = if total == 0 {
            0.0
        } else {
            markers as f64 / total as f64
        };
        if markers > self.max_markers || ratio > self.max_marker_ratio {
            return Err(Rejection::Garbled { markers, ratio });
        }

        if !content
            .chars()
            .any(|ch| ch.is_alphanumeric() || is_cjk_ideograph(ch))
        {
            return Err(Rejection::NoSignal);
        }

        Ok(())
    }

    pub fn admits(&self, chunk: &Chunk) -> bool {
        self.assess(&chunk.content).is_ok()
    }

    /// Keeps admitted chunks and returns how many were dropped.
    pub fn retain(&self, chunks: &mut Vec<Chunk>) -> usize {
        let before = chunks.len();
        chunks.retain(|chunk| match self.assess(&chunk.content) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(
                    source = %chunk.metadata.source,
                    chunk_id = %chunk.chunk_id,
                    %reason,
                    "chunk rejected"
                );
                false
            }
        });
        before - chunks.len()
    }
}
