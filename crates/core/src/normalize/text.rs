use crate::{IngestError, TextSegment};
use encoding_rs::{Encoding, BIG5, GB18030, GBK, UTF_16LE, UTF_8};
use std::path::Path;

/// Tried in order; the first strict decode wins.
pub const FALLBACK_ENCODINGS: [&Encoding; 5] = [UTF_8, GB18030, GBK, BIG5, UTF_16LE];

/// Decodes `bytes` with the BOM-declared encoding, else the first fallback
/// that decodes without replacement.
pub fn decode_with_fallback(bytes: &[u8]) -> Option<(String, &'static Encoding)> {
    if let Some((encoding, bom_length)) = Encoding::for_bom(bytes) {
        return encoding
            .decode_without_bom_handling_and_without_replacement(&bytes[bom_length..])
            .map(|text| (text.into_owned(), encoding));
    }

    FALLBACK_ENCODINGS.iter().find_map(|encoding| {
        encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|text| (text.into_owned(), *encoding))
    })
}

pub fn read_decoded(path: &Path) -> Result<String, IngestError> {
    let bytes = std::fs::read(path)?;
    let (text, encoding) = decode_with_fallback(&bytes)
        .ok_or_else(|| IngestError::DecodeFailed(path.display().to_string()))?;
    tracing::debug!(path = %path.display(), encoding = encoding.name(), "decoded text file");
    Ok(text)
}

pub fn read_plain_text(path: &Path) -> Result<Vec<TextSegment>, IngestError> {
    Ok(vec![TextSegment {
        label: None,
        text: read_decoded(path)?,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_is_preferred() {
        let (text, encoding) = decode_with_fallback("应急预案".as_bytes()).unwrap();
        assert_eq!(text, "应急预案");
        assert_eq!(encoding, UTF_8);
    }

    #[test]
    fn gb18030_bytes_fall_through_utf8() {
        let (bytes, _, _) = GB18030.encode("防汛抗旱");
        let (text, encoding) = decode_with_fallback(&bytes).unwrap();
        assert_eq!(text, "防汛抗旱");
        assert_eq!(encoding, GB18030);
    }

    #[test]
    fn byte_order_mark_decides_the_encoding() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "预警".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let (text, encoding) = decode_with_fallback(&bytes).unwrap();
        assert_eq!(text, "预警");
        assert_eq!(encoding, UTF_16LE);
    }

    #[test]
    fn undecodable_files_are_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.txt");
        // A lone 0xFF is invalid in every candidate and an odd length rules out UTF-16.
        std::fs::write(&path, [0xFFu8, 0x80, 0xFF])?;

        let error = read_plain_text(&path).unwrap_err();
        assert!(matches!(error, IngestError::DecodeFailed(_)));
        Ok(())
    }
}
