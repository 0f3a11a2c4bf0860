use crate::traits::OcrEngine;
use crate::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    file_base64: String,
    file_name: String,
    source_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    lines: Option<Vec<String>>,
    #[serde(default)]
    pages: Option<Vec<OcrPage>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl OcrEndpointConfig {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Posts the file to an OCR service and reads back recognized lines. Uses a
/// blocking client, so it must run off the async runtime.
pub struct HttpOcrEngine {
    client: Client,
    config: OcrEndpointConfig,
}

impl HttpOcrEngine {
    pub fn new(config: OcrEndpointConfig) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recognize(&self, path: &Path) -> Result<Vec<String>, IngestError> {
        let bytes = std::fs::read(path)?;
        let payload = OcrRequest {
            file_base64: STANDARD.encode(bytes),
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source_path: path.to_string_lossy().to_string(),
        };

        let mut request = self.client.post(&self.config.endpoint).json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .map_err(|error| IngestError::OcrFailed(format!("{}: {error}", self.config.endpoint)))?;
        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json()?;
        let lines = payload_to_lines(payload);
        tracing::debug!(path = %path.display(), lines = lines.len(), "OCR finished");
        Ok(lines)
    }
}

/// Prefers explicit lines, then per-page text, then one text blob. No text
/// at all is an empty list, not an error.
fn payload_to_lines(payload: OcrResponse) -> Vec<String> {
    fn split(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(['\n', '\u{000c}'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
    }

    if let Some(lines) = payload.lines {
        let lines: Vec<String> = lines
            .iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        if !lines.is_empty() {
            return lines;
        }
    }

    if let Some(pages) = payload.pages {
        let lines: Vec<String> = pages
            .iter()
            .filter_map(|page| page.text.as_deref())
            .flat_map(split)
            .collect();
        if !lines.is_empty() {
            return lines;
        }
    }

    payload
        .text
        .as_deref()
        .map(|text| split(text).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_lines_are_trimmed() {
        let payload = OcrResponse {
            lines: Some(vec!["  应急通道 ".to_string(), "   ".to_string(), "禁止停车".to_string()]),
            ..OcrResponse::default()
        };
        assert_eq!(payload_to_lines(payload), vec!["应急通道", "禁止停车"]);
    }

    #[test]
    fn pages_and_blobs_are_split_into_lines() {
        let pages: OcrResponse = serde_json::from_str(
            r#"{"pages":[{"text":"第一行\n\n第二行"},{"text":null},{"text":"第三行"}]}"#,
        )
        .unwrap();
        assert_eq!(payload_to_lines(pages), vec!["第一行", "第二行", "第三行"]);

        let blob: OcrResponse = serde_json::from_str(r#"{"text":"First\u000cSecond\n"}"#).unwrap();
        assert_eq!(payload_to_lines(blob), vec!["First", "Second"]);
    }

    #[test]
    fn no_text_means_no_lines() {
        let empty: OcrResponse = serde_json::from_str("{}").unwrap();
        assert!(payload_to_lines(empty).is_empty());
    }
}
