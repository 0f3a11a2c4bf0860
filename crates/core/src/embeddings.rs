use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| SearchError::unavailable("embedder", "empty embedding response"))
    }
}

/// Hashes character bigrams and trigrams into a fixed-size normalized vector.
/// Offline and deterministic; no model needed.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().filter(|ch| !ch.is_whitespace()).collect();

        if chars.is_empty() {
            return vector;
        }

        // CJK text carries meaning in short spans, so bigrams are hashed too.
        for width in [2usize, 3] {
            for window in chars.windows(width.min(chars.len())) {
                let token = window.iter().collect::<String>();
                let mut hash = 1469598103934665603u64;
                for byte in token.bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
                let bucket = (hash % vector.len() as u64) as usize;
                vector[bucket] += 1.0;
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            client: Client::new(),
            endpoint: join_endpoint(base_url, "embeddings")?,
            model: model.into(),
            api_key,
            dimensions,
        })
    }
}

/// Joins `path` under `base`, keeping any path prefix such as `/v1`.
pub(crate) fn join_endpoint(base: &str, path: &str) -> Result<Url, SearchError> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path)?)
}

fn ordered_embeddings(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, SearchError> {
    if items.len() != expected {
        return Err(SearchError::BackendResponse {
            backend: "embedder".to_string(),
            details: format!("expected {expected} embeddings, got {}", items.len()),
        });
    }
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index.unwrap_or_default());
    }
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(self.endpoint.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| SearchError::unavailable("embedder", error))?;
        if !response.status().is_success() {
            return Err(SearchError::unavailable(
                "embedder",
                format!("{} returned {}", self.endpoint, response.status()),
            ));
        }

        let payload: EmbeddingResponse = response.json().await?;
        ordered_embeddings(payload.data, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let texts = vec!["防寒服规格表".to_string(), "防寒服规格表".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors[0], vectors[1]);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        assert_eq!(embedder.embed_one("abc").len(), 32);
        assert_eq!(embedder.embed_one("").len(), 32);
    }

    #[test]
    fn endpoint_join_keeps_version_prefix() {
        let url = join_endpoint("http://localhost:8000/v1", "embeddings").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/v1/embeddings");
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let items = vec![
            EmbeddingItem {
                index: Some(1),
                embedding: vec![1.0],
            },
            EmbeddingItem {
                index: Some(0),
                embedding: vec![0.0],
            },
        ];
        assert_eq!(ordered_embeddings(items, 2).unwrap(), vec![vec![0.0], vec![1.0]]);
        assert!(ordered_embeddings(Vec::new(), 1).is_err());
    }
}
