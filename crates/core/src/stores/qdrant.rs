use crate::embeddings::{join_endpoint, Embedder};
use crate::traits::{VectorHit, VectorIndex};
use crate::{Chunk, ChunkMetadata, QueryFilters, SearchError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

const SCROLL_PAGE: usize = 256;

pub struct QdrantStore {
    endpoint: Url,
    collection: String,
    client: Client,
    embedder: Arc<dyn Embedder>,
}

impl QdrantStore {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            collection: collection.into(),
            client: Client::new(),
            embedder,
        })
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        join_endpoint(
            self.endpoint.as_str(),
            &format!("collections/{}{}", self.collection, path),
        )
    }

    /// Creates the collection with the embedder's dimension if it is missing.
    pub async fn ensure_collection(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .get(self.url("")?)
            .send()
            .await
            .map_err(|error| SearchError::unavailable("qdrant", error))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let response = self
            .client
            .put(self.url("")?)
            .json(&json!({
                "vectors": {
                    "size": self.embedder.dimensions(),
                    "distance": "Cosine",
                }
            }))
            .send()
            .await
            .map_err(|error| SearchError::unavailable("qdrant", error))?;

        if !response.status().is_success() {
            return Err(SearchError::Request(format!(
                "qdrant collection setup failed with {}",
                response.status()
            )));
        }

        tracing::info!(collection = %self.collection, "created qdrant collection");
        Ok(())
    }

    async fn post_json(&self, url: Url, body: Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|error| SearchError::unavailable("qdrant", error))?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Qdrant point ids must be integers or UUIDs; derive a stable UUID from the
/// chunk id.
pub fn point_id(chunk_id: &str) -> Uuid {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn chunk_payload(chunk: &Chunk) -> Result<Value, SearchError> {
    let mut payload = serde_json::to_value(&chunk.metadata)?;
    if let Value::Object(map) = &mut payload {
        map.insert("content".to_string(), Value::String(chunk.content.clone()));
        map.insert("chunk_id".to_string(), Value::String(chunk.chunk_id.clone()));
    }
    Ok(payload)
}

fn build_filter(filters: &QueryFilters) -> Option<Value> {
    filters.doc_type.as_ref().map(|doc_type| {
        json!({
            "must": [
                { "key": "doc_type", "match": { "value": doc_type } }
            ]
        })
    })
}

fn parse_point(point: &Value) -> Option<(String, ChunkMetadata)> {
    let payload = point.pointer("/payload")?;
    let content = payload.pointer("/content").and_then(Value::as_str)?.to_string();
    let metadata = serde_json::from_value(payload.clone()).ok()?;
    Some((content, metadata))
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if chunks.len() != embeddings.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        let dimensions = self.embedder.dimensions();
        let points = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| {
                if embedding.len() != dimensions {
                    return Err(SearchError::Request(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        dimensions
                    )));
                }

                Ok(json!({
                    "id": point_id(&chunk.chunk_id).to_string(),
                    "vector": embedding,
                    "payload": chunk_payload(chunk)?,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let mut url = self.url("/points")?;
        url.set_query(Some("wait=true"));
        let response = self
            .client
            .put(url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|error| SearchError::unavailable("qdrant", error))?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(chunks
            .iter()
            .map(|chunk| point_id(&chunk.chunk_id).to_string())
            .collect())
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<VectorHit>, SearchError> {
        let query_vector = self.embedder.embed(text).await?;

        let mut body = json!({
            "vector": query_vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let parsed = self.post_json(self.url("/points/search")?, body).await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::new();
        for hit in hits {
            let Some((content, metadata)) = parse_point(&hit) else {
                tracing::warn!(point = %hit, "qdrant hit without a readable payload");
                continue;
            };
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
            result.push(VectorHit {
                content,
                metadata,
                score,
            });
        }

        Ok(result)
    }

    /// Drops the collection and recreates it empty.
    async fn clear(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(self.url("")?)
            .send()
            .await
            .map_err(|error| SearchError::unavailable("qdrant", error))?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        tracing::info!(collection = %self.collection, "dropped qdrant collection");
        self.ensure_collection().await
    }

    async fn get_all(&self) -> Result<Vec<(String, ChunkMetadata)>, SearchError> {
        let mut all = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let page = self.post_json(self.url("/points/scroll")?, body).await?;
            if let Some(points) = page.pointer("/result/points").and_then(Value::as_array) {
                all.extend(points.iter().filter_map(parse_point));
            }

            offset = page
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkKind;

    fn table_chunk() -> Chunk {
        Chunk {
            chunk_id: "abc".to_string(),
            content: "行1: 名称 | 尺码".to_string(),
            metadata: ChunkMetadata {
                source: "Technology/spec.docx".to_string(),
                doc_type: "Technology".to_string(),
                kind: ChunkKind::Table {
                    table_index: 1,
                    table_name: "规格表".to_string(),
                    row_count: 1,
                    col_count: 2,
                    has_context: false,
                },
            },
        }
    }

    #[test]
    fn point_ids_are_stable_uuids() {
        assert_eq!(point_id("chunk-1"), point_id("chunk-1"));
        assert_ne!(point_id("chunk-1"), point_id("chunk-2"));
    }

    #[test]
    fn payload_round_trips_metadata_and_content() {
        let chunk = table_chunk();
        let point = json!({ "id": 1, "payload": chunk_payload(&chunk).unwrap() });

        let (content, metadata) = parse_point(&point).unwrap();
        assert_eq!(content, chunk.content);
        assert_eq!(metadata, chunk.metadata);
    }

    #[test]
    fn doc_type_filter_becomes_a_must_clause() {
        assert!(build_filter(&QueryFilters::default()).is_none());
        let filter = build_filter(&QueryFilters::doc_type("Case")).unwrap();
        assert_eq!(filter.pointer("/must/0/match/value"), Some(&json!("Case")));
    }
}
