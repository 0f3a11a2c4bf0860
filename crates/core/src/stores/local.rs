use crate::embeddings::Embedder;
use crate::traits::{VectorHit, VectorIndex};
use crate::{Chunk, ChunkMetadata, QueryFilters, SearchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const SNAPSHOT_FILE: &str = "vectors.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    id: String,
    content: String,
    metadata: ChunkMetadata,
    vector: Vec<f32>,
}

/// Points in insertion order plus their position by id.
#[derive(Debug, Default)]
struct PointTable {
    points: Vec<StoredPoint>,
    positions: HashMap<String, usize>,
}

impl PointTable {
    fn from_points(points: Vec<StoredPoint>) -> Self {
        let mut table = Self::default();
        for point in points {
            table.upsert(point);
        }
        table
    }

    fn upsert(&mut self, point: StoredPoint) {
        if let Some(&position) = self.positions.get(&point.id) {
            self.points[position] = point;
            return;
        }
        self.positions.insert(point.id.clone(), self.points.len());
        self.points.push(point);
    }

    fn clear(&mut self) {
        self.points.clear();
        self.positions.clear();
    }
}

/// Brute-force cosine store kept in memory and optionally persisted as JSON
/// under a directory.
pub struct LocalVectorStore {
    embedder: Arc<dyn Embedder>,
    directory: Option<PathBuf>,
    table: RwLock<PointTable>,
}

impl LocalVectorStore {
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            directory: None,
            table: RwLock::new(PointTable::default()),
        }
    }

    pub async fn open(
        directory: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, SearchError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let snapshot = directory.join(SNAPSHOT_FILE);
        let points: Vec<StoredPoint> = if tokio::fs::try_exists(&snapshot).await? {
            let raw = tokio::fs::read(&snapshot).await?;
            serde_json::from_slice(&raw)?
        } else {
            Vec::new()
        };

        tracing::debug!(
            path = %snapshot.display(),
            points = points.len(),
            "local vector store opened"
        );

        Ok(Self {
            embedder,
            directory: Some(directory),
            table: RwLock::new(PointTable::from_points(points)),
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.points.len()
    }

    async fn persist(&self, points: &[StoredPoint]) -> Result<(), SearchError> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let staging = directory.join(format!("{SNAPSHOT_FILE}.tmp"));
        tokio::fs::write(&staging, serde_json::to_vec(points)?).await?;
        tokio::fs::rename(&staging, directory.join(SNAPSHOT_FILE)).await?;
        Ok(())
    }
}

fn cosine(left: &[f32], right: &[f32]) -> f64 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|v| v * v).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|v| v * v).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        f64::from(dot / (left_norm * right_norm))
    }
}

#[async_trait]
impl VectorIndex for LocalVectorStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                vectors.len(),
                chunks.len()
            )));
        }

        let mut table = self.table.write().await;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            table.upsert(StoredPoint {
                id: chunk.chunk_id.clone(),
                content: chunk.content.clone(),
                metadata: chunk.metadata.clone(),
                vector,
            });
        }
        self.persist(&table.points).await?;

        Ok(chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect())
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<VectorHit>, SearchError> {
        let query_vector = self.embedder.embed(text).await?;
        let table = self.table.read().await;

        let mut hits: Vec<VectorHit> = table
            .points
            .iter()
            .filter(|point| filters.matches(&point.metadata))
            .map(|point| VectorHit {
                content: point.content.clone(),
                metadata: point.metadata.clone(),
                score: cosine(&query_vector, &point.vector),
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn get_all(&self) -> Result<Vec<(String, ChunkMetadata)>, SearchError> {
        Ok(self
            .table
            .read()
            .await
            .points
            .iter()
            .map(|point| (point.content.clone(), point.metadata.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<(), SearchError> {
        let mut table = self.table.write().await;
        table.clear();
        self.persist(&table.points).await
    }
}
