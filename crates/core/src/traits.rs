use crate::{
    Chunk, ChunkMetadata, IngestError, QueryFilters, RetrievalCandidate, RetrievalOptions,
    SearchError,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn search_keyword(
        &self,
        query: &str,
        filters: &QueryFilters,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalCandidate>, SearchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Stores chunks and returns their ids in input order.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError>;

    async fn query(
        &self,
        text: &str,
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<VectorHit>, SearchError>;

    async fn get_all(&self) -> Result<Vec<(String, ChunkMetadata)>, SearchError>;

    /// Removes every stored chunk, leaving an empty index ready for upserts.
    async fn clear(&self) -> Result<(), SearchError>;
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    Content(String),
    Reasoning(String),
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta, SearchError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<ChatStream, SearchError>;

    /// Collects the content channel of a streamed completion.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, SearchError> {
        let mut stream = self.stream(system_prompt, user_prompt).await?;
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if let ChatDelta::Content(piece) = delta? {
                text.push_str(&piece);
            }
        }
        Ok(text)
    }
}

#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance of `candidate` to `query`; higher is more relevant.
    async fn score(&self, query: &str, candidate: &str) -> Result<f32, SearchError>;

    async fn score_batch(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f32>, SearchError> {
        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            scores.push(self.score(query, candidate).await?);
        }
        Ok(scores)
    }
}

#[async_trait]
impl<T: KeywordIndex + ?Sized> KeywordIndex for Arc<T> {
    async fn search_keyword(
        &self,
        query: &str,
        filters: &QueryFilters,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        (**self).search_keyword(query, filters, options).await
    }
}

#[async_trait]
impl<T: VectorIndex + ?Sized> VectorIndex for Arc<T> {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError> {
        (**self).upsert_chunks(chunks).await
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<VectorHit>, SearchError> {
        (**self).query(text, k, filters).await
    }

    async fn get_all(&self) -> Result<Vec<(String, ChunkMetadata)>, SearchError> {
        (**self).get_all().await
    }

    async fn clear(&self) -> Result<(), SearchError> {
        (**self).clear().await
    }
}

#[async_trait]
impl<T: ChatModel + ?Sized> ChatModel for Arc<T> {
    async fn stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<ChatStream, SearchError> {
        (**self).stream(system_prompt, user_prompt).await
    }
}

#[async_trait]
impl<T: CrossEncoder + ?Sized> CrossEncoder for Arc<T> {
    async fn score(&self, query: &str, candidate: &str) -> Result<f32, SearchError> {
        (**self).score(query, candidate).await
    }

    async fn score_batch(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f32>, SearchError> {
        (**self).score_batch(query, candidates).await
    }
}

/// Image to recognized text lines. Blocking; called from ingestion workers.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, path: &Path) -> Result<Vec<String>, IngestError>;
}
