pub mod answer;
pub mod chat;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod expansion;
pub mod ingest;
pub mod lexical;
pub mod models;
pub mod normalize;
pub mod quality;
pub mod rerank;
pub mod retriever;
pub mod service;
pub mod stores;
pub mod traits;

pub use answer::{
    collect_answer, AnswerComposer, AnswerDelta, AnswerStream, ReasoningMode, ThinkSplitter,
};
pub use chat::OpenAiChatClient;
pub use chunking::{
    chunk_text_segments, normalize_whitespace, ChunkingConfig, StructuralChunker, TextSplitter,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{FailureKind, IngestError, SearchError};
pub use expansion::{ExpansionParser, QueryExpander, DEFAULT_HYPOTHETICAL_K};
pub use ingest::{
    discover_source_files, index_corpus, ingest_folder_best_effort, ingest_folder_chunks,
    rebuild_corpus, IngestionReport, SkippedFile, DEFAULT_UPSERT_BATCH,
};
pub use lexical::{Bm25Params, JiebaTokenizer, LexicalIndex, LexicalIndexCell, Tokenizer};
pub use models::{
    Block, Chunk, ChunkKind, ChunkMetadata, ContentType, EvidenceSet, ExpandedQuerySet,
    IngestionOptions, NormalizedDocument, QueryFilters, RerankedResult, RetrievalCandidate,
    RetrievalOptions, RetrievalRoute, StructuredDocument, Table, TextSegment, DEFAULT_DOC_TYPE,
};
pub use normalize::{FormatNormalizer, HttpOcrEngine, OcrEndpointConfig, SourceFormat};
pub use quality::{QualityFilter, Rejection};
pub use rerank::{HttpCrossEncoder, Reranker};
pub use retriever::{dedup_candidates, HybridRetriever};
pub use service::{KnowledgeService, ServiceCell, ServiceParts};
pub use stores::{LocalVectorStore, QdrantStore};
pub use traits::{
    ChatDelta, ChatModel, ChatStream, CrossEncoder, KeywordIndex, OcrEngine, VectorHit,
    VectorIndex,
};
