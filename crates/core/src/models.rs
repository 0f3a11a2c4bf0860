use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_DOC_TYPE: &str = "General";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Table,
}

/// Type-specific chunk fields, tagged by `content_type` when serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "content_type", rename_all = "lowercase")]
pub enum ChunkKind {
    Text {
        chunk_index: u32,
        length: usize,
    },
    Table {
        table_index: u32,
        table_name: String,
        row_count: usize,
        col_count: usize,
        has_context: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub doc_type: String,
    #[serde(flatten)]
    pub kind: ChunkKind,
}

impl ChunkMetadata {
    pub fn content_type(&self) -> ContentType {
        match self.kind {
            ChunkKind::Text { .. } => ContentType::Text,
            ChunkKind::Table { .. } => ContentType::Table,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
    pub col_count: usize,
}

impl Table {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self { rows, col_count }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(String),
    Table(Table),
}

/// Ordered paragraph and table blocks of one word-processor document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredDocument {
    pub file_name: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub label: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedDocument {
    Structured(StructuredDocument),
    Text(Vec<TextSegment>),
    /// Tab-delimited rows from CSV files and spreadsheets. Cell boundaries
    /// and empty cells are significant, so the text is kept verbatim.
    Tabular(Vec<TextSegment>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub doc_type: Option<String>,
}

impl QueryFilters {
    pub fn doc_type(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: Some(doc_type.into()),
        }
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.doc_type
            .as_deref()
            .map_or(true, |wanted| metadata.doc_type == wanted)
    }
}

/// The original query plus the paraphrases and keyword fragments generated for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpandedQuerySet {
    pub original: String,
    pub paraphrases: Vec<String>,
    pub keywords: Vec<String>,
}

impl ExpandedQuerySet {
    pub fn original_only(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            paraphrases: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// Every retrieval seed, original first.
    pub fn seeds(&self) -> Vec<String> {
        std::iter::once(self.original.clone())
            .chain(self.paraphrases.iter().cloned())
            .chain(self.keywords.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalRoute {
    Lexical,
    Vector,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalCandidate {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub route: RetrievalRoute,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankedResult {
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSet {
    pub query: ExpandedQuerySet,
    pub candidate_count: usize,
    /// Leading entries of `results` found by searching with a drafted
    /// hypothetical answer instead of the question.
    #[serde(default)]
    pub hypothetical_count: usize,
    pub results: Vec<RerankedResult>,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub min_chunk_chars: usize,
    pub max_replacement_chars: usize,
    pub max_replacement_ratio: f64,
    pub table_context_chars: Option<usize>,
    pub tag_tables_for_doc_types: Vec<String>,
    pub conversion_dir: PathBuf,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 800,
            chunk_overlap_chars: 100,
            min_chunk_chars: 20,
            max_replacement_chars: 5,
            max_replacement_ratio: 0.05,
            table_context_chars: None,
            tag_tables_for_doc_types: Vec::new(),
            conversion_dir: std::env::temp_dir().join("doc-qa-converted"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    /// Lexical hits scored before the docType filter is applied.
    pub lexical_pool: usize,
    pub lexical_keep: usize,
    pub vector_k: usize,
    pub rerank_top_k: usize,
    /// When set, the chat model drafts a hypothetical answer and this many
    /// vector hits for the draft are placed ahead of the reranked evidence.
    pub hypothetical_k: Option<usize>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            lexical_pool: 10,
            lexical_keep: 5,
            vector_k: 5,
            rerank_top_k: 5,
            hypothetical_k: None,
        }
    }
}
