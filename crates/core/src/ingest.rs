use crate::chunking::{
    chunk_text_segments, normalize_whitespace, ChunkingConfig, StructuralChunker,
};
use crate::error::FailureKind;
use crate::normalize::FormatNormalizer;
use crate::quality::QualityFilter;
use crate::traits::VectorIndex;
use crate::{
    Chunk, IngestError, IngestionOptions, NormalizedDocument, SearchError, TextSegment,
    DEFAULT_DOC_TYPE,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const DEFAULT_UPSERT_BATCH: usize = 64;

/// Every regular file below `folder`, sorted. Hidden files and office lock
/// files are left out.
pub fn discover_source_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let hidden = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name.starts_with("~$"));

        if !hidden {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// First folder below `root` that contains `path`; files directly under the
/// root belong to the default category.
pub fn doc_type_for(root: &Path, path: &Path) -> String {
    let Ok(relative) = path.strip_prefix(root) else {
        return DEFAULT_DOC_TYPE.to_string();
    };

    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(first)), Some(_)) => first
            .to_str()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_DOC_TYPE.to_string()),
        _ => DEFAULT_DOC_TYPE.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub chunks: Vec<Chunk>,
    pub skipped_files: Vec<SkippedFile>,
    /// Files that loaded fine but contributed no chunk after filtering.
    pub empty_files: Vec<PathBuf>,
    pub rejected_chunks: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestionReport {
    pub fn files_seen(&self) -> usize {
        self.skipped_files.len() + self.empty_files.len() + self.indexed_files()
    }

    pub fn indexed_files(&self) -> usize {
        let mut sources: Vec<&str> = self
            .chunks
            .iter()
            .map(|chunk| chunk.metadata.source.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }
}

struct FileOutcome {
    chunks: Vec<Chunk>,
    rejected: usize,
}

fn ingest_file(
    root: &Path,
    path: &Path,
    normalizer: &FormatNormalizer,
    config: &ChunkingConfig,
    filter: &QualityFilter,
) -> Result<FileOutcome, IngestError> {
    let source = path.to_string_lossy().to_string();
    let doc_type = doc_type_for(root, path);

    let mut chunks = match normalizer.normalize(path)? {
        NormalizedDocument::Structured(document) => {
            StructuralChunker::new(config).chunk(&document, &source, &doc_type)
        }
        NormalizedDocument::Text(segments) => {
            let segments: Vec<TextSegment> = segments
                .into_iter()
                .map(|segment| TextSegment {
                    label: segment.label,
                    text: normalize_whitespace(&segment.text),
                })
                .collect();
            chunk_text_segments(&segments, &source, &doc_type, config)
        }
        NormalizedDocument::Tabular(segments) => {
            chunk_text_segments(&segments, &source, &doc_type, config)
        }
    };

    let rejected = filter.retain(&mut chunks);
    Ok(FileOutcome { chunks, rejected })
}

/// Normalizes, chunks and filters every file below `folder`. A file that
/// fails is recorded in the report and never stops the batch.
pub fn ingest_folder_best_effort(
    folder: &Path,
    options: &IngestionOptions,
    normalizer: &FormatNormalizer,
) -> Result<IngestionReport, IngestError> {
    let started_at = Utc::now();
    let files = discover_source_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no files found in {}",
            folder.display()
        )));
    }

    let config = ChunkingConfig::from(options);
    let filter = QualityFilter::from(options);

    // Each file is chunked on its own worker; results come back in path order.
    let outcomes: Vec<(PathBuf, Result<FileOutcome, IngestError>)> = files
        .into_par_iter()
        .map(|path| {
            let outcome = ingest_file(folder, &path, normalizer, &config, &filter);
            (path, outcome)
        })
        .collect();

    let mut chunks = Vec::new();
    let mut skipped_files = Vec::new();
    let mut empty_files = Vec::new();
    let mut rejected_chunks = 0usize;

    for (path, outcome) in outcomes {
        match outcome {
            Ok(outcome) => {
                rejected_chunks += outcome.rejected;
                if outcome.chunks.is_empty() {
                    tracing::info!(
                        path = %path.display(),
                        rejected = outcome.rejected,
                        "no usable chunks"
                    );
                    empty_files.push(path);
                } else {
                    tracing::debug!(
                        path = %path.display(),
                        chunks = outcome.chunks.len(),
                        "file chunked"
                    );
                    chunks.extend(outcome.chunks);
                }
            }
            Err(error) => {
                let kind = error.kind();
                tracing::warn!(path = %path.display(), %kind, %error, "skipping file");
                skipped_files.push(SkippedFile {
                    path,
                    kind,
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(IngestionReport {
        chunks,
        skipped_files,
        empty_files,
        rejected_chunks,
        started_at,
        finished_at: Utc::now(),
    })
}

pub fn ingest_folder_chunks(
    folder: &Path,
    options: &IngestionOptions,
    normalizer: &FormatNormalizer,
) -> Result<Vec<Chunk>, IngestError> {
    let report = ingest_folder_best_effort(folder, options, normalizer)?;
    Ok(report.chunks)
}

/// Upserts `chunks` in batches and returns how many were stored.
pub async fn index_corpus<V>(
    chunks: &[Chunk],
    index: &V,
    batch_size: usize,
) -> Result<usize, SearchError>
where
    V: VectorIndex + ?Sized,
{
    let mut stored = 0usize;
    for batch in chunks.chunks(batch_size.max(1)) {
        let ids = index.upsert_chunks(batch).await?;
        stored += ids.len();
        tracing::debug!(stored, total = chunks.len(), "upserted batch");
    }
    tracing::info!(stored, "corpus indexed");
    Ok(stored)
}

/// Empties the index and stores `chunks` as the whole corpus. Chunks of
/// edited or deleted files do not survive.
pub async fn rebuild_corpus<V>(
    chunks: &[Chunk],
    index: &V,
    batch_size: usize,
) -> Result<usize, SearchError>
where
    V: VectorIndex + ?Sized,
{
    index.clear().await?;
    tracing::info!(chunks = chunks.len(), "vector index cleared for rebuild");
    index_corpus(chunks, index, batch_size).await
}
