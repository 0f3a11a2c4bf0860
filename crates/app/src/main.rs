use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use doc_qa_core::normalize::LegacyConverter;
use doc_qa_core::{
    index_corpus, ingest_folder_best_effort, rebuild_corpus, AnswerDelta, CharacterNgramEmbedder,
    ChatModel, CrossEncoder, Embedder, EvidenceSet, FormatNormalizer, HttpCrossEncoder,
    HttpEmbedder, HttpOcrEngine, IngestionOptions, KnowledgeService, LocalVectorStore,
    OcrEndpointConfig, OpenAiChatClient, QdrantStore, QueryExpander, QueryFilters, ReasoningMode,
    ServiceParts, VectorIndex, DEFAULT_HYPOTHETICAL_K, DEFAULT_UPSERT_BATCH,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "doc-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    endpoints: Endpoints,
}

#[derive(Args)]
struct Endpoints {
    /// Qdrant base URL
    #[arg(long, env = "DOCQA_QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "DOCQA_QDRANT_COLLECTION", default_value = "doc_chunks")]
    qdrant_collection: String,

    /// Keep vectors in this directory instead of Qdrant.
    #[arg(long, env = "DOCQA_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// OpenAI-compatible embeddings base URL. Without it an offline
    /// character n-gram embedder is used.
    #[arg(long, env = "DOCQA_EMBED_URL")]
    embed_url: Option<String>,

    #[arg(long, env = "DOCQA_EMBED_MODEL", default_value = "bge-m3")]
    embed_model: String,

    #[arg(long, env = "DOCQA_EMBED_DIMENSIONS", default_value = "1024")]
    embed_dimensions: usize,

    #[arg(long, env = "DOCQA_EMBED_API_KEY", hide_env_values = true)]
    embed_api_key: Option<String>,

    /// OpenAI-compatible chat base URL
    #[arg(long, env = "DOCQA_CHAT_URL", default_value = "http://localhost:8000/v1")]
    chat_url: String,

    #[arg(long, env = "DOCQA_CHAT_MODEL", default_value = "qwen")]
    chat_model: String,

    #[arg(long, env = "DOCQA_CHAT_API_KEY", hide_env_values = true)]
    chat_api_key: Option<String>,

    /// Rerank service base URL
    #[arg(long, env = "DOCQA_RERANK_URL", default_value = "http://localhost:8001/v1")]
    rerank_url: String,

    #[arg(long, env = "DOCQA_RERANK_MODEL", default_value = "bge-reranker-v2-m3")]
    rerank_model: String,

    #[arg(long, env = "DOCQA_RERANK_API_KEY", hide_env_values = true)]
    rerank_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk every file below a folder and index the chunks.
    Ingest {
        /// Folder whose first-level subfolders name the document categories.
        #[arg(long)]
        folder: PathBuf,

        /// OCR service for images and scanned PDFs.
        #[arg(long, env = "DOCQA_OCR_URL")]
        ocr_url: Option<String>,

        #[arg(long, env = "DOCQA_OCR_API_KEY", hide_env_values = true)]
        ocr_api_key: Option<String>,

        /// Office binary used to convert .doc and .wps files.
        #[arg(long, env = "DOCQA_OFFICE_PROGRAM", default_value = "soffice")]
        office_program: String,

        /// Where converted legacy documents are written.
        #[arg(long)]
        conversion_dir: Option<PathBuf>,

        /// Prefix table chunks of these categories with the file name.
        #[arg(long = "tag-tables", value_delimiter = ',')]
        tag_tables_for_doc_types: Vec<String>,

        /// Characters of surrounding prose stored with each table.
        #[arg(long)]
        table_context: Option<usize>,

        #[arg(long, default_value_t = DEFAULT_UPSERT_BATCH)]
        batch_size: usize,

        /// Empty the vector index first so the folder becomes the whole
        /// corpus. Without it chunks are only upserted.
        #[arg(long, default_value_t = false)]
        rebuild: bool,
    },
    /// Print the paraphrases and keywords generated for a question.
    Expand {
        #[arg(long)]
        query: String,
    },
    /// Retrieve and rerank evidence without generating an answer.
    Search {
        #[arg(long)]
        query: String,

        /// Only consider chunks of this category.
        #[arg(long)]
        doc_type: Option<String>,

        /// Also search with a drafted answer document and put its hits first.
        #[arg(long, default_value_t = false)]
        hypothetical: bool,
    },
    /// Answer a question from the indexed corpus, streaming to stdout.
    Ask {
        #[arg(long)]
        query: String,

        #[arg(long)]
        doc_type: Option<String>,

        #[arg(long, default_value_t = false)]
        hypothetical: bool,

        /// Also print the model's reasoning, to stderr.
        #[arg(long, default_value_t = false)]
        show_reasoning: bool,

        /// Print the evidence the answer was grounded on.
        #[arg(long, default_value_t = false)]
        show_evidence: bool,
    },
}

impl Endpoints {
    fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        match &self.embed_url {
            Some(url) => Ok(Arc::new(HttpEmbedder::new(
                url,
                &self.embed_model,
                self.embed_api_key.clone(),
                self.embed_dimensions,
            )?)),
            None => Ok(Arc::new(CharacterNgramEmbedder::default())),
        }
    }

    async fn vector_index(&self) -> anyhow::Result<Arc<dyn VectorIndex>> {
        let embedder = self.embedder()?;
        match &self.local_store {
            Some(directory) => {
                let store = LocalVectorStore::open(directory.clone(), embedder)
                    .await
                    .with_context(|| format!("opening local store {}", directory.display()))?;
                Ok(Arc::new(store))
            }
            None => {
                let store = QdrantStore::new(&self.qdrant_url, &self.qdrant_collection, embedder)?;
                store.ensure_collection().await?;
                Ok(Arc::new(store))
            }
        }
    }

    fn chat(&self) -> anyhow::Result<Arc<dyn ChatModel>> {
        Ok(Arc::new(OpenAiChatClient::new(
            &self.chat_url,
            &self.chat_model,
            self.chat_api_key.clone(),
        )?))
    }

    fn cross_encoder(&self) -> anyhow::Result<Arc<dyn CrossEncoder>> {
        Ok(Arc::new(HttpCrossEncoder::new(
            &self.rerank_url,
            &self.rerank_model,
            self.rerank_api_key.clone(),
        )?))
    }

    async fn service(&self, hypothetical: bool) -> anyhow::Result<KnowledgeService> {
        let mut parts = ServiceParts::new(
            self.vector_index().await?,
            self.chat()?,
            self.cross_encoder()?,
        );
        if hypothetical {
            parts.options.hypothetical_k = Some(DEFAULT_HYPOTHETICAL_K);
        }
        Ok(KnowledgeService::open(parts).await?)
    }
}

fn filters(doc_type: Option<String>) -> QueryFilters {
    doc_type.map(QueryFilters::doc_type).unwrap_or_default()
}

fn print_evidence(evidence: &EvidenceSet) {
    println!("query: {}", evidence.query.original);
    for paraphrase in &evidence.query.paraphrases {
        println!("  paraphrase: {paraphrase}");
    }
    for keyword in &evidence.query.keywords {
        println!("  keyword: {keyword}");
    }
    println!("candidates: {}", evidence.candidate_count);
    for (rank, result) in evidence.results.iter().enumerate() {
        let origin = if rank < evidence.hypothetical_count {
            " (hypothetical)"
        } else {
            ""
        };
        println!(
            "[{}] score={:.4}{}\n{}",
            rank + 1,
            result.score,
            origin,
            result.content
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "doc-qa boot"
    );

    match cli.command {
        Command::Ingest {
            folder,
            ocr_url,
            ocr_api_key,
            office_program,
            conversion_dir,
            tag_tables_for_doc_types,
            table_context,
            batch_size,
            rebuild,
        } => {
            let mut options = IngestionOptions {
                table_context_chars: table_context,
                tag_tables_for_doc_types,
                ..IngestionOptions::default()
            };
            if let Some(conversion_dir) = conversion_dir {
                options.conversion_dir = conversion_dir;
            }

            let mut normalizer = FormatNormalizer::new(LegacyConverter::new(
                office_program,
                options.conversion_dir.clone(),
            ));
            if let Some(url) = ocr_url {
                let engine = HttpOcrEngine::new(OcrEndpointConfig::new(url, ocr_api_key))?;
                normalizer = normalizer.with_ocr(Arc::new(engine));
            }

            let source = folder.clone();
            let report = tokio::task::spawn_blocking(move || {
                ingest_folder_best_effort(&source, &options, &normalizer)
            })
            .await
            .context("ingestion worker panicked")??;

            for skipped in &report.skipped_files {
                warn!(
                    path = %skipped.path.display(),
                    kind = %skipped.kind,
                    reason = %skipped.reason,
                    "skipped file"
                );
            }
            for empty in &report.empty_files {
                info!(path = %empty.display(), "file produced no chunks");
            }

            let vector = cli.endpoints.vector_index().await?;
            let stored = if rebuild {
                rebuild_corpus(&report.chunks, vector.as_ref(), batch_size).await?
            } else {
                index_corpus(&report.chunks, vector.as_ref(), batch_size).await?
            };

            println!(
                "{} chunks from {} of {} files indexed \
                 ({} skipped, {} empty, {} chunks rejected) in {}s",
                stored,
                report.indexed_files(),
                report.files_seen(),
                report.skipped_files.len(),
                report.empty_files.len(),
                report.rejected_chunks,
                (report.finished_at - report.started_at).num_seconds()
            );
        }
        Command::Expand { query } => {
            let expander = QueryExpander::new(cli.endpoints.chat()?)?;
            let expanded = expander.expand(&query).await?;
            for seed in expanded.seeds() {
                println!("{seed}");
            }
        }
        Command::Search {
            query,
            doc_type,
            hypothetical,
        } => {
            let service = cli.endpoints.service(hypothetical).await?;
            let evidence = service.retrieve_evidence(&query, &filters(doc_type)).await?;
            print_evidence(&evidence);
        }
        Command::Ask {
            query,
            doc_type,
            hypothetical,
            show_reasoning,
            show_evidence,
        } => {
            let service = cli.endpoints.service(hypothetical).await?;
            let mode = if show_reasoning {
                ReasoningMode::Surface
            } else {
                ReasoningMode::Strip
            };
            let (evidence, mut answer) = service.answer(&query, &filters(doc_type), mode).await?;
            if show_evidence {
                print_evidence(&evidence);
                println!();
            }

            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(delta) = answer.next().await {
                match delta? {
                    AnswerDelta::Text(text) => {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    AnswerDelta::Reasoning(text) => {
                        stderr.write_all(text.as_bytes()).await?;
                        stderr.flush().await?;
                    }
                }
            }
            stdout.write_all(b"\n").await?;
        }
    }

    Ok(())
}
