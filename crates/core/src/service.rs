use crate::answer::{AnswerComposer, AnswerStream, ReasoningMode};
use crate::expansion::QueryExpander;
use crate::lexical::{JiebaTokenizer, LexicalIndex, LexicalIndexCell, Tokenizer};
use crate::rerank::Reranker;
use crate::retriever::HybridRetriever;
use crate::traits::{ChatModel, CrossEncoder, VectorIndex};
use crate::{EvidenceSet, QueryFilters, RerankedResult, RetrievalOptions, SearchError};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Collaborators a service is assembled from.
pub struct ServiceParts {
    pub vector: Arc<dyn VectorIndex>,
    pub chat: Arc<dyn ChatModel>,
    pub cross_encoder: Arc<dyn CrossEncoder>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub options: RetrievalOptions,
}

impl ServiceParts {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatModel>,
        cross_encoder: Arc<dyn CrossEncoder>,
    ) -> Self {
        Self {
            vector,
            chat,
            cross_encoder,
            tokenizer: Arc::new(JiebaTokenizer::default()),
            options: RetrievalOptions::default(),
        }
    }
}

/// Long-lived query handle. Holds no per-query state; every method takes
/// `&self` and concurrent queries are independent.
pub struct KnowledgeService {
    lexical: Arc<LexicalIndexCell>,
    tokenizer: Arc<dyn Tokenizer>,
    vector: Arc<dyn VectorIndex>,
    expander: QueryExpander<Arc<dyn ChatModel>>,
    retriever: HybridRetriever<Arc<LexicalIndexCell>, Arc<dyn VectorIndex>>,
    reranker: Reranker<Arc<dyn CrossEncoder>>,
    composer: AnswerComposer<Arc<dyn ChatModel>>,
}

impl KnowledgeService {
    /// Builds the service with an empty lexical index; call
    /// [`KnowledgeService::rebuild_lexical_index`] to load the corpus.
    pub fn new(parts: ServiceParts) -> Result<Self, SearchError> {
        let ServiceParts {
            vector,
            chat,
            cross_encoder,
            tokenizer,
            options,
        } = parts;

        let lexical = Arc::new(LexicalIndexCell::new(LexicalIndex::empty(Arc::clone(
            &tokenizer,
        ))));

        Ok(Self {
            retriever: HybridRetriever::new(Arc::clone(&lexical), Arc::clone(&vector), options),
            reranker: Reranker::with_top_k(cross_encoder, options.rerank_top_k),
            expander: QueryExpander::new(Arc::clone(&chat))?,
            composer: AnswerComposer::new(chat),
            lexical,
            tokenizer,
            vector,
        })
    }

    /// Builds the service and loads the lexical index from the vector store.
    pub async fn open(parts: ServiceParts) -> Result<Self, SearchError> {
        let service = Self::new(parts)?;
        service.rebuild_lexical_index().await?;
        Ok(service)
    }

    pub fn lexical_index(&self) -> Arc<LexicalIndex> {
        self.lexical.snapshot()
    }

    /// Re-reads the whole corpus and swaps in a fresh lexical index. Queries
    /// already running keep the generation they started with.
    pub async fn rebuild_lexical_index(&self) -> Result<usize, SearchError> {
        let corpus = self.vector.get_all().await?;
        let tokenizer = Arc::clone(&self.tokenizer);
        let index = tokio::task::spawn_blocking(move || LexicalIndex::build(corpus, tokenizer))
            .await
            .map_err(|error| SearchError::Request(format!("lexical index build failed: {error}")))?;

        let entries = index.len();
        let previous = self.lexical.swap(index);
        tracing::info!(entries, previous = previous.len(), "lexical index rebuilt");
        Ok(entries)
    }

    /// Expands, retrieves and reranks. With `hypothetical_k` set, hits for a
    /// drafted answer document lead the results. Any collaborator failure
    /// fails the whole query; nothing gathered before it is returned.
    pub async fn retrieve_evidence(
        &self,
        query: &str,
        filters: &QueryFilters,
    ) -> Result<EvidenceSet, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }

        let ((expanded, contents, reranked), drafted) = tokio::try_join!(
            async {
                let expanded = self.expander.expand(query).await?;
                let candidates = self.retriever.retrieve(&expanded, filters).await?;
                let contents: Vec<String> = candidates
                    .into_iter()
                    .map(|candidate| candidate.content)
                    .collect();
                let reranked = self.reranker.rerank(&expanded.original, &contents).await?;
                Ok::<_, SearchError>((expanded, contents, reranked))
            },
            self.hypothetical_hits(query, filters)
        )?;

        let hypothetical_count = drafted.len();
        let seen: HashSet<String> = drafted.iter().map(|hit| hit.content.clone()).collect();
        let mut results = drafted;
        results.extend(
            reranked
                .into_iter()
                .filter(|result| !seen.contains(&result.content)),
        );

        tracing::info!(
            query,
            candidates = contents.len(),
            hypothetical = hypothetical_count,
            kept = results.len(),
            "evidence retrieved"
        );
        Ok(EvidenceSet {
            query: expanded,
            candidate_count: contents.len(),
            hypothetical_count,
            results,
        })
    }

    /// Vector hits for a drafted answer document, in store order. Empty when
    /// the mode is off or the draft is blank.
    async fn hypothetical_hits(
        &self,
        query: &str,
        filters: &QueryFilters,
    ) -> Result<Vec<RerankedResult>, SearchError> {
        let k = match self.retriever.options().hypothetical_k {
            Some(k) if k > 0 => k,
            _ => return Ok(Vec::new()),
        };

        let draft = self.expander.draft_document(query).await?;
        if draft.is_empty() {
            tracing::warn!(query, "hypothetical draft was empty");
            return Ok(Vec::new());
        }

        let hits = self.vector.query(&draft, k, filters).await?;
        Ok(hits
            .into_iter()
            .map(|hit| RerankedResult {
                content: hit.content,
                score: hit.score as f32,
            })
            .collect())
    }

    /// Retrieves evidence and starts streaming the answer. Dropping the
    /// stream stops forwarding and releases the chat connection.
    pub async fn answer(
        &self,
        query: &str,
        filters: &QueryFilters,
        mode: ReasoningMode,
    ) -> Result<(EvidenceSet, AnswerStream), SearchError> {
        let evidence = self.retrieve_evidence(query, filters).await?;
        let stream = self
            .composer
            .compose(&evidence.query.original, &evidence.results, mode)
            .await?;
        Ok((evidence, stream))
    }
}

/// Process-wide slot for the service; the first caller builds it and every
/// other caller waits for and shares that instance.
#[derive(Default)]
pub struct ServiceCell {
    cell: OnceCell<Arc<KnowledgeService>>,
}

impl ServiceCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<KnowledgeService>> {
        self.cell.get().cloned()
    }

    /// A failed `init` leaves the cell empty so a later call may retry.
    pub async fn get_or_try_init<F, Fut>(
        &self,
        init: F,
    ) -> Result<Arc<KnowledgeService>, SearchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KnowledgeService, SearchError>>,
    {
        let service = self
            .cell
            .get_or_try_init(|| async move { init().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatDelta, ChatStream, VectorHit};
    use crate::{Chunk, ChunkKind, ChunkMetadata};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn metadata(doc_type: &str) -> ChunkMetadata {
        ChunkMetadata {
            source: format!("{doc_type}/guide.docx"),
            doc_type: doc_type.to_string(),
            kind: ChunkKind::Text {
                chunk_index: 1,
                length: 20,
            },
        }
    }

    struct MemoryVectors {
        corpus: Mutex<Vec<(String, ChunkMetadata)>>,
    }

    impl MemoryVectors {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                corpus: Mutex::new(
                    entries
                        .iter()
                        .map(|(content, doc_type)| (content.to_string(), metadata(doc_type)))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for MemoryVectors {
        async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<String>, SearchError> {
            let mut corpus = self.corpus.lock().unwrap();
            for chunk in chunks {
                corpus.push((chunk.content.clone(), chunk.metadata.clone()));
            }
            Ok(chunks.iter().map(|chunk| chunk.chunk_id.clone()).collect())
        }

        async fn query(
            &self,
            text: &str,
            k: usize,
            filters: &QueryFilters,
        ) -> Result<Vec<VectorHit>, SearchError> {
            let corpus = self.corpus.lock().unwrap();
            Ok(corpus
                .iter()
                .filter(|(content, metadata)| filters.matches(metadata) && content.contains(text))
                .take(k)
                .map(|(content, metadata)| VectorHit {
                    content: content.clone(),
                    metadata: metadata.clone(),
                    score: 1.0,
                })
                .collect())
        }

        async fn get_all(&self) -> Result<Vec<(String, ChunkMetadata)>, SearchError> {
            Ok(self.corpus.lock().unwrap().clone())
        }

        async fn clear(&self) -> Result<(), SearchError> {
            self.corpus.lock().unwrap().clear();
            Ok(())
        }
    }

    struct CannedChat {
        reply: String,
    }

    #[async_trait]
    impl ChatModel for CannedChat {
        async fn stream(&self, _system: &str, _user: &str) -> Result<ChatStream, SearchError> {
            let items = vec![Ok(ChatDelta::Content(self.reply.clone()))];
            Ok(futures::stream::iter(items).boxed())
        }
    }

    /// Drafts a hypothetical document under its system prompt and expands
    /// every other request.
    struct DraftingChat {
        draft: String,
        expansion: String,
    }

    #[async_trait]
    impl ChatModel for DraftingChat {
        async fn stream(&self, system: &str, _user: &str) -> Result<ChatStream, SearchError> {
            let reply = if system == crate::expansion::HYPOTHETICAL_SYSTEM_PROMPT {
                self.draft.clone()
            } else {
                self.expansion.clone()
            };
            Ok(futures::stream::iter(vec![Ok(ChatDelta::Content(reply))]).boxed())
        }
    }

    /// Longer candidates score higher.
    struct LengthEncoder;

    #[async_trait]
    impl CrossEncoder for LengthEncoder {
        async fn score(&self, _query: &str, candidate: &str) -> Result<f32, SearchError> {
            Ok(candidate.chars().count() as f32)
        }
    }

    struct OfflineEncoder;

    #[async_trait]
    impl CrossEncoder for OfflineEncoder {
        async fn score(&self, _query: &str, _candidate: &str) -> Result<f32, SearchError> {
            Err(SearchError::unavailable("cross-encoder", "connection refused"))
        }
    }

    fn parts(cross_encoder: Arc<dyn CrossEncoder>) -> ServiceParts {
        let vector = Arc::new(MemoryVectors::new(&[
            ("洪水来临时应当迅速转移到高处并远离河道", "Technology"),
            ("洪水过后注意饮用水安全", "Case"),
            ("地震发生后注意余震", "Technology"),
        ]));
        let chat = Arc::new(CannedChat {
            reply: "1. 洪水如何应对\n4. 洪水".to_string(),
        });
        ServiceParts::new(vector, chat, cross_encoder)
    }

    #[tokio::test]
    async fn evidence_flows_through_expand_retrieve_rerank() {
        let service = KnowledgeService::open(parts(Arc::new(LengthEncoder))).await.unwrap();
        assert_eq!(service.lexical_index().len(), 3);

        let evidence = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::default())
            .await
            .unwrap();

        assert_eq!(evidence.query.keywords, vec!["洪水"]);
        assert_eq!(evidence.results.len(), 2);
        assert_eq!(evidence.results[0].content, "洪水来临时应当迅速转移到高处并远离河道");
        assert!(evidence.results[0].score >= evidence.results[1].score);
    }

    #[tokio::test]
    async fn doc_type_filter_narrows_evidence() {
        let service = KnowledgeService::open(parts(Arc::new(LengthEncoder))).await.unwrap();

        let evidence = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::doc_type("Case"))
            .await
            .unwrap();

        assert_eq!(evidence.results.len(), 1);
        assert_eq!(evidence.results[0].content, "洪水过后注意饮用水安全");
    }

    #[tokio::test]
    async fn hypothetical_hits_lead_the_evidence() {
        let mut parts = parts(Arc::new(LengthEncoder));
        parts.chat = Arc::new(DraftingChat {
            draft: "<think>用户问的是灾后</think>地震".to_string(),
            expansion: "1. 洪水如何应对\n4. 洪水".to_string(),
        });
        parts.options.hypothetical_k = Some(crate::expansion::DEFAULT_HYPOTHETICAL_K);
        let service = KnowledgeService::open(parts).await.unwrap();

        let evidence = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::default())
            .await
            .unwrap();

        assert_eq!(evidence.hypothetical_count, 1);
        let contents: Vec<&str> = evidence
            .results
            .iter()
            .map(|result| result.content.as_str())
            .collect();
        assert_eq!(
            contents,
            vec![
                "地震发生后注意余震",
                "洪水来临时应当迅速转移到高处并远离河道",
                "洪水过后注意饮用水安全",
            ]
        );
    }

    #[tokio::test]
    async fn hypothetical_hits_respect_the_doc_type_filter() {
        let mut parts = parts(Arc::new(LengthEncoder));
        parts.chat = Arc::new(DraftingChat {
            draft: "地震".to_string(),
            expansion: "1. 洪水如何应对\n4. 洪水".to_string(),
        });
        parts.options.hypothetical_k = Some(3);
        let service = KnowledgeService::open(parts).await.unwrap();

        let evidence = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::doc_type("Case"))
            .await
            .unwrap();

        assert_eq!(evidence.hypothetical_count, 0);
        assert_eq!(evidence.results.len(), 1);
        assert_eq!(evidence.results[0].content, "洪水过后注意饮用水安全");
    }

    #[tokio::test]
    async fn default_options_skip_the_hypothetical_draft() {
        let mut parts = parts(Arc::new(LengthEncoder));
        parts.chat = Arc::new(DraftingChat {
            draft: "地震".to_string(),
            expansion: "1. 洪水如何应对\n4. 洪水".to_string(),
        });
        let service = KnowledgeService::open(parts).await.unwrap();

        let evidence = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::default())
            .await
            .unwrap();

        assert_eq!(evidence.hypothetical_count, 0);
        assert!(evidence
            .results
            .iter()
            .all(|result| result.content.starts_with("洪水")));
    }

    #[tokio::test]
    async fn rebuild_picks_up_new_chunks() {
        let vector = Arc::new(MemoryVectors::new(&[]));
        let mut parts = parts(Arc::new(LengthEncoder));
        parts.vector = Arc::clone(&vector) as Arc<dyn VectorIndex>;
        let service = KnowledgeService::open(parts).await.unwrap();
        assert!(service.lexical_index().is_empty());

        let before = service.lexical_index();
        vector
            .upsert_chunks(&[Chunk {
                chunk_id: "c1".to_string(),
                content: "台风预警信号分为四级".to_string(),
                metadata: metadata("Technology"),
            }])
            .await
            .unwrap();
        assert_eq!(service.rebuild_lexical_index().await.unwrap(), 1);

        assert!(before.is_empty());
        assert_eq!(service.lexical_index().len(), 1);
    }

    #[tokio::test]
    async fn collaborator_failures_fail_the_query() {
        let service = KnowledgeService::open(parts(Arc::new(OfflineEncoder))).await.unwrap();
        let error = service
            .retrieve_evidence("洪水怎么办", &QueryFilters::default())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "collaborator_unavailable");
    }

    #[tokio::test]
    async fn blank_queries_are_rejected() {
        let service = KnowledgeService::new(parts(Arc::new(LengthEncoder))).unwrap();
        assert!(matches!(
            service.retrieve_evidence("   ", &QueryFilters::default()).await,
            Err(SearchError::Request(_))
        ));
    }

    #[tokio::test]
    async fn answer_streams_after_evidence() {
        let service = KnowledgeService::open(parts(Arc::new(LengthEncoder))).await.unwrap();
        let (evidence, stream) = service
            .answer("洪水怎么办", &QueryFilters::default(), ReasoningMode::Strip)
            .await
            .unwrap();

        assert!(!evidence.results.is_empty());
        let text = crate::answer::collect_answer(stream).await.unwrap();
        assert!(!text.is_empty());
    }

    #[tokio::test]
    async fn service_cell_initializes_once() {
        let cell = Arc::new(ServiceCell::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                cell.get_or_try_init(|| async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    KnowledgeService::new(parts(Arc::new(LengthEncoder)))
                })
                .await
                .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(cell.get().is_some());
    }

    #[tokio::test]
    async fn failed_initialization_can_be_retried() {
        let cell = ServiceCell::new();
        let failed = cell
            .get_or_try_init(|| async {
                Err(SearchError::unavailable("qdrant", "connection refused"))
            })
            .await;
        assert!(failed.is_err());
        assert!(cell.get().is_none());

        let service = cell
            .get_or_try_init(|| async { KnowledgeService::new(parts(Arc::new(LengthEncoder))) })
            .await;
        assert!(service.is_ok());
    }
}
