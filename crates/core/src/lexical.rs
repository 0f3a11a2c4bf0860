use crate::quality::is_cjk_ideograph;
use crate::traits::KeywordIndex;
use crate::{
    ChunkMetadata, QueryFilters, RetrievalCandidate, RetrievalOptions, RetrievalRoute,
    SearchError,
};
use async_trait::async_trait;
use jieba_rs::Jieba;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Chinese word segmentation with latin tokens lower-cased. Tokens without any
/// letter, digit or ideograph are dropped.
pub struct JiebaTokenizer {
    jieba: Jieba,
}

impl Default for JiebaTokenizer {
    fn default() -> Self {
        Self {
            jieba: Jieba::new(),
        }
    }
}

impl Tokenizer for JiebaTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        self.jieba
            .cut(text, true)
            .into_iter()
            .map(str::trim)
            .filter(|token| {
                token
                    .chars()
                    .any(|ch| ch.is_alphanumeric() || is_cjk_ideograph(ch))
            })
            .map(str::to_lowercase)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
struct LexicalEntry {
    length: usize,
    term_freqs: HashMap<String, u32>,
    content: String,
    metadata: ChunkMetadata,
}

/// Okapi BM25 over a tokenized corpus snapshot. Immutable once built.
pub struct LexicalIndex {
    entries: Vec<LexicalEntry>,
    idf: HashMap<String, f64>,
    average_length: f64,
    params: Bm25Params,
    tokenizer: Arc<dyn Tokenizer>,
}

impl LexicalIndex {
    pub fn build(corpus: Vec<(String, ChunkMetadata)>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self::build_with(corpus, tokenizer, Bm25Params::default())
    }

    pub fn build_with(
        corpus: Vec<(String, ChunkMetadata)>,
        tokenizer: Arc<dyn Tokenizer>,
        params: Bm25Params,
    ) -> Self {
        let mut document_freqs: HashMap<String, usize> = HashMap::new();
        let mut entries = Vec::with_capacity(corpus.len());
        let mut total_length = 0usize;

        for (content, metadata) in corpus {
            let tokens = tokenizer.tokenize(&content);
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_default() += 1;
            }
            for term in term_freqs.keys() {
                *document_freqs.entry(term.clone()).or_default() += 1;
            }
            total_length += tokens.len();
            entries.push(LexicalEntry {
                length: tokens.len(),
                term_freqs,
                content,
                metadata,
            });
        }

        let corpus_size = entries.len() as f64;
        let average_length = if entries.is_empty() {
            0.0
        } else {
            total_length as f64 / corpus_size
        };

        let mut idf: HashMap<String, f64> = document_freqs
            .into_iter()
            .map(|(term, freq)| {
                let freq = freq as f64;
                (term, (corpus_size - freq + 0.5).ln() - (freq + 0.5).ln())
            })
            .collect();

        if !idf.is_empty() {
            let mean = idf.values().sum::<f64>() / idf.len() as f64;
            let floor = params.epsilon * mean;
            for value in idf.values_mut() {
                if *value < 0.0 {
                    *value = floor;
                }
            }
        }

        Self {
            entries,
            idf,
            average_length,
            params,
            tokenizer,
        }
    }

    pub fn empty(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self::build(Vec::new(), tokenizer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn score_entry(&self, entry: &LexicalEntry, query_tokens: &[String]) -> f64 {
        let Bm25Params { k1, b, .. } = self.params;
        let length_ratio = if self.average_length > 0.0 {
            entry.length as f64 / self.average_length
        } else {
            0.0
        };

        query_tokens
            .iter()
            .map(|token| {
                let freq = f64::from(entry.term_freqs.get(token).copied().unwrap_or(0));
                let idf = self.idf.get(token).copied().unwrap_or(0.0);
                idf * (freq * (k1 + 1.0)) / (freq + k1 * (1.0 - b + b * length_ratio))
            })
            .sum()
    }

    /// Positions and scores of the `n` best entries sharing at least one term
    /// with the query, best first; ties keep corpus order.
    pub fn top_n(&self, query: &str, n: usize) -> Vec<(usize, f64)> {
        let query_tokens = self.tokenizer.tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                query_tokens
                    .iter()
                    .any(|token| entry.term_freqs.contains_key(token))
            })
            .map(|(position, entry)| (position, self.score_entry(entry, &query_tokens)))
            .collect();

        scored.sort_by(|left, right| right.1.total_cmp(&left.1));
        scored.truncate(n);
        scored
    }

    /// Top `pool` hits by score, then the first `keep` whose docType passes.
    pub fn search(
        &self,
        query: &str,
        filters: &QueryFilters,
        pool: usize,
        keep: usize,
    ) -> Vec<RetrievalCandidate> {
        self.top_n(query, pool)
            .into_iter()
            .filter_map(|(position, score)| {
                let entry = &self.entries[position];
                filters.matches(&entry.metadata).then(|| RetrievalCandidate {
                    content: entry.content.clone(),
                    metadata: entry.metadata.clone(),
                    route: RetrievalRoute::Lexical,
                    score,
                })
            })
            .take(keep)
            .collect()
    }
}

#[async_trait]
impl KeywordIndex for LexicalIndex {
    async fn search_keyword(
        &self,
        query: &str,
        filters: &QueryFilters,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        Ok(self.search(query, filters, options.lexical_pool, options.lexical_keep))
    }
}

/// Holds the current index generation. Readers take a snapshot; a rebuild
/// swaps in a new generation without touching the one in use.
pub struct LexicalIndexCell {
    current: RwLock<Arc<LexicalIndex>>,
}

impl LexicalIndexCell {
    pub fn new(index: LexicalIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    pub fn snapshot(&self) -> Arc<LexicalIndex> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Installs `index` and returns the previous generation.
    pub fn swap(&self, index: LexicalIndex) -> Arc<LexicalIndex> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(index))
    }
}

#[async_trait]
impl KeywordIndex for LexicalIndexCell {
    async fn search_keyword(
        &self,
        query: &str,
        filters: &QueryFilters,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        let index = self.snapshot();
        index.search_keyword(query, filters, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkKind;

    fn metadata(doc_type: &str) -> ChunkMetadata {
        ChunkMetadata {
            source: format!("{doc_type}/doc.txt"),
            doc_type: doc_type.to_string(),
            kind: ChunkKind::Text {
                chunk_index: 1,
                length: 10,
            },
        }
    }

    fn corpus() -> Vec<(String, ChunkMetadata)> {
        vec![
            ("洪水来临时应当迅速转移到高处".to_string(), metadata("Technology")),
            ("地震发生后注意余震并远离建筑物".to_string(), metadata("Technology")),
            ("火灾逃生时用湿毛巾捂住口鼻".to_string(), metadata("Case")),
            ("洪水过后注意饮用水安全".to_string(), metadata("Case")),
        ]
    }

    fn index() -> LexicalIndex {
        LexicalIndex::build(corpus(), Arc::new(JiebaTokenizer::default()))
    }

    #[test]
    fn tokenizer_drops_punctuation_and_lowercases() {
        let tokens = JiebaTokenizer::default().tokenize("BM25 检索，很好！");
        assert!(tokens.contains(&"bm25".to_string()));
        assert!(tokens.iter().all(|token| token != "，" && token != "！"));
    }

    #[test]
    fn matching_entries_rank_above_unrelated_ones() {
        let index = index();
        let hits = index.top_n("地震 余震", 10);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn unmatched_queries_return_nothing() {
        assert!(index().top_n("量子计算", 10).is_empty());
        assert!(index().top_n("，。", 10).is_empty());
    }

    #[test]
    fn doc_type_filter_applies_after_the_pool() {
        let index = index();
        let all = index.search("洪水", &QueryFilters::default(), 10, 5);
        assert_eq!(all.len(), 2);

        let technology = index.search("洪水", &QueryFilters::doc_type("Technology"), 10, 5);
        assert_eq!(technology.len(), 1);
        assert_eq!(technology[0].content, "洪水来临时应当迅速转移到高处");
        assert_eq!(technology[0].route, RetrievalRoute::Lexical);

        let narrow_pool = index.search("洪水", &QueryFilters::doc_type("Case"), 1, 5);
        assert!(narrow_pool.len() <= 1);
    }

    #[test]
    fn swapping_keeps_existing_snapshots_alive() {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(JiebaTokenizer::default());
        let cell = LexicalIndexCell::new(LexicalIndex::empty(Arc::clone(&tokenizer)));
        let before = cell.snapshot();

        let old = cell.swap(LexicalIndex::build(corpus(), tokenizer));

        assert!(before.is_empty());
        assert!(old.is_empty());
        assert_eq!(cell.snapshot().len(), 4);
    }
}
