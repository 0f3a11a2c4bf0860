use crate::traits::{KeywordIndex, VectorIndex};
use crate::{
    ExpandedQuerySet, QueryFilters, RetrievalCandidate, RetrievalOptions, RetrievalRoute,
    SearchError,
};
use futures::future::try_join_all;
use std::collections::HashSet;

/// Runs every seed of an expanded query against both indexes and merges the
/// hits into one candidate list.
pub struct HybridRetriever<K, V>
where
    K: KeywordIndex,
    V: VectorIndex,
{
    keyword: K,
    vector: V,
    options: RetrievalOptions,
}

impl<K, V> HybridRetriever<K, V>
where
    K: KeywordIndex,
    V: VectorIndex,
{
    pub fn new(keyword: K, vector: V, options: RetrievalOptions) -> Self {
        Self {
            keyword,
            vector,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// Lexical then vector candidates for one seed.
    pub async fn retrieve_seed(
        &self,
        seed: &str,
        filters: &QueryFilters,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        let (mut lexical, vector_hits) = tokio::try_join!(
            self.keyword.search_keyword(seed, filters, &self.options),
            self.vector.query(seed, self.options.vector_k, filters)
        )?;

        lexical.extend(vector_hits.into_iter().map(|hit| RetrievalCandidate {
            content: hit.content,
            metadata: hit.metadata,
            route: RetrievalRoute::Vector,
            score: hit.score,
        }));
        Ok(lexical)
    }

    pub async fn retrieve(
        &self,
        expanded: &ExpandedQuerySet,
        filters: &QueryFilters,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        let seeds = expanded.seeds();
        let per_seed = try_join_all(
            seeds
                .iter()
                .filter(|seed| !seed.trim().is_empty())
                .map(|seed| self.retrieve_seed(seed, filters)),
        )
        .await?;

        let gathered: Vec<RetrievalCandidate> = per_seed.into_iter().flatten().collect();
        let gathered_count = gathered.len();
        let candidates = dedup_candidates(gathered);

        tracing::debug!(
            seeds = seeds.len(),
            gathered = gathered_count,
            unique = candidates.len(),
            "hybrid retrieval finished"
        );
        Ok(candidates)
    }
}

/// Drops candidates whose content was already seen; first occurrence wins.
pub fn dedup_candidates(candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.content.clone()))
        .collect()
}
