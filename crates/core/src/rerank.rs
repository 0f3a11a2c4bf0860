use crate::embeddings::join_endpoint;
use crate::traits::CrossEncoder;
use crate::{RerankedResult, SearchError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use url::Url;

pub const DEFAULT_RERANK_TOP_K: usize = 5;

/// Orders candidates by cross-encoder relevance to the original query.
pub struct Reranker<C: CrossEncoder> {
    encoder: C,
    top_k: usize,
}

impl<C: CrossEncoder> Reranker<C> {
    pub fn new(encoder: C) -> Self {
        Self::with_top_k(encoder, DEFAULT_RERANK_TOP_K)
    }

    pub fn with_top_k(encoder: C, top_k: usize) -> Self {
        Self { encoder, top_k }
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<RerankedResult>, SearchError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.encoder.score_batch(query, candidates).await?;
        if scores.len() != candidates.len() {
            return Err(SearchError::BackendResponse {
                backend: "cross-encoder".to_string(),
                details: format!("{} scores for {} candidates", scores.len(), candidates.len()),
            });
        }

        Ok(top_by_score(candidates, &scores, self.top_k))
    }
}

/// Stable descending sort; NaN scores sink to the bottom.
fn top_by_score(candidates: &[String], scores: &[f32], top_k: usize) -> Vec<RerankedResult> {
    let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|left, right| match (left.1.is_nan(), right.1.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => right.1.total_cmp(&left.1),
    });

    ranked
        .into_iter()
        .take(top_k)
        .map(|(position, score)| RerankedResult {
            content: candidates[position].clone(),
            score,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RerankResponse {
    Wrapped { results: Vec<RerankItem> },
    Bare(Vec<RerankItem>),
}

impl RerankResponse {
    fn into_scores(self, expected: usize) -> Result<Vec<f32>, SearchError> {
        let items = match self {
            RerankResponse::Wrapped { results } => results,
            RerankResponse::Bare(items) => items,
        };

        let mut scores = vec![None; expected];
        for item in items {
            let slot = scores.get_mut(item.index).ok_or_else(|| SearchError::BackendResponse {
                backend: "cross-encoder".to_string(),
                details: format!("index {} out of range for {expected} documents", item.index),
            })?;
            *slot = Some(item.relevance_score);
        }

        scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| {
                score.ok_or_else(|| SearchError::BackendResponse {
                    backend: "cross-encoder".to_string(),
                    details: format!("no score returned for document {index}"),
                })
            })
            .collect()
    }
}

/// Client for a `/rerank` endpoint (TEI, Infinity, vLLM and similar servers).
pub struct HttpCrossEncoder {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl HttpCrossEncoder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, SearchError> {
        Ok(Self {
            client: Client::new(),
            endpoint: join_endpoint(base_url, "rerank")?,
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score(&self, query: &str, candidate: &str) -> Result<f32, SearchError> {
        let mut scores = self.score_batch(query, &[candidate.to_string()]).await?;
        scores
            .pop()
            .ok_or_else(|| SearchError::unavailable("cross-encoder", "empty rerank response"))
    }

    async fn score_batch(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f32>, SearchError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(self.endpoint.clone()).json(&RerankRequest {
            model: &self.model,
            query,
            documents: candidates,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| SearchError::unavailable("cross-encoder", error))?;
        if !response.status().is_success() {
            return Err(SearchError::unavailable(
                "cross-encoder",
                format!("{} returned {}", self.endpoint, response.status()),
            ));
        }

        let payload: RerankResponse = response.json().await?;
        payload.into_scores(candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TableEncoder {
        scores: HashMap<String, f32>,
    }

    #[async_trait]
    impl CrossEncoder for TableEncoder {
        async fn score(&self, _query: &str, candidate: &str) -> Result<f32, SearchError> {
            Ok(self.scores.get(candidate).copied().unwrap_or(0.0))
        }
    }

    struct DownEncoder;

    #[async_trait]
    impl CrossEncoder for DownEncoder {
        async fn score(&self, _query: &str, _candidate: &str) -> Result<f32, SearchError> {
            Err(SearchError::unavailable("cross-encoder", "connection refused"))
        }
    }

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn results_are_sorted_descending_and_capped() {
        let encoder = TableEncoder {
            scores: [("a", 0.1), ("b", 0.9), ("c", -2.0), ("d", 0.5), ("e", 3.0), ("f", 0.2)]
                .into_iter()
                .map(|(name, score)| (name.to_string(), score))
                .collect(),
        };
        let reranker = Reranker::new(encoder);

        let results = reranker
            .rerank("q", &candidates(&["a", "b", "c", "d", "e", "f"]))
            .await
            .unwrap();

        let order: Vec<&str> = results.iter().map(|result| result.content.as_str()).collect();
        assert_eq!(order, vec!["e", "b", "d", "f", "a"]);
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[tokio::test]
    async fn ties_keep_candidate_order_and_short_lists_survive() {
        let reranker = Reranker::new(TableEncoder {
            scores: HashMap::new(),
        });

        let results = reranker.rerank("q", &candidates(&["x", "y", "z"])).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "x");
        assert_eq!(results[2].content, "z");
    }

    #[tokio::test]
    async fn encoder_failures_fail_the_query() {
        let error = Reranker::new(DownEncoder)
            .rerank("q", &candidates(&["x"]))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "collaborator_unavailable");
    }

    #[test]
    fn nan_scores_rank_last() {
        let ranked = top_by_score(&candidates(&["nan", "low", "high"]), &[f32::NAN, 0.1, 0.7], 5);
        let order: Vec<&str> = ranked.iter().map(|result| result.content.as_str()).collect();
        assert_eq!(order, vec!["high", "low", "nan"]);
    }

    #[test]
    fn rerank_payloads_are_mapped_back_by_index() {
        let wrapped: RerankResponse = serde_json::from_str(
            r#"{"results":[{"index":1,"relevance_score":0.8},{"index":0,"relevance_score":0.1}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.into_scores(2).unwrap(), vec![0.1, 0.8]);

        let bare: RerankResponse =
            serde_json::from_str(r#"[{"index":0,"score":2.5}]"#).unwrap();
        assert_eq!(bare.into_scores(1).unwrap(), vec![2.5]);

        let missing: RerankResponse =
            serde_json::from_str(r#"[{"index":0,"score":2.5}]"#).unwrap();
        assert!(missing.into_scores(2).is_err());
    }
}
