//! Candidate discovery for a need.
//!
//! [`SimilaritySearch`] is the black-box "find DAOs whose description is
//! close to this need" capability. [`EmbeddingSimilaritySearch`] answers it
//! from the stored vectors: cosine similarity between the need's embedding
//! and every DAO description embedding, computed in Rust the same way the
//! brute-force vector search over stored BLOBs works.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::embedding::cosine_similarity;
use crate::store::Store;

/// One DAO that might fulfill a need.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityCandidate {
    pub dao_id: i64,
    /// In `[0, 1]`; copied verbatim into `confidence_score`.
    pub similarity: f64,
}

/// Returns candidates with `similarity > threshold`. No ordering is
/// guaranteed.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn find_dao_matches(
        &self,
        need_id: i64,
        similarity_threshold: f64,
    ) -> Result<Vec<SimilarityCandidate>>;
}

pub struct EmbeddingSimilaritySearch {
    store: Arc<dyn Store>,
}

impl EmbeddingSimilaritySearch {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SimilaritySearch for EmbeddingSimilaritySearch {
    async fn find_dao_matches(
        &self,
        need_id: i64,
        similarity_threshold: f64,
    ) -> Result<Vec<SimilarityCandidate>> {
        let need = self
            .store
            .get_need(need_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("need not found: {}", need_id))?;

        let Some(need_vec) = need.embedding.filter(|v| !v.is_empty()) else {
            tracing::debug!(need_id, "need has no embedding; no candidates");
            return Ok(Vec::new());
        };

        let candidates = self
            .store
            .dao_embeddings()
            .await?
            .into_iter()
            .filter(|(dao_id, _)| *dao_id != need.dao_id)
            .filter_map(|(dao_id, dao_vec)| {
                let similarity = cosine_similarity(&need_vec, &dao_vec) as f64;
                (similarity > similarity_threshold).then_some(SimilarityCandidate {
                    dao_id,
                    similarity: similarity.min(1.0),
                })
            })
            .collect();

        Ok(candidates)
    }
}
