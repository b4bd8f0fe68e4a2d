//! Pollen matching engine.
//!
//! Given a need, the engine asks the [`SimilaritySearch`] for DAOs whose
//! descriptions are close to it, asks the [`RationaleGenerator`] how each
//! pair could collaborate, and upserts one pollen row per
//! `(need_id, fulfilling_dao_id)`.
//!
//! ```text
//!   need ──▶ similarity search ──▶ candidates (> threshold, not self)
//!                                        │ fan-out (buffer_unordered)
//!                                        ▼
//!                          load DAO + rationale (or fallback)
//!                                        │ fan-in
//!                                        ▼
//!                      batch upsert ──▶ read back enriched rows
//! ```
//!
//! Refreshes of the same need are serialized; different needs proceed
//! independently. Every capability call is bounded by
//! [`MatchingPolicy::call_timeout`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::config::{FailurePolicy, MatchingConfig};
use crate::error::{PollenError, Result};
use crate::models::{Dao, Need, PollenDetail, PollenQuery, PollenUpsert};
use crate::rationale::{fallback_rationale, RationaleGenerator, RationaleRequest};
use crate::similarity::{SimilarityCandidate, SimilaritySearch};
use crate::store::Store;

/// Minimum similarity for a DAO to be proposed. Candidates at or below it
/// are dropped.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct MatchingPolicy {
    pub similarity_threshold: f64,
    pub failure_policy: FailurePolicy,
    /// Maximum candidates enriched at once.
    pub concurrency: usize,
    /// Delete rows for DAOs that are no longer candidates.
    pub prune_stale: bool,
    pub call_timeout: Duration,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            failure_policy: FailurePolicy::Continue,
            concurrency: 4,
            prune_stale: false,
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&MatchingConfig> for MatchingPolicy {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            failure_policy: config.failure_policy,
            concurrency: config.concurrency.max(1),
            prune_stale: config.prune_stale,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateFailure {
    pub dao_id: i64,
    pub error: String,
}

/// Outcome of refreshing one need.
#[derive(Debug, Clone, Serialize)]
pub struct NeedRefresh {
    pub need_id: i64,
    /// Every pollen row for the need after the refresh, highest confidence first.
    pub pollen: Vec<PollenDetail>,
    pub failures: Vec<CandidateFailure>,
    pub pruned: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeedFailure {
    pub need_id: i64,
    pub error: String,
}

/// Outcome of refreshing every need touched by a DAO.
#[derive(Debug, Clone, Serialize)]
pub struct DaoRefresh {
    pub dao_id: i64,
    pub refreshed: Vec<NeedRefresh>,
    pub failures: Vec<NeedFailure>,
}

pub struct MatchingEngine {
    store: Arc<dyn Store>,
    search: Arc<dyn SimilaritySearch>,
    rationale: Arc<dyn RationaleGenerator>,
    policy: MatchingPolicy,
    in_flight: NeedLocks,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        search: Arc<dyn SimilaritySearch>,
        rationale: Arc<dyn RationaleGenerator>,
        policy: MatchingPolicy,
    ) -> Self {
        Self {
            store,
            search,
            rationale,
            policy,
            in_flight: NeedLocks::default(),
        }
    }

    pub fn policy(&self) -> &MatchingPolicy {
        &self.policy
    }

    /// Number of need ids with a refresh running or waiting.
    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Recompute pollen for one need and return its up-to-date rows.
    pub async fn refresh_matches_for_need(&self, need_id: i64) -> Result<NeedRefresh> {
        let _guard = self.in_flight.acquire(need_id).await;
        self.refresh_need_locked(need_id).await
    }

    async fn refresh_need_locked(&self, need_id: i64) -> Result<NeedRefresh> {
        let need = self
            .store
            .get_need(need_id)
            .await?
            .ok_or_else(|| PollenError::not_found("need", need_id))?;
        let requesting = self
            .store
            .get_dao(need.dao_id)
            .await?
            .ok_or_else(|| PollenError::not_found("dao", need.dao_id))?;

        let threshold = self.policy.similarity_threshold;
        let found = self
            .bounded(
                "similarity search",
                self.search.find_dao_matches(need_id, threshold),
            )
            .await?;
        let candidates = select_candidates(found, requesting.id, threshold);
        tracing::info!(need_id, candidates = candidates.len(), "refreshing pollen");

        let (need, requesting) = (&need, &requesting);
        let mut outcomes = std::pin::pin!(stream::iter(candidates.iter().copied())
            .map(|candidate| async move {
                let outcome = self.enrich(need, requesting, candidate).await;
                (candidate, outcome)
            })
            .buffer_unordered(self.policy.concurrency.max(1)));

        let mut rows = Vec::with_capacity(candidates.len());
        let mut failures = Vec::new();
        while let Some((candidate, outcome)) = outcomes.next().await {
            match outcome {
                Ok(row) => rows.push(row),
                // Returning drops the stream, cancelling enrichment still in flight.
                Err(err) if self.policy.failure_policy == FailurePolicy::FailFast => {
                    tracing::warn!(need_id, dao_id = candidate.dao_id, %err, "candidate failed; aborting refresh");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(need_id, dao_id = candidate.dao_id, %err, "candidate failed; skipping");
                    failures.push(CandidateFailure {
                        dao_id: candidate.dao_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        rows.sort_by_key(|row| row.fulfilling_dao_id);

        if !rows.is_empty() {
            self.store.upsert_pollen(&rows).await?;
        }

        let pruned = if self.policy.prune_stale {
            let keep: Vec<i64> = candidates.iter().map(|c| c.dao_id).collect();
            let pruned = self.store.delete_pollen_except(need_id, &keep).await?;
            if pruned > 0 {
                tracing::warn!(need_id, pruned, "pruned stale pollen");
            }
            pruned
        } else {
            0
        };

        let pollen = self
            .store
            .list_pollen(&PollenQuery {
                need_id: Some(need_id),
                ..Default::default()
            })
            .await?;

        tracing::info!(
            need_id,
            upserted = rows.len(),
            failed = failures.len(),
            total = pollen.len(),
            "pollen refreshed"
        );

        Ok(NeedRefresh {
            need_id,
            pollen,
            failures,
            pruned,
        })
    }

    /// Resolve the candidate DAO and produce the row to upsert.
    async fn enrich(
        &self,
        need: &Need,
        requesting: &Dao,
        candidate: SimilarityCandidate,
    ) -> Result<PollenUpsert> {
        let fulfilling = self
            .store
            .get_dao(candidate.dao_id)
            .await?
            .ok_or_else(|| PollenError::not_found("dao", candidate.dao_id))?;

        let request = RationaleRequest {
            need_description: need.description.clone(),
            requesting_name: requesting.name.clone(),
            candidate_description: fulfilling.description.clone(),
            candidate_name: fulfilling.name.clone(),
        };

        let collaboration_description =
            match self.bounded("rationale", self.rationale.generate(&request)).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                Ok(_) => {
                    tracing::warn!(need_id = need.id, dao_id = fulfilling.id, "empty rationale; using fallback");
                    fallback_rationale(&requesting.name, &fulfilling.name)
                }
                Err(err) => {
                    tracing::warn!(need_id = need.id, dao_id = fulfilling.id, %err, "rationale failed; using fallback");
                    fallback_rationale(&requesting.name, &fulfilling.name)
                }
            };

        Ok(PollenUpsert {
            need_id: need.id,
            requesting_dao_id: requesting.id,
            fulfilling_dao_id: fulfilling.id,
            collaboration_description,
            confidence_score: candidate.similarity,
        })
    }

    /// Recompute pollen for every need this DAO owns or currently fulfills.
    pub async fn refresh_matches_for_dao(&self, dao_id: i64) -> Result<DaoRefresh> {
        if self.store.get_dao(dao_id).await?.is_none() {
            return Err(PollenError::not_found("dao", dao_id));
        }

        let mut need_ids: BTreeSet<i64> = self
            .store
            .need_ids_fulfilled_by(dao_id)
            .await?
            .into_iter()
            .collect();
        need_ids.extend(self.store.need_ids_for_dao(dao_id).await?);
        tracing::info!(dao_id, needs = need_ids.len(), "refreshing pollen for dao");

        let mut refreshed = Vec::with_capacity(need_ids.len());
        let mut failures = Vec::new();
        for need_id in need_ids {
            match self.refresh_matches_for_need(need_id).await {
                Ok(report) => refreshed.push(report),
                Err(err) if self.policy.failure_policy == FailurePolicy::FailFast => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(dao_id, need_id, %err, "need refresh failed; continuing");
                    failures.push(NeedFailure {
                        need_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(DaoRefresh {
            dao_id,
            refreshed,
            failures,
        })
    }

    async fn bounded<T>(
        &self,
        service: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PollenError::external(service, format!("{:#}", err))),
            Err(_) => Err(PollenError::external(
                service,
                format!("timed out after {:?}", self.policy.call_timeout),
            )),
        }
    }
}

/// Drop candidates at or below the threshold and self-matches, and collapse
/// duplicate DAO ids to their highest similarity. The result is ordered by
/// DAO id.
fn select_candidates(
    found: Vec<SimilarityCandidate>,
    requesting_dao_id: i64,
    threshold: f64,
) -> Vec<SimilarityCandidate> {
    let mut best: HashMap<i64, SimilarityCandidate> = HashMap::new();
    for candidate in found {
        if candidate.dao_id == requesting_dao_id {
            tracing::debug!(dao_id = candidate.dao_id, "skipping self-match");
            continue;
        }
        if !(candidate.similarity > threshold) {
            tracing::debug!(
                dao_id = candidate.dao_id,
                similarity = candidate.similarity,
                "skipping candidate at or below threshold"
            );
            continue;
        }
        best.entry(candidate.dao_id)
            .and_modify(|existing| {
                tracing::debug!(dao_id = candidate.dao_id, "collapsing duplicate candidate");
                if candidate.similarity > existing.similarity {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }
    let mut selected: Vec<SimilarityCandidate> = best.into_values().collect();
    selected.sort_by_key(|c| c.dao_id);
    selected
}

// ============ Per-need single flight ============

/// One async mutex per need id. Entries are removed once nobody holds or
/// waits on them.
#[derive(Default)]
struct NeedLocks {
    locks: parking_lot::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// A caller's claim on a need's lock entry, held from before the wait until
/// the refresh finishes. Dropping it in either phase cleans up the entry.
struct NeedSlot<'a> {
    locks: &'a NeedLocks,
    need_id: i64,
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

struct NeedGuard<'a> {
    // Field order matters: the mutex is released before the slot checks
    // whether anyone else still refers to the entry.
    _held: OwnedMutexGuard<()>,
    _slot: NeedSlot<'a>,
}

impl NeedLocks {
    async fn acquire(&self, need_id: i64) -> NeedGuard<'_> {
        let slot = self.register(need_id);
        let lock = slot.lock.clone().unwrap_or_default();
        let held = lock.lock_owned().await;
        NeedGuard {
            _held: held,
            _slot: slot,
        }
    }

    fn register(&self, need_id: i64) -> NeedSlot<'_> {
        let lock = self.locks.lock().entry(need_id).or_default().clone();
        NeedSlot {
            locks: self,
            need_id,
            lock: Some(lock),
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for NeedSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock();
        drop(self.lock.take());
        // Only the map's reference is left: nobody holds or awaits this need.
        if locks
            .get(&self.need_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.need_id);
        }
    }
}
