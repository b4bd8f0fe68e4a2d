//! DAO and need operations.
//!
//! Every mutation that touches a description re-embeds it before writing,
//! so an entity never carries a stale vector. If the embedding call fails,
//! nothing is written. Successful description changes then re-run matching
//! for the affected needs.

use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{create_embedder, prepare_text, Embedder};
use crate::error::{PollenError, Result};
use crate::matching::{DaoRefresh, MatchingEngine, MatchingPolicy, NeedRefresh};
use crate::models::{
    Dao, DaoChanges, DaoInput, DaoUpdate, Need, NeedChanges, NeedInput, NeedUpdate, NewDao,
    NewNeed, PollenDetail, PollenQuery,
};
use crate::rationale::create_generator;
use crate::similarity::EmbeddingSimilaritySearch;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// A DAO after an update, plus the matching report when the description
/// changed.
#[derive(Debug, Clone, Serialize)]
pub struct DaoUpdated {
    #[serde(flatten)]
    pub dao: Dao,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<DaoRefresh>,
}

/// A need after create or update, plus its matching report when the
/// description was (re)embedded.
#[derive(Debug, Clone, Serialize)]
pub struct NeedSaved {
    #[serde(flatten)]
    pub need: Need,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<NeedRefresh>,
}

pub struct PollinationService {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    engine: MatchingEngine,
}

impl PollinationService {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, engine: MatchingEngine) -> Self {
        Self {
            store,
            embedder,
            engine,
        }
    }

    /// Wire the production stack: SQLite store, configured embedding and
    /// rationale providers, and similarity over stored embeddings.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config).await?);
        let embedder = create_embedder(&config.embedding)?;
        let rationale = create_generator(&config.rationale)?;
        let search = Arc::new(EmbeddingSimilaritySearch::new(store.clone()));
        let engine = MatchingEngine::new(
            store.clone(),
            search,
            rationale,
            MatchingPolicy::from(&config.matching),
        );
        Ok(Self::new(store, embedder, engine))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .embedder
            .embed(&prepare_text(text))
            .await
            .map_err(|e| PollenError::external("embedding", format!("{:#}", e)))?;
        if vector.is_empty() {
            return Err(PollenError::external("embedding", "empty embedding vector"));
        }
        Ok(vector)
    }

    // ============ DAOs ============

    pub async fn create_dao(&self, input: DaoInput) -> Result<Dao> {
        require("name", &input.name)?;
        require("description", &input.description)?;
        require("public_address", &input.public_address)?;

        let description_embedding = self.embed(&input.description).await?;
        let dao = self
            .store
            .insert_dao(&NewDao {
                name: input.name,
                description: input.description,
                public_address: input.public_address,
                description_embedding,
            })
            .await?;
        tracing::info!(dao_id = dao.id, name = %dao.name, "dao created");
        Ok(dao)
    }

    /// Apply `update`. A present `description` is always re-embedded and
    /// triggers a DAO-wide refresh, even when the text is unchanged.
    pub async fn update_dao(&self, id: i64, update: DaoUpdate) -> Result<DaoUpdated> {
        for (field, value) in [
            ("name", &update.name),
            ("description", &update.description),
            ("public_address", &update.public_address),
        ] {
            if let Some(value) = value {
                require(field, value)?;
            }
        }

        let description_embedding = match &update.description {
            Some(description) => Some(self.embed(description).await?),
            None => None,
        };
        let reembedded = description_embedding.is_some();

        let dao = self
            .store
            .update_dao(
                id,
                &DaoChanges {
                    name: update.name,
                    description: update.description,
                    public_address: update.public_address,
                    description_embedding,
                },
            )
            .await?;
        tracing::info!(dao_id = dao.id, reembedded, "dao updated");

        let matching = if reembedded {
            Some(self.engine.refresh_matches_for_dao(dao.id).await?)
        } else {
            None
        };
        Ok(DaoUpdated { dao, matching })
    }

    pub async fn get_dao_by_public_address(&self, address: &str) -> Result<Dao> {
        require("public_address", address)?;
        self.store
            .get_dao_by_public_address(address)
            .await?
            .ok_or_else(|| PollenError::not_found("dao", address))
    }

    // ============ Needs ============

    pub async fn create_need(&self, input: NeedInput) -> Result<NeedSaved> {
        require("description", &input.description)?;
        if self.store.get_dao(input.dao_id).await?.is_none() {
            return Err(PollenError::not_found("dao", input.dao_id));
        }

        let embedding = self.embed(&input.description).await?;
        let need = self
            .store
            .insert_need(&NewNeed {
                dao_id: input.dao_id,
                description: input.description,
                embedding,
            })
            .await?;
        tracing::info!(need_id = need.id, dao_id = need.dao_id, "need created");

        let matching = self.engine.refresh_matches_for_need(need.id).await?;
        Ok(NeedSaved {
            need,
            matching: Some(matching),
        })
    }

    pub async fn update_need(&self, id: i64, update: NeedUpdate) -> Result<NeedSaved> {
        let Some(description) = update.description else {
            let need = self
                .store
                .get_need(id)
                .await?
                .ok_or_else(|| PollenError::not_found("need", id))?;
            return Ok(NeedSaved {
                need,
                matching: None,
            });
        };
        require("description", &description)?;

        let embedding = self.embed(&description).await?;
        let need = self
            .store
            .update_need(
                id,
                &NeedChanges {
                    description: Some(description),
                    embedding: Some(embedding),
                    contract_need_id: None,
                },
            )
            .await?;
        tracing::info!(need_id = need.id, "need updated");

        let matching = self.engine.refresh_matches_for_need(need.id).await?;
        Ok(NeedSaved {
            need,
            matching: Some(matching),
        })
    }

    /// Idempotent: a second call keeps the first `fulfilled_at`.
    pub async fn mark_need_fulfilled(&self, id: i64) -> Result<Need> {
        let need = self.store.mark_need_fulfilled(id).await?;
        tracing::info!(need_id = need.id, "need fulfilled");
        Ok(need)
    }

    pub async fn update_contract_need_id(&self, id: i64, contract_need_id: &str) -> Result<Need> {
        require("contract_need_id", contract_need_id)?;
        let need = self
            .store
            .update_need(
                id,
                &NeedChanges {
                    contract_need_id: Some(contract_need_id.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(need_id = need.id, contract_need_id, "contract need id recorded");
        Ok(need)
    }

    // ============ Pollen ============

    pub async fn query_pollen(&self, query: &PollenQuery) -> Result<Vec<PollenDetail>> {
        list_matches(self.store.as_ref(), query).await
    }
}

/// Read pollen straight from a store. Needs no embedding or rationale
/// provider, so read-only callers can skip [`PollinationService::open`].
pub async fn list_matches(store: &dyn Store, query: &PollenQuery) -> Result<Vec<PollenDetail>> {
    if let Some(min) = query.min_confidence {
        if !min.is_finite() {
            return Err(PollenError::validation("min_confidence must be a number"));
        }
    }
    store.list_pollen(query).await
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PollenError::validation(format!("{} is required", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rationale::{RationaleGenerator, RationaleRequest};
    use crate::similarity::{SimilarityCandidate, SimilaritySearch};
    use crate::models::PollenUpsert;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `[len, 1.0]` and records every text; fails on text containing "boom".
    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.lock().push(text.to_string());
            if text.contains("boom") {
                anyhow::bail!("embedding backend down");
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    /// Records every need id it is asked about and returns nothing.
    struct RecordingSearch {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SimilaritySearch for RecordingSearch {
        async fn find_dao_matches(
            &self,
            need_id: i64,
            _threshold: f64,
        ) -> anyhow::Result<Vec<SimilarityCandidate>> {
            self.seen.lock().push(need_id);
            Ok(Vec::new())
        }
    }

    struct EchoRationale;

    #[async_trait]
    impl RationaleGenerator for EchoRationale {
        async fn generate(&self, request: &RationaleRequest) -> anyhow::Result<String> {
            Ok(format!("{} + {}", request.requesting_name, request.candidate_name))
        }
    }

    struct Harness {
        service: PollinationService,
        embedder: Arc<CountingEmbedder>,
        search: Arc<RecordingSearch>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
        });
        let search = Arc::new(RecordingSearch {
            seen: Mutex::new(Vec::new()),
        });
        let engine = MatchingEngine::new(
            store.clone(),
            search.clone(),
            Arc::new(EchoRationale),
            MatchingPolicy::default(),
        );
        Harness {
            service: PollinationService::new(store, embedder.clone(), engine),
            embedder,
            search,
        }
    }

    fn dao_input(name: &str) -> DaoInput {
        DaoInput {
            name: name.into(),
            description: format!("{} description", name),
            public_address: format!("0x{}", name.to_lowercase()),
        }
    }

    #[tokio::test]
    async fn test_create_dao_validates_and_embeds() {
        let h = harness();
        let err = h
            .service
            .create_dao(DaoInput {
                name: "  ".into(),
                ..dao_input("ClimateDAO")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PollenError::Validation(_)));
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);

        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();
        assert!(dao.description_embedding.is_some());
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
        // Creation does not trigger matching.
        assert!(h.search.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_dao_reembeds_unchanged_description() {
        let h = harness();
        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();

        let updated = h
            .service
            .update_dao(
                dao.id,
                DaoUpdate {
                    description: Some(dao.description.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 2);
        assert!(updated.matching.is_some());

        let renamed = h
            .service
            .update_dao(
                dao.id,
                DaoUpdate {
                    name: Some("ClimateDAO v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.dao.name, "ClimateDAO v2");
        assert!(renamed.matching.is_none());
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_writes_nothing() {
        let h = harness();
        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();

        let err = h
            .service
            .update_dao(
                dao.id,
                DaoUpdate {
                    description: Some("boom".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PollenError::ExternalService {
                service: "embedding",
                ..
            }
        ));
        let stored = h.service.store().get_dao(dao.id).await.unwrap().unwrap();
        assert_eq!(stored.description, dao.description);

        let err = h
            .service
            .create_need(NeedInput {
                dao_id: dao.id,
                description: "boom need".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(h.service.store().need_ids_for_dao(dao.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_need_requires_dao_and_refreshes() {
        let h = harness();
        let err = h
            .service
            .create_need(NeedInput {
                dao_id: 99,
                description: "seeking grant-writing help".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PollenError::NotFound { entity: "dao", .. }));

        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();
        let saved = h
            .service
            .create_need(NeedInput {
                dao_id: dao.id,
                description: "seeking\ngrant-writing help".into(),
            })
            .await
            .unwrap();
        assert_eq!(*h.search.seen.lock(), vec![saved.need.id]);
        assert!(saved.matching.unwrap().pollen.is_empty());
        // Newlines are flattened before the text reaches the provider.
        assert_eq!(
            h.embedder.texts.lock().last().map(String::as_str),
            Some("seeking grant-writing help")
        );
        assert_eq!(saved.need.description, "seeking\ngrant-writing help");
    }

    #[tokio::test]
    async fn test_update_need_without_description_skips_refresh() {
        let h = harness();
        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();
        let saved = h
            .service
            .create_need(NeedInput {
                dao_id: dao.id,
                description: "audit".into(),
            })
            .await
            .unwrap();

        let same = h
            .service
            .update_need(saved.need.id, NeedUpdate::default())
            .await
            .unwrap();
        assert!(same.matching.is_none());
        assert_eq!(h.search.seen.lock().len(), 1);

        let changed = h
            .service
            .update_need(
                saved.need.id,
                NeedUpdate {
                    description: Some("security audit".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.need.description, "security audit");
        assert_eq!(h.search.seen.lock().len(), 2);

        h.service
            .update_need(
                saved.need.id,
                NeedUpdate {
                    description: Some("security\r\naudit".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.embedder.texts.lock().last().map(String::as_str),
            Some("security audit")
        );

        let err = h
            .service
            .update_need(404, NeedUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_fulfill_is_idempotent() {
        let h = harness();
        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();
        let saved = h
            .service
            .create_need(NeedInput {
                dao_id: dao.id,
                description: "audit".into(),
            })
            .await
            .unwrap();

        let first = h.service.mark_need_fulfilled(saved.need.id).await.unwrap();
        assert!(first.is_fulfilled);
        assert!(first.fulfilled_at.is_some());

        let second = h.service.mark_need_fulfilled(saved.need.id).await.unwrap();
        assert!(second.is_fulfilled);
        assert_eq!(second.fulfilled_at, first.fulfilled_at);
    }

    #[tokio::test]
    async fn test_contract_need_id() {
        let h = harness();
        let dao = h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();
        let saved = h
            .service
            .create_need(NeedInput {
                dao_id: dao.id,
                description: "audit".into(),
            })
            .await
            .unwrap();

        assert!(h
            .service
            .update_contract_need_id(saved.need.id, "")
            .await
            .is_err());
        let need = h
            .service
            .update_contract_need_id(saved.need.id, "42")
            .await
            .unwrap();
        assert_eq!(need.contract_need_id.as_deref(), Some("42"));
        assert_eq!(need.description, "audit");
    }

    #[tokio::test]
    async fn test_list_matches_reads_store_without_providers() {
        let store = InMemoryStore::new();
        let climate = store
            .insert_dao(&NewDao {
                name: "ClimateDAO".into(),
                description: "climate action".into(),
                public_address: "0xclimate".into(),
                description_embedding: vec![1.0, 0.0],
            })
            .await
            .unwrap();
        let grant_guild = store
            .insert_dao(&NewDao {
                name: "GrantGuildDAO".into(),
                description: "we write grants".into(),
                public_address: "0xgrants".into(),
                description_embedding: vec![0.0, 1.0],
            })
            .await
            .unwrap();
        let need = store
            .insert_need(&NewNeed {
                dao_id: climate.id,
                description: "seeking grant-writing help".into(),
                embedding: vec![0.0, 1.0],
            })
            .await
            .unwrap();
        store
            .upsert_pollen(&[PollenUpsert {
                need_id: need.id,
                requesting_dao_id: climate.id,
                fulfilling_dao_id: grant_guild.id,
                confidence_score: 0.82,
                collaboration_description: "GrantGuildDAO can help".into(),
            }])
            .await
            .unwrap();

        let rows = list_matches(
            &store,
            &PollenQuery {
                dao_id: Some(grant_guild.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].need.id, need.id);

        let err = list_matches(
            &store,
            &PollenQuery {
                min_confidence: Some(f64::NAN),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PollenError::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_dao_by_public_address() {
        let h = harness();
        h.service.create_dao(dao_input("ClimateDAO")).await.unwrap();

        let dao = h.service.get_dao_by_public_address("0xclimatedao").await.unwrap();
        assert_eq!(dao.name, "ClimateDAO");

        let err = h.service.get_dao_by_public_address("0xnope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
