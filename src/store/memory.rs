//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All tables live behind one `parking_lot::RwLock`, so every operation
//! (including a batch upsert) is atomic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{PollenError, Result};
use crate::models::{
    from_millis, now_millis, Dao, DaoChanges, DaoSummary, Need, NeedChanges, NeedSummary, NewDao,
    NewNeed, Pollen, PollenDetail, PollenQuery, PollenUpsert,
};

use super::{check_pollen_rows, Store};

#[derive(Default)]
struct Tables {
    daos: BTreeMap<i64, Dao>,
    needs: BTreeMap<i64, Need>,
    pollen: BTreeMap<i64, Pollen>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn address_taken(&self, address: &str, except: Option<i64>) -> bool {
        self.daos
            .values()
            .any(|d| d.public_address == address && Some(d.id) != except)
    }
}

pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(dao: &Dao) -> DaoSummary {
    DaoSummary {
        id: dao.id,
        name: dao.name.clone(),
        public_address: dao.public_address.clone(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_dao(&self, dao: &NewDao) -> Result<Dao> {
        let mut t = self.tables.write();
        if t.address_taken(&dao.public_address, None) {
            return Err(PollenError::validation(format!(
                "duplicate record: public_address {} already registered",
                dao.public_address
            )));
        }
        let now = from_millis(now_millis());
        let row = Dao {
            id: t.next_id(),
            name: dao.name.clone(),
            description: dao.description.clone(),
            public_address: dao.public_address.clone(),
            description_embedding: Some(dao.description_embedding.clone()),
            created_at: now,
            updated_at: now,
        };
        t.daos.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_dao(&self, id: i64, changes: &DaoChanges) -> Result<Dao> {
        let mut t = self.tables.write();
        if let Some(address) = &changes.public_address {
            if t.address_taken(address, Some(id)) {
                return Err(PollenError::validation(format!(
                    "duplicate record: public_address {} already registered",
                    address
                )));
            }
        }
        let row = t
            .daos
            .get_mut(&id)
            .ok_or_else(|| PollenError::not_found("dao", id))?;
        if let Some(name) = &changes.name {
            row.name = name.clone();
        }
        if let Some(description) = &changes.description {
            row.description = description.clone();
        }
        if let Some(address) = &changes.public_address {
            row.public_address = address.clone();
        }
        if let Some(embedding) = &changes.description_embedding {
            row.description_embedding = Some(embedding.clone());
        }
        row.updated_at = from_millis(now_millis());
        Ok(row.clone())
    }

    async fn get_dao(&self, id: i64) -> Result<Option<Dao>> {
        Ok(self.tables.read().daos.get(&id).cloned())
    }

    async fn get_dao_by_public_address(&self, address: &str) -> Result<Option<Dao>> {
        Ok(self
            .tables
            .read()
            .daos
            .values()
            .find(|d| d.public_address == address)
            .cloned())
    }

    async fn dao_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        Ok(self
            .tables
            .read()
            .daos
            .values()
            .filter_map(|d| d.description_embedding.clone().map(|e| (d.id, e)))
            .collect())
    }

    async fn insert_need(&self, need: &NewNeed) -> Result<Need> {
        let mut t = self.tables.write();
        if !t.daos.contains_key(&need.dao_id) {
            return Err(PollenError::not_found("dao", need.dao_id));
        }
        let now = from_millis(now_millis());
        let row = Need {
            id: t.next_id(),
            dao_id: need.dao_id,
            description: need.description.clone(),
            embedding: Some(need.embedding.clone()),
            contract_need_id: None,
            is_fulfilled: false,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        };
        t.needs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_need(&self, id: i64, changes: &NeedChanges) -> Result<Need> {
        let mut t = self.tables.write();
        let row = t
            .needs
            .get_mut(&id)
            .ok_or_else(|| PollenError::not_found("need", id))?;
        if let Some(description) = &changes.description {
            row.description = description.clone();
        }
        if let Some(embedding) = &changes.embedding {
            row.embedding = Some(embedding.clone());
        }
        if let Some(contract_need_id) = &changes.contract_need_id {
            row.contract_need_id = Some(contract_need_id.clone());
        }
        row.updated_at = from_millis(now_millis());
        Ok(row.clone())
    }

    async fn get_need(&self, id: i64) -> Result<Option<Need>> {
        Ok(self.tables.read().needs.get(&id).cloned())
    }

    async fn mark_need_fulfilled(&self, id: i64) -> Result<Need> {
        let mut t = self.tables.write();
        let row = t
            .needs
            .get_mut(&id)
            .ok_or_else(|| PollenError::not_found("need", id))?;
        let now = from_millis(now_millis());
        row.is_fulfilled = true;
        row.fulfilled_at.get_or_insert(now);
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn need_ids_for_dao(&self, dao_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .tables
            .read()
            .needs
            .values()
            .filter(|n| n.dao_id == dao_id)
            .map(|n| n.id)
            .collect())
    }

    async fn need_ids_fulfilled_by(&self, dao_id: i64) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .tables
            .read()
            .pollen
            .values()
            .filter(|p| p.fulfilling_dao_id == dao_id)
            .map(|p| p.need_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_pollen(&self, rows: &[PollenUpsert]) -> Result<()> {
        check_pollen_rows(rows)?;
        let mut t = self.tables.write();
        for row in rows {
            if !t.needs.contains_key(&row.need_id) {
                return Err(PollenError::not_found("need", row.need_id));
            }
        }
        let now = from_millis(now_millis());
        for row in rows {
            let existing = t
                .pollen
                .values()
                .find(|p| p.need_id == row.need_id && p.fulfilling_dao_id == row.fulfilling_dao_id)
                .map(|p| p.id);
            match existing.and_then(|id| t.pollen.get_mut(&id)) {
                Some(p) => {
                    p.requesting_dao_id = row.requesting_dao_id;
                    p.collaboration_description = row.collaboration_description.clone();
                    p.confidence_score = row.confidence_score;
                    p.updated_at = now;
                }
                None => {
                    let id = t.next_id();
                    t.pollen.insert(
                        id,
                        Pollen {
                            id,
                            need_id: row.need_id,
                            requesting_dao_id: row.requesting_dao_id,
                            fulfilling_dao_id: row.fulfilling_dao_id,
                            collaboration_description: row.collaboration_description.clone(),
                            confidence_score: row.confidence_score,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete_pollen_except(&self, need_id: i64, keep: &[i64]) -> Result<u64> {
        let mut t = self.tables.write();
        let before = t.pollen.len();
        t.pollen
            .retain(|_, p| p.need_id != need_id || keep.contains(&p.fulfilling_dao_id));
        Ok((before - t.pollen.len()) as u64)
    }

    async fn list_pollen(&self, query: &PollenQuery) -> Result<Vec<PollenDetail>> {
        let t = self.tables.read();
        let mut details: Vec<PollenDetail> = t
            .pollen
            .values()
            .filter(|p| query.matches(p))
            .filter_map(|p| {
                let requesting = t.daos.get(&p.requesting_dao_id)?;
                let fulfilling = t.daos.get(&p.fulfilling_dao_id)?;
                let need = t.needs.get(&p.need_id)?;
                Some(PollenDetail {
                    pollen: p.clone(),
                    requesting_dao: summarize(requesting),
                    fulfilling_dao: summarize(fulfilling),
                    need: NeedSummary {
                        id: need.id,
                        description: need.description.clone(),
                        is_fulfilled: need.is_fulfilled,
                    },
                })
            })
            .collect();
        details.sort_by(|a, b| {
            b.pollen
                .confidence_score
                .partial_cmp(&a.pollen.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pollen.id.cmp(&b.pollen.id))
        });
        Ok(details)
    }
}
