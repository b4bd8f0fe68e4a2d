//! Storage abstraction for DAOs, needs, and pollen.
//!
//! The [`Store`] trait defines every read and write the matching engine and
//! the DAO/need operations perform, so the engine can run against SQLite in
//! production and against [`memory::InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::{PollenError, Result};
use crate::models::{
    Dao, DaoChanges, Need, NeedChanges, NewDao, NewNeed, PollenDetail, PollenQuery, PollenUpsert,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_dao`](Store::insert_dao) | Register a DAO (unique public address) |
/// | [`update_dao`](Store::update_dao) | Apply partial DAO changes |
/// | [`dao_embeddings`](Store::dao_embeddings) | All DAO description vectors |
/// | [`insert_need`](Store::insert_need) | Post a need for a DAO |
/// | [`mark_need_fulfilled`](Store::mark_need_fulfilled) | Monotonic fulfillment |
/// | [`upsert_pollen`](Store::upsert_pollen) | Batch upsert keyed on `(need_id, fulfilling_dao_id)` |
/// | [`delete_pollen_except`](Store::delete_pollen_except) | Drop rows outside a keep-set |
/// | [`list_pollen`](Store::list_pollen) | Enriched pollen, highest confidence first |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a DAO. A duplicate `public_address` is a validation error.
    async fn insert_dao(&self, dao: &NewDao) -> Result<Dao>;

    /// Apply `changes` to DAO `id` and return the updated row.
    async fn update_dao(&self, id: i64, changes: &DaoChanges) -> Result<Dao>;

    async fn get_dao(&self, id: i64) -> Result<Option<Dao>>;

    async fn get_dao_by_public_address(&self, address: &str) -> Result<Option<Dao>>;

    /// `(dao_id, description_embedding)` for every DAO that has one.
    async fn dao_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>>;

    async fn insert_need(&self, need: &NewNeed) -> Result<Need>;

    async fn update_need(&self, id: i64, changes: &NeedChanges) -> Result<Need>;

    async fn get_need(&self, id: i64) -> Result<Option<Need>>;

    /// Set `is_fulfilled`; `fulfilled_at` keeps its first value.
    async fn mark_need_fulfilled(&self, id: i64) -> Result<Need>;

    /// Ids of needs owned by `dao_id`.
    async fn need_ids_for_dao(&self, dao_id: i64) -> Result<Vec<i64>>;

    /// Ids of needs for which `dao_id` is the fulfilling party of a pollen row.
    async fn need_ids_fulfilled_by(&self, dao_id: i64) -> Result<Vec<i64>>;

    /// Upsert all rows in one atomic step. Existing rows keep `id` and
    /// `created_at`; every other column is overwritten.
    async fn upsert_pollen(&self, rows: &[PollenUpsert]) -> Result<()>;

    /// Delete pollen rows for `need_id` whose fulfilling DAO is not in
    /// `keep`. Returns the number of rows removed.
    async fn delete_pollen_except(&self, need_id: i64, keep: &[i64]) -> Result<u64>;

    async fn list_pollen(&self, query: &PollenQuery) -> Result<Vec<PollenDetail>>;
}

/// Reject rows that would pair a DAO with itself.
pub(crate) fn check_pollen_rows(rows: &[PollenUpsert]) -> Result<()> {
    for row in rows {
        if row.requesting_dao_id == row.fulfilling_dao_id {
            return Err(PollenError::validation(format!(
                "pollen for need {} cannot pair DAO {} with itself",
                row.need_id, row.fulfilling_dao_id
            )));
        }
    }
    Ok(())
}
