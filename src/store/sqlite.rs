//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`crate::migrate`]. Timestamps are unix milliseconds; embeddings are
//! little-endian `f32` BLOBs.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{PollenError, Result};
use crate::migrate;
use crate::models::{
    from_millis, now_millis, Dao, DaoChanges, DaoSummary, Need, NeedChanges, NeedSummary, NewDao,
    NewNeed, Pollen, PollenDetail, PollenQuery, PollenUpsert,
};

use super::{check_pollen_rows, Store};

const DAO_COLUMNS: &str =
    "id, name, description, public_address, description_embedding, created_at, updated_at";

const NEED_COLUMNS: &str = "id, dao_id, description, embedding, contract_need_id, is_fulfilled, \
                            fulfilled_at, created_at, updated_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn dao_from_row(row: &SqliteRow) -> Result<Dao> {
    let embedding: Option<Vec<u8>> = row.try_get("description_embedding")?;
    Ok(Dao {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        public_address: row.try_get("public_address")?,
        description_embedding: embedding.map(|b| blob_to_vec(&b)),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn need_from_row(row: &SqliteRow) -> Result<Need> {
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let is_fulfilled: i64 = row.try_get("is_fulfilled")?;
    let fulfilled_at: Option<i64> = row.try_get("fulfilled_at")?;
    Ok(Need {
        id: row.try_get("id")?,
        dao_id: row.try_get("dao_id")?,
        description: row.try_get("description")?,
        embedding: embedding.map(|b| blob_to_vec(&b)),
        contract_need_id: row.try_get("contract_need_id")?,
        is_fulfilled: is_fulfilled != 0,
        fulfilled_at: fulfilled_at.map(from_millis),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn detail_from_row(row: &SqliteRow) -> Result<PollenDetail> {
    let pollen = Pollen {
        id: row.try_get("id")?,
        need_id: row.try_get("need_id")?,
        requesting_dao_id: row.try_get("requesting_dao_id")?,
        fulfilling_dao_id: row.try_get("fulfilling_dao_id")?,
        collaboration_description: row.try_get("collaboration_description")?,
        confidence_score: row.try_get("confidence_score")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    };
    let need_is_fulfilled: i64 = row.try_get("need_is_fulfilled")?;
    Ok(PollenDetail {
        requesting_dao: DaoSummary {
            id: pollen.requesting_dao_id,
            name: row.try_get("requesting_name")?,
            public_address: row.try_get("requesting_address")?,
        },
        fulfilling_dao: DaoSummary {
            id: pollen.fulfilling_dao_id,
            name: row.try_get("fulfilling_name")?,
            public_address: row.try_get("fulfilling_address")?,
        },
        need: NeedSummary {
            id: pollen.need_id,
            description: row.try_get("need_description")?,
            is_fulfilled: need_is_fulfilled != 0,
        },
        pollen,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_dao(&self, dao: &NewDao) -> Result<Dao> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO daos (name, description, public_address, description_embedding,
                              created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dao.name)
        .bind(&dao.description)
        .bind(&dao.public_address)
        .bind(vec_to_blob(&dao.description_embedding))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_dao(id)
            .await?
            .ok_or_else(|| PollenError::not_found("dao", id))
    }

    async fn update_dao(&self, id: i64, changes: &DaoChanges) -> Result<Dao> {
        let result = sqlx::query(
            r#"
            UPDATE daos SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                public_address = COALESCE(?, public_address),
                description_embedding = COALESCE(?, description_embedding),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&changes.name)
        .bind(&changes.description)
        .bind(&changes.public_address)
        .bind(changes.description_embedding.as_deref().map(vec_to_blob))
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PollenError::not_found("dao", id));
        }
        self.get_dao(id)
            .await?
            .ok_or_else(|| PollenError::not_found("dao", id))
    }

    async fn get_dao(&self, id: i64) -> Result<Option<Dao>> {
        let row = sqlx::query(&format!("SELECT {} FROM daos WHERE id = ?", DAO_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dao_from_row).transpose()
    }

    async fn get_dao_by_public_address(&self, address: &str) -> Result<Option<Dao>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM daos WHERE public_address = ?",
            DAO_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(dao_from_row).transpose()
    }

    async fn dao_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let rows = sqlx::query(
            "SELECT id, description_embedding FROM daos WHERE description_embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(i64, Vec<f32>)> {
                let blob: Vec<u8> = row.try_get("description_embedding")?;
                Ok((row.try_get("id")?, blob_to_vec(&blob)))
            })
            .collect()
    }

    async fn insert_need(&self, need: &NewNeed) -> Result<Need> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO needs (dao_id, description, embedding, is_fulfilled, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(need.dao_id)
        .bind(&need.description)
        .bind(vec_to_blob(&need.embedding))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_need(id)
            .await?
            .ok_or_else(|| PollenError::not_found("need", id))
    }

    async fn update_need(&self, id: i64, changes: &NeedChanges) -> Result<Need> {
        let result = sqlx::query(
            r#"
            UPDATE needs SET
                description = COALESCE(?, description),
                embedding = COALESCE(?, embedding),
                contract_need_id = COALESCE(?, contract_need_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&changes.description)
        .bind(changes.embedding.as_deref().map(vec_to_blob))
        .bind(&changes.contract_need_id)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PollenError::not_found("need", id));
        }
        self.get_need(id)
            .await?
            .ok_or_else(|| PollenError::not_found("need", id))
    }

    async fn get_need(&self, id: i64) -> Result<Option<Need>> {
        let row = sqlx::query(&format!("SELECT {} FROM needs WHERE id = ?", NEED_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(need_from_row).transpose()
    }

    async fn mark_need_fulfilled(&self, id: i64) -> Result<Need> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE needs SET
                is_fulfilled = 1,
                fulfilled_at = COALESCE(fulfilled_at, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PollenError::not_found("need", id));
        }
        self.get_need(id)
            .await?
            .ok_or_else(|| PollenError::not_found("need", id))
    }

    async fn need_ids_for_dao(&self, dao_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM needs WHERE dao_id = ? ORDER BY id")
            .bind(dao_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn need_ids_fulfilled_by(&self, dao_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT need_id FROM pollen WHERE fulfilling_dao_id = ? ORDER BY need_id",
        )
        .bind(dao_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn upsert_pollen(&self, rows: &[PollenUpsert]) -> Result<()> {
        check_pollen_rows(rows)?;
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO pollen (need_id, requesting_dao_id, fulfilling_dao_id,
                                    collaboration_description, confidence_score,
                                    created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(need_id, fulfilling_dao_id) DO UPDATE SET
                    requesting_dao_id = excluded.requesting_dao_id,
                    collaboration_description = excluded.collaboration_description,
                    confidence_score = excluded.confidence_score,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(row.need_id)
            .bind(row.requesting_dao_id)
            .bind(row.fulfilling_dao_id)
            .bind(&row.collaboration_description)
            .bind(row.confidence_score)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_pollen_except(&self, need_id: i64, keep: &[i64]) -> Result<u64> {
        let sql = if keep.is_empty() {
            "DELETE FROM pollen WHERE need_id = ?".to_string()
        } else {
            let placeholders = vec!["?"; keep.len()].join(", ");
            format!(
                "DELETE FROM pollen WHERE need_id = ? AND fulfilling_dao_id NOT IN ({})",
                placeholders
            )
        };

        let mut query = sqlx::query(&sql).bind(need_id);
        for dao_id in keep {
            query = query.bind(*dao_id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_pollen(&self, query: &PollenQuery) -> Result<Vec<PollenDetail>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.need_id, p.requesting_dao_id, p.fulfilling_dao_id,
                   p.collaboration_description, p.confidence_score,
                   p.created_at, p.updated_at,
                   rd.name AS requesting_name, rd.public_address AS requesting_address,
                   fd.name AS fulfilling_name, fd.public_address AS fulfilling_address,
                   n.description AS need_description, n.is_fulfilled AS need_is_fulfilled
            FROM pollen p
            JOIN daos rd ON rd.id = p.requesting_dao_id
            JOIN daos fd ON fd.id = p.fulfilling_dao_id
            JOIN needs n ON n.id = p.need_id
            WHERE (? IS NULL OR p.requesting_dao_id = ? OR p.fulfilling_dao_id = ?)
              AND (? IS NULL OR p.need_id = ?)
              AND (? IS NULL OR p.confidence_score >= ?)
            ORDER BY p.confidence_score DESC, p.id ASC
            "#,
        )
        .bind(query.dao_id)
        .bind(query.dao_id)
        .bind(query.dao_id)
        .bind(query.need_id)
        .bind(query.need_id)
        .bind(query.min_confidence)
        .bind(query.min_confidence)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(detail_from_row).collect()
    }
}
