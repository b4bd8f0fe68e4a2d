use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            public_address TEXT NOT NULL UNIQUE,
            description_embedding BLOB,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS needs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dao_id INTEGER NOT NULL,
            description TEXT NOT NULL,
            embedding BLOB,
            contract_need_id TEXT,
            is_fulfilled INTEGER NOT NULL DEFAULT 0,
            fulfilled_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (dao_id) REFERENCES daos(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (need, fulfilling DAO); a DAO never matches its own need.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pollen (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            need_id INTEGER NOT NULL,
            requesting_dao_id INTEGER NOT NULL,
            fulfilling_dao_id INTEGER NOT NULL,
            collaboration_description TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(need_id, fulfilling_dao_id),
            CHECK (requesting_dao_id <> fulfilling_dao_id),
            FOREIGN KEY (need_id) REFERENCES needs(id),
            FOREIGN KEY (requesting_dao_id) REFERENCES daos(id),
            FOREIGN KEY (fulfilling_dao_id) REFERENCES daos(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_needs_dao_id ON needs(dao_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pollen_fulfilling_dao_id ON pollen(fulfilling_dao_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pollen_requesting_dao_id ON pollen(requesting_dao_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
