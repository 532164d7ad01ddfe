//! SQLite-backed [`EntryStore`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::models::Entry;

use super::EntryStore;

pub struct SqliteEntryStore {
    pool: SqlitePool,
}

impl SqliteEntryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntryStore for SqliteEntryStore {
    async fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
        // rowid order keeps retrieval tiebreaks stable across runs.
        let rows = sqlx::query("SELECT id, content, version, updated_at FROM entries ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Entry {
                id: row.get("id"),
                content: row.get("content"),
                version: row.get("version"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    async fn upsert_many(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO entries (id, content, version, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    version = excluded.version,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.content)
            .bind(&entry.version)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn meta_version(&self, source: &str) -> Result<Option<String>, StoreError> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT version FROM corpus_meta WHERE source = ?")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    async fn set_meta_version(&self, source: &str, version: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO corpus_meta (source, version, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(version)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
