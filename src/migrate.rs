use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Reference entries, keyed by topic slug. Insertion order is preserved
    // via rowid and is the tiebreak order for retrieval.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            version TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Highest ingested version per logical source. Owned by the sync
    // manager; used to skip re-ingesting an unchanged source.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus_meta (
            source TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
