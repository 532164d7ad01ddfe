//! Storage abstraction for the knowledge cache.
//!
//! The [`EntryStore`] trait defines the persistence operations the sync
//! manager and retriever need, enabling pluggable backends (SQLite,
//! in-memory for tests and degraded operation).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::Entry;

pub use memory::MemoryEntryStore;
pub use sqlite::SqliteEntryStore;

/// Abstract storage backend for reference entries and per-source version
/// markers.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_all`](EntryStore::get_all) | All entries in stable insertion order |
/// | [`upsert_many`](EntryStore::upsert_many) | Idempotent batch upsert, last-write-wins per id |
/// | [`meta_version`](EntryStore::meta_version) | Highest ingested version for a source |
/// | [`set_meta_version`](EntryStore::set_meta_version) | Record an ingested source version |
///
/// Each call is atomic: a crash mid-call leaves either the old or the
/// fully-upserted state, never partial entries. Any failure of the
/// underlying storage surfaces as [`StoreError::Unavailable`]; callers
/// treat that as "no cached knowledge".
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// All entries, in insertion order. The meta records are excluded.
    async fn get_all(&self) -> Result<Vec<Entry>, StoreError>;

    /// Insert or replace entries by id, atomically. Re-ingesting an
    /// identical batch produces no observable change beyond `updated_at`.
    async fn upsert_many(&self, entries: &[Entry]) -> Result<(), StoreError>;

    /// Highest ingested version for a logical source, if any.
    async fn meta_version(&self, source: &str) -> Result<Option<String>, StoreError>;

    /// Record the ingested version for a logical source.
    async fn set_meta_version(&self, source: &str, version: &str) -> Result<(), StoreError>;
}
