//! In-memory [`EntryStore`] for tests and degraded (storage-less) operation.
//!
//! Entries live in a `Vec` behind `std::sync::RwLock`, preserving insertion
//! order so retrieval tiebreaks match the SQLite backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::Entry;

use super::EntryStore;

pub struct MemoryEntryStore {
    entries: RwLock<Vec<Entry>>,
    meta: RwLock<HashMap<String, String>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            meta: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get_all(&self) -> Result<Vec<Entry>, StoreError> {
        Ok(self.entries.read().unwrap().clone())
    }

    async fn upsert_many(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let mut stored = self.entries.write().unwrap();
        for entry in entries {
            match stored.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry.clone(),
                None => stored.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn meta_version(&self, source: &str) -> Result<Option<String>, StoreError> {
        Ok(self.meta.read().unwrap().get(source).cloned())
    }

    async fn set_meta_version(&self, source: &str, version: &str) -> Result<(), StoreError> {
        self.meta
            .write()
            .unwrap()
            .insert(source.to_string(), version.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, content: &str) -> Entry {
        Entry {
            id: id.to_string(),
            content: content.to_string(),
            version: "1".to_string(),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryEntryStore::new();
        let e = entry("burns", "cool the burn under running water");

        store.upsert_many(std::slice::from_ref(&e)).await.unwrap();
        store.upsert_many(std::slice::from_ref(&e)).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], e);
    }

    #[tokio::test]
    async fn upsert_preserves_insertion_order() {
        let store = MemoryEntryStore::new();
        store
            .upsert_many(&[entry("a", "x"), entry("b", "y"), entry("c", "z")])
            .await
            .unwrap();
        // Updating "a" must not move it to the end.
        store.upsert_many(&[entry("a", "x2")]).await.unwrap();

        let all = store.get_all().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn meta_version_round_trip() {
        let store = MemoryEntryStore::new();
        assert_eq!(store.meta_version("core").await.unwrap(), None);
        store.set_meta_version("core", "1.0.0").await.unwrap();
        assert_eq!(
            store.meta_version("core").await.unwrap(),
            Some("1.0.0".to_string())
        );
    }
}
