//! In-memory [`VectorStore`] implementation.
//!
//! Documents live in a `Vec` behind `std::sync::RwLock`, with an id index
//! so re-inserting an id replaces in place. Search is brute force in the
//! retrieval index, so the store only needs ordered snapshots.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::IndexedDocument;

use super::VectorStore;

#[derive(Default)]
struct Inner {
    docs: Vec<IndexedDocument>,
    positions: HashMap<String, usize>,
}

/// In-memory store, the default backend of the retrieval index.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn clear(&self) -> Result<()> {
        let mut inner = self.write();
        inner.docs.clear();
        inner.positions.clear();
        Ok(())
    }

    async fn insert(&self, doc: IndexedDocument) -> Result<()> {
        let mut inner = self.write();
        match inner.positions.get(&doc.id).copied() {
            Some(pos) => inner.docs[pos] = doc,
            None => {
                let pos = inner.docs.len();
                inner.positions.insert(doc.id.clone(), pos);
                inner.docs.push(doc);
            }
        }
        Ok(())
    }

    async fn documents(&self) -> Result<Vec<IndexedDocument>> {
        Ok(self.read().docs.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.read().docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn doc(id: &str, content: &str) -> IndexedDocument {
        IndexedDocument {
            id: id.to_string(),
            content: content.to_string(),
            metadata: DocumentMetadata {
                source: "test".to_string(),
                chunk_index: 0,
                character_mentions: Vec::new(),
                scene_type: None,
                importance: 5,
            },
            embedding: vec![1.0, 0.0],
        }
    }

    #[tokio::test]
    async fn test_insert_and_snapshot_preserve_order() {
        let store = InMemoryStore::new();
        store.insert(doc("b", "second")).await.unwrap();
        store.insert(doc("a", "first")).await.unwrap();
        let ids: Vec<String> = store
            .documents()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_insert_same_id_replaces() {
        let store = InMemoryStore::new();
        store.insert(doc("a", "old")).await.unwrap();
        store.insert(doc("a", "new")).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.documents().await.unwrap()[0].content, "new");
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryStore::new();
        store.insert(doc("a", "x")).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_reinsert_after_clear_starts_fresh() {
        let store = InMemoryStore::new();
        store.insert(doc("a", "x")).await.unwrap();
        store.insert(doc("b", "y")).await.unwrap();
        store.clear().await.unwrap();

        store.insert(doc("b", "fresh")).await.unwrap();
        store.insert(doc("c", "z")).await.unwrap();
        store.insert(doc("b", "replaced")).await.unwrap();
        let docs = store.documents().await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(docs[0].content, "replaced");
    }

    #[tokio::test]
    async fn test_many_distinct_ids_keep_insertion_order() {
        let store = InMemoryStore::new();
        for i in 0..500 {
            store.insert(doc(&format!("chunk_{i}"), "text")).await.unwrap();
        }
        let docs = store.documents().await.unwrap();
        assert_eq!(docs.len(), 500);
        assert_eq!(docs[0].id, "chunk_0");
        assert_eq!(docs[499].id, "chunk_499");
    }
}
