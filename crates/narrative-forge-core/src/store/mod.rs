//! Storage abstraction for the retrieval index.
//!
//! The [`VectorStore`] trait defines the operations the retrieval index
//! needs from its backing collection, enabling pluggable backends
//! (in-memory today, a persistent store supplied by the application).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Clearing followed by inserts is not atomic; callers serialize
//! rebuilds against queries on the same store.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::IndexedDocument;

/// Abstract vector store backend.
///
/// All operations are async (via `async-trait`) so network-backed
/// stores fit the same seam. In-memory implementations return
/// immediately-ready futures.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`clear`](VectorStore::clear) | Drop every stored document |
/// | [`insert`](VectorStore::insert) | Add one document |
/// | [`documents`](VectorStore::documents) | Snapshot all documents in insertion order |
/// | [`len`](VectorStore::len) | Number of stored documents |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Remove all documents.
    async fn clear(&self) -> Result<()>;

    /// Insert a document, replacing any document with the same id.
    async fn insert(&self, doc: IndexedDocument) -> Result<()>;

    /// Snapshot of all documents in insertion order.
    async fn documents(&self) -> Result<Vec<IndexedDocument>>;

    /// Number of stored documents.
    async fn len(&self) -> Result<usize>;

    /// True if the store holds no documents.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
